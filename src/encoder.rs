//! Text encoding via ONNX Runtime.
//!
//! Wraps the exported MobileCLIP text graph plus its tokenizer behind a
//! small trait so the embedding generator can be driven by a deterministic
//! stand-in under test.

use anyhow::{anyhow, ensure, Context, Result};
use ndarray::{Array2, Ix2};
use ort::session::Session;
use ort::value::Tensor;
use std::path::Path;
use tokenizers::{PaddingParams, PaddingStrategy, Tokenizer, TruncationParams};

/// A text encoder producing one raw embedding row per input label.
pub trait TextEncoder {
    /// Encode a batch of labels in order. Row `i` of the result is the raw
    /// (not yet normalized) embedding of `labels[i]`.
    fn encode_batch(&mut self, labels: &[&str]) -> Result<Array2<f32>>;
}

/// ONNX Runtime text encoder for the exported MobileCLIP text graph.
pub struct OrtTextEncoder {
    session: Session,
    tokenizer: Tokenizer,
    ids_input: String,
    wants_mask: bool,
    output_name: String,
}

impl OrtTextEncoder {
    /// Load the text graph and tokenizer. Token sequences are padded and
    /// truncated to `context_length`, the fixed width the graph was
    /// exported with.
    pub fn load(
        model_path: &Path,
        tokenizer_path: &Path,
        context_length: usize,
        intra_threads: usize,
    ) -> Result<Self> {
        let session = Session::builder()?
            .with_intra_threads(intra_threads)?
            .commit_from_file(model_path)
            .with_context(|| format!("failed to load text model {}", model_path.display()))?;

        let mut tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|e| anyhow!("failed to load tokenizer {}: {e}", tokenizer_path.display()))?;
        tokenizer.with_padding(Some(PaddingParams {
            strategy: PaddingStrategy::Fixed(context_length),
            ..Default::default()
        }));
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: context_length,
                ..Default::default()
            }))
            .map_err(|e| anyhow!("failed to configure truncation: {e}"))?;

        let ids_input = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .ok_or_else(|| anyhow!("text model declares no inputs"))?;
        let wants_mask = session
            .inputs
            .iter()
            .any(|input| input.name == "attention_mask");
        let output_name = session
            .outputs
            .first()
            .map(|output| output.name.clone())
            .ok_or_else(|| anyhow!("text model declares no outputs"))?;

        Ok(Self {
            session,
            tokenizer,
            ids_input,
            wants_mask,
            output_name,
        })
    }

    fn tokenize(&self, labels: &[&str]) -> Result<(Array2<i64>, Array2<i64>)> {
        let encodings = self
            .tokenizer
            .encode_batch(labels.to_vec(), true)
            .map_err(|e| anyhow!("tokenization failed: {e}"))?;

        let width = encodings
            .first()
            .map(|e| e.get_ids().len())
            .ok_or_else(|| anyhow!("empty tokenizer batch"))?;
        let mut ids = Array2::<i64>::zeros((encodings.len(), width));
        let mut mask = Array2::<i64>::zeros((encodings.len(), width));

        for (row, encoding) in encodings.iter().enumerate() {
            ensure!(
                encoding.get_ids().len() == width,
                "tokenizer produced ragged rows despite fixed padding"
            );
            for (col, &id) in encoding.get_ids().iter().enumerate() {
                ids[[row, col]] = i64::from(id);
            }
            for (col, &m) in encoding.get_attention_mask().iter().enumerate() {
                mask[[row, col]] = i64::from(m);
            }
        }

        Ok((ids, mask))
    }
}

impl TextEncoder for OrtTextEncoder {
    fn encode_batch(&mut self, labels: &[&str]) -> Result<Array2<f32>> {
        let (ids, mask) = self.tokenize(labels)?;

        let outputs = if self.wants_mask {
            self.session.run(ort::inputs![
                self.ids_input.as_str() => Tensor::from_array(ids)?,
                "attention_mask" => Tensor::from_array(mask)?,
            ])?
        } else {
            self.session.run(ort::inputs![
                self.ids_input.as_str() => Tensor::from_array(ids)?,
            ])?
        };

        let embeddings = outputs[self.output_name.as_str()]
            .try_extract_array::<f32>()
            .context("text model output is not an f32 tensor")?;
        let embeddings = embeddings
            .into_dimensionality::<Ix2>()
            .context("text model output is not a (batch, dim) matrix")?;

        Ok(embeddings.to_owned())
    }
}
