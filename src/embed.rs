//! Per-category text embedding generation.
//!
//! Drives the text encoder over every label in the taxonomy, one batch per
//! category, and L2-normalizes each embedding row. Unit-norm rows are a
//! correctness requirement for the downstream client, which scores labels
//! with a plain dot product against the image embedding.

use anyhow::{ensure, Context, Result};
use ndarray::Array2;

use crate::encoder::TextEncoder;
use crate::taxonomy::Taxonomy;

/// Ordered mapping from category name to its `(num_labels, embed_dim)`
/// matrix of unit-norm label embeddings. Built once by
/// [`compute_embeddings`], consumed once by the packer.
#[derive(Debug, Default)]
pub struct EmbeddingBundle {
    entries: Vec<(String, Array2<f32>)>,
}

impl EmbeddingBundle {
    /// Build a bundle from pre-computed matrices, enforcing a consistent
    /// embedding dimension across entries.
    #[allow(dead_code)]
    pub fn from_entries(entries: Vec<(String, Array2<f32>)>) -> Result<Self> {
        let mut bundle = Self::default();
        for (name, matrix) in entries {
            bundle.push(name, matrix)?;
        }
        Ok(bundle)
    }

    fn push(&mut self, name: String, matrix: Array2<f32>) -> Result<()> {
        if let Some(dim) = self.embed_dim() {
            ensure!(
                matrix.ncols() == dim,
                "embedding dimension changed from {} to {} at category '{}'",
                dim,
                matrix.ncols(),
                name
            );
        }
        self.entries.push((name, matrix));
        Ok(())
    }

    /// Entries in insertion (taxonomy) order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Array2<f32>)> {
        self.entries.iter().map(|(name, m)| (name.as_str(), m))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Embedding dimensionality, read from the first entry. The encoder is
    /// shared, so this is the dimension of every entry.
    pub fn embed_dim(&self) -> Option<usize> {
        self.entries.first().map(|(_, m)| m.ncols())
    }
}

/// Encode every label in the taxonomy and group the unit-norm embeddings
/// by category, preserving taxonomy order.
pub fn compute_embeddings(
    taxonomy: &Taxonomy,
    encoder: &mut dyn TextEncoder,
) -> Result<EmbeddingBundle> {
    let mut bundle = EmbeddingBundle::default();

    for category in taxonomy.categories() {
        let labels: Vec<&str> = category.labels.iter().map(String::as_str).collect();
        let raw = encoder
            .encode_batch(&labels)
            .with_context(|| format!("failed to encode labels for category '{}'", category.name))?;
        ensure!(
            raw.nrows() == labels.len(),
            "encoder returned {} rows for {} labels in category '{}'",
            raw.nrows(),
            labels.len(),
            category.name
        );

        let normalized = l2_normalize_rows(raw)
            .with_context(|| format!("invalid embeddings for category '{}'", category.name))?;
        eprintln!(
            "  {}: ({}, {})",
            category.name,
            normalized.nrows(),
            normalized.ncols()
        );
        bundle.push(category.name.clone(), normalized)?;
    }

    Ok(bundle)
}

/// Scale each row to unit L2 norm. A zero or non-finite row means the
/// encoder produced garbage, which aborts the run.
fn l2_normalize_rows(mut matrix: Array2<f32>) -> Result<Array2<f32>> {
    for (i, mut row) in matrix.rows_mut().into_iter().enumerate() {
        let norm = row.iter().map(|v| v * v).sum::<f32>().sqrt();
        ensure!(
            norm.is_finite() && norm > 0.0,
            "embedding row {} has unusable L2 norm {}",
            i,
            norm
        );
        row.mapv_inplace(|v| v / norm);
    }
    Ok(matrix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::taxonomy::{Category, Taxonomy};

    /// Deterministic stand-in for the ONNX text encoder: each label maps to
    /// a vector derived from its bytes, far from unit norm.
    struct FakeEncoder {
        dim: usize,
    }

    impl TextEncoder for FakeEncoder {
        fn encode_batch(&mut self, labels: &[&str]) -> Result<Array2<f32>> {
            let mut matrix = Array2::zeros((labels.len(), self.dim));
            for (row, label) in labels.iter().enumerate() {
                let seed: u32 = label.bytes().map(u32::from).sum();
                for col in 0..self.dim {
                    matrix[[row, col]] = ((seed + col as u32) % 17 + 1) as f32;
                }
            }
            Ok(matrix)
        }
    }

    /// Encoder whose output dimension drifts between calls.
    struct DriftingEncoder {
        calls: usize,
    }

    impl TextEncoder for DriftingEncoder {
        fn encode_batch(&mut self, labels: &[&str]) -> Result<Array2<f32>> {
            self.calls += 1;
            let dim = if self.calls == 1 { 4 } else { 5 };
            Ok(Array2::ones((labels.len(), dim)))
        }
    }

    fn taxonomy(entries: &[(&str, &[&str])]) -> Taxonomy {
        Taxonomy::new(
            entries
                .iter()
                .map(|(name, labels)| Category {
                    name: name.to_string(),
                    labels: labels.iter().map(|l| l.to_string()).collect(),
                })
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_rows_are_unit_norm() {
        let taxonomy = Taxonomy::nursing();
        let mut encoder = FakeEncoder { dim: 64 };
        let bundle = compute_embeddings(&taxonomy, &mut encoder).unwrap();

        for (name, matrix) in bundle.iter() {
            for row in matrix.rows() {
                let norm: f32 = row.iter().map(|x| x * x).sum::<f32>().sqrt();
                assert!(
                    (norm - 1.0).abs() < 1e-5,
                    "Category '{}' row should be normalized (norm = {})",
                    name,
                    norm
                );
            }
        }
    }

    #[test]
    fn test_bundle_preserves_taxonomy_order_and_shapes() {
        let taxonomy = Taxonomy::nursing();
        let mut encoder = FakeEncoder { dim: 32 };
        let bundle = compute_embeddings(&taxonomy, &mut encoder).unwrap();

        let shapes: Vec<(&str, usize, usize)> = bundle
            .iter()
            .map(|(name, m)| (name, m.nrows(), m.ncols()))
            .collect();
        assert_eq!(
            shapes,
            vec![
                ("position", 8, 32),
                ("alertness", 5, 32),
                ("activity", 5, 32),
                ("comfort", 5, 32),
                ("safety", 5, 32),
            ]
        );
        assert_eq!(bundle.embed_dim(), Some(32));
    }

    #[test]
    fn test_dimension_drift_aborts() {
        let taxonomy = taxonomy(&[("a", &["x"]), ("b", &["y"])]);
        let mut encoder = DriftingEncoder { calls: 0 };
        let err = compute_embeddings(&taxonomy, &mut encoder).unwrap_err();
        assert!(
            err.to_string().contains("dimension"),
            "unexpected error: {err:#}"
        );
    }

    #[test]
    fn test_zero_vector_aborts() {
        struct ZeroEncoder;
        impl TextEncoder for ZeroEncoder {
            fn encode_batch(&mut self, labels: &[&str]) -> Result<Array2<f32>> {
                Ok(Array2::zeros((labels.len(), 8)))
            }
        }

        let taxonomy = taxonomy(&[("a", &["x"])]);
        let err = compute_embeddings(&taxonomy, &mut ZeroEncoder).unwrap_err();
        assert!(err.to_string().contains("category 'a'"));
    }

    #[test]
    fn test_from_entries_rejects_mixed_dims() {
        let result = EmbeddingBundle::from_entries(vec![
            ("a".to_string(), Array2::ones((2, 4))),
            ("b".to_string(), Array2::ones((3, 5))),
        ]);
        assert!(result.is_err());
    }
}
