//! Model acquisition and caching.
//!
//! Downloads the pretrained MobileCLIP ONNX export from HuggingFace on
//! first use. The text graph, tokenizer and model config are cached under
//! the user cache directory and reused across runs; the visual graph is
//! staged fresh for consolidation and cleaned up afterwards.

use anyhow::{anyhow, Context, Result};
use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::StatusCode;
use serde::Deserialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::config::ModelConfig;
use crate::visual::StagedVisual;

/// Metadata shipped alongside the ONNX export (`config.json`).
#[derive(Debug, Clone, Deserialize)]
pub struct ModelSpec {
    /// Native square input resolution of the visual encoder
    #[serde(default = "default_image_size")]
    pub image_size: u32,
    /// Fixed token-sequence width the text graph was exported with
    #[serde(default = "default_context_length")]
    pub context_length: usize,
}

fn default_image_size() -> u32 {
    256
}

fn default_context_length() -> usize {
    77
}

impl ModelSpec {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read model config {}", path.display()))?;
        let spec = serde_json::from_str(&content)
            .with_context(|| format!("invalid model config {}", path.display()))?;
        Ok(spec)
    }
}

/// Local paths of the cached text-encoding assets.
pub struct TextModelPaths {
    pub model: PathBuf,
    pub tokenizer: PathBuf,
    pub spec: ModelSpec,
}

/// Model cache directory manager
pub struct ModelManager {
    cache_dir: PathBuf,
    config: ModelConfig,
    client: reqwest::Client,
}

impl ModelManager {
    pub fn new(config: &ModelConfig) -> Self {
        let cache_dir = directories::ProjectDirs::from("com", "triagevision", "triage-export")
            .map(|dirs| dirs.cache_dir().join("models"))
            .unwrap_or_else(|| PathBuf::from("/tmp/triage-export/models"));

        Self {
            cache_dir,
            config: config.clone(),
            client: reqwest::Client::new(),
        }
    }

    /// Ensure the text graph, tokenizer and model config are present in the
    /// cache, downloading whatever is missing.
    pub async fn ensure_text_models(&self) -> Result<TextModelPaths> {
        fs::create_dir_all(&self.cache_dir)?;

        let model = self.cache_dir.join("clip_text.onnx");
        let tokenizer = self.cache_dir.join("tokenizer.json");
        let spec_path = self.cache_dir.join("config.json");

        for (url, dest, name) in [
            (&self.config.text_url, &model, "text encoder"),
            (&self.config.tokenizer_url, &tokenizer, "tokenizer"),
            (&self.config.config_url, &spec_path, "model config"),
        ] {
            if dest.exists() {
                debug!("using cached {name} at {}", dest.display());
            } else {
                self.download(url, dest, name).await?;
            }
        }

        let spec = ModelSpec::from_file(&spec_path)?;
        Ok(TextModelPaths {
            model,
            tokenizer,
            spec,
        })
    }

    /// Stage the raw visual export into `staging_dir`: the graph file plus,
    /// when the export is split, its external-data sibling. The sibling is
    /// saved under its URL file name, which is the relative location the
    /// graph records for it. A 404 for the sibling means the export is
    /// already self-contained.
    pub async fn stage_visual(&self, staging_dir: &Path) -> Result<StagedVisual> {
        fs::create_dir_all(staging_dir)
            .with_context(|| format!("failed to create staging dir {}", staging_dir.display()))?;

        let graph = staging_dir.join(file_name_from_url(&self.config.visual_url)?);
        self.download(&self.config.visual_url, &graph, "visual encoder")
            .await?;

        let mut aux = Vec::new();
        if let Some(data_url) = &self.config.visual_data_url {
            let dest = staging_dir.join(file_name_from_url(data_url)?);
            if self
                .download_optional(data_url, &dest, "visual external data")
                .await?
            {
                aux.push(dest);
            }
        }

        Ok(StagedVisual { graph, aux })
    }

    async fn download(&self, url: &str, dest: &Path, name: &str) -> Result<()> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("failed to request {name}"))?
            .error_for_status()
            .with_context(|| format!("failed to download {name} from {url}"))?;
        self.stream_to_file(response, dest, name).await
    }

    async fn download_optional(&self, url: &str, dest: &Path, name: &str) -> Result<bool> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("failed to request {name}"))?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!("no {name} at {url}; export is self-contained");
            return Ok(false);
        }
        let response = response
            .error_for_status()
            .with_context(|| format!("failed to download {name} from {url}"))?;
        self.stream_to_file(response, dest, name).await?;
        Ok(true)
    }

    async fn stream_to_file(
        &self,
        response: reqwest::Response,
        dest: &Path,
        name: &str,
    ) -> Result<()> {
        eprintln!("Downloading {name}...");

        let total_size = response.content_length().unwrap_or(0);
        let pb = ProgressBar::new(total_size);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
                .unwrap()
                .progress_chars("#>-"),
        );

        // Stream into a sibling .part file, renamed only once complete, so
        // an aborted download is never mistaken for a cached file.
        let file_name = dest
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("download");
        let part = dest.with_file_name(format!("{file_name}.part"));

        let mut file = fs::File::create(&part)
            .with_context(|| format!("failed to create {}", part.display()))?;
        let mut stream = response.bytes_stream();
        let mut downloaded: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("error downloading chunk")?;
            file.write_all(&chunk)?;
            downloaded += chunk.len() as u64;
            pb.set_position(downloaded);
        }

        file.flush()?;
        drop(file);
        fs::rename(&part, dest)?;

        pb.finish_with_message("Download complete");
        eprintln!("Saved to {}", dest.display());

        Ok(())
    }
}

fn file_name_from_url(url: &str) -> Result<&str> {
    url.rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .ok_or_else(|| anyhow!("cannot derive a file name from url {url}"))
}
