//! Tool configuration.
//!
//! Loaded from `config.toml` under the user config directory; a default
//! file is written on first run. Only artifact locations and the model
//! source are configurable — the taxonomy itself is fixed at build time.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const MODEL_REPO: &str = "https://huggingface.co/RuteNL/MobileCLIP2-S2-OpenCLIP-ONNX/resolve/main";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub model: ModelConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Directory both artifacts are written to (created if absent)
    pub directory: PathBuf,
    /// File name of the consolidated visual encoder graph
    pub visual_file: String,
    /// File name of the packed text-embedding cache
    pub embeddings_file: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("assets/models"),
            visual_file: "mobileclip_visual.onnx".to_string(),
            embeddings_file: "nursing_text_embeddings.bin".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Visual encoder graph URL
    pub visual_url: String,
    /// External-data sibling of the visual graph; absent on the host when
    /// the export is already self-contained
    pub visual_data_url: Option<String>,
    /// Text encoder graph URL
    pub text_url: String,
    /// Tokenizer definition URL
    pub tokenizer_url: String,
    /// Export metadata (config.json) URL
    pub config_url: String,
    /// Threads per ONNX Runtime session
    pub intra_threads: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            visual_url: format!("{MODEL_REPO}/visual.onnx"),
            visual_data_url: Some(format!("{MODEL_REPO}/visual.onnx_data")),
            text_url: format!("{MODEL_REPO}/text.onnx"),
            tokenizer_url: format!("{MODEL_REPO}/tokenizer.json"),
            config_url: format!("{MODEL_REPO}/config.json"),
            intra_threads: 4,
        }
    }
}

impl Config {
    pub fn config_path() -> PathBuf {
        directories::ProjectDirs::from("com", "triagevision", "triage-export")
            .map(|dirs| dirs.config_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."))
            .join("config.toml")
    }

    /// Load the default config file, creating it with defaults if missing.
    pub fn load() -> Result<Self> {
        let path = Self::config_path();

        if path.exists() {
            Self::read(&path)
        } else {
            let config = Config::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    /// Load an explicitly named config file; missing is an error here.
    pub fn load_from(path: &Path) -> Result<Self> {
        Self::read(path)
    }

    fn read(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config = toml::from_str(&data)
            .with_context(|| format!("invalid config {}", path.display()))?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let data = toml::to_string_pretty(self)?;
        fs::write(path, data)?;

        Ok(())
    }

    /// Full path of the visual encoder artifact.
    pub fn visual_path(&self) -> PathBuf {
        self.output.directory.join(&self.output.visual_file)
    }

    /// Full path of the packed embeddings artifact.
    pub fn embeddings_path(&self) -> PathBuf {
        self.output.directory.join(&self.output.embeddings_file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_roundtrip_through_toml() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();

        assert_eq!(parsed.output.directory, PathBuf::from("assets/models"));
        assert_eq!(parsed.output.embeddings_file, "nursing_text_embeddings.bin");
        assert_eq!(parsed.model.intra_threads, 4);
        assert!(parsed.model.visual_url.ends_with("visual.onnx"));
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let parsed: Config = toml::from_str("[output]\ndirectory = \"out\"\nvisual_file = \"v.onnx\"\nembeddings_file = \"e.bin\"\n").unwrap();
        assert_eq!(parsed.output.directory, PathBuf::from("out"));
        assert!(parsed.model.text_url.ends_with("text.onnx"));
    }
}
