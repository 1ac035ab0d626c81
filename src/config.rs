//! Configuration parsing and validation.
//!
//! Corpus Harness is configured via a TOML file (default
//! `./config/corpus.toml`). Only `[db]`, `[source]` and `[refine]` are
//! required; every other section has defaults.
//!
//! # Example
//!
//! ```toml
//! [db]
//! path = "./data/corpus.sqlite"
//!
//! [source]
//! root = "./sources"
//! include_globs = ["**/*.pdf", "**/*.pptx", "**/*.md"]
//!
//! [refine]
//! output_dir = "./data/refined"
//! timeout_secs = 120
//!
//! [chunking]
//! max_tokens = 700
//! overlap_tokens = 80
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-small"
//! dims = 1536
//! max_retries = 3
//!
//! [pipeline]
//! concurrency = 10
//! ```

use anyhow::{bail, Context, Result};
use corpus_harness_core::chunk::ChunkingPolicy;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub source: SourceConfig,
    pub refine: RefineConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// The source directory holding raw documents.
#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

fn default_include_globs() -> Vec<String> {
    [
        "**/*.pdf",
        "**/*.pptx",
        "**/*.docx",
        "**/*.xlsx",
        "**/*.md",
        "**/*.txt",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Where refined derivatives go and how long conversion may take.
#[derive(Debug, Deserialize, Clone)]
pub struct RefineConfig {
    pub output_dir: PathBuf,
    #[serde(default = "default_refine_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
}

fn default_refine_timeout_secs() -> u64 {
    120
}
fn default_max_file_bytes() -> u64 {
    50 * 1024 * 1024
}

impl RefineConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_overlap")]
    pub overlap_tokens: usize,
}

fn default_max_tokens() -> usize {
    700
}
fn default_overlap() -> usize {
    80
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            overlap_tokens: default_overlap(),
        }
    }
}

impl ChunkingConfig {
    pub fn policy(&self) -> ChunkingPolicy {
        ChunkingPolicy {
            max_tokens: self.max_tokens,
            overlap_tokens: self.overlap_tokens,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_retry_base_delay_ms() -> u64 {
    1000
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Bulk operation tuning.
#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Documents processed concurrently by `ingest --all` and `reprocess`.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_concurrency() -> usize {
    10
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
        }
    }
}

impl Config {
    /// A config rooted at `base` with all defaults, for tests and scratch use.
    pub fn minimal(base: &Path) -> Self {
        Self {
            db: DbConfig {
                path: base.join("data").join("corpus.sqlite"),
            },
            source: SourceConfig {
                root: base.join("sources"),
                include_globs: default_include_globs(),
                exclude_globs: Vec::new(),
                follow_symlinks: false,
            },
            refine: RefineConfig {
                output_dir: base.join("data").join("refined"),
                timeout_secs: default_refine_timeout_secs(),
                max_file_bytes: default_max_file_bytes(),
            },
            chunking: ChunkingConfig::default(),
            embedding: EmbeddingConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }

    /// Check cross-field invariants.
    pub fn validate(&self) -> Result<()> {
        if self.chunking.max_tokens == 0 {
            bail!("chunking.max_tokens must be > 0");
        }
        if self.chunking.overlap_tokens >= self.chunking.max_tokens {
            bail!("chunking.overlap_tokens must be smaller than chunking.max_tokens");
        }
        if self.pipeline.concurrency == 0 {
            bail!("pipeline.concurrency must be >= 1");
        }
        if self.refine.timeout_secs == 0 {
            bail!("refine.timeout_secs must be > 0");
        }
        if self.embedding.batch_size == 0 {
            bail!("embedding.batch_size must be >= 1");
        }
        if self.embedding.timeout_secs == 0 {
            bail!("embedding.timeout_secs must be > 0");
        }

        if self.embedding.is_enabled() {
            if self.embedding.dims.is_none() || self.embedding.dims == Some(0) {
                bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    self.embedding.provider
                );
            }
            if self.embedding.model.is_none() {
                bail!(
                    "embedding.model must be specified when provider is '{}'",
                    self.embedding.provider
                );
            }
        }

        match self.embedding.provider.as_str() {
            "disabled" | "openai" => {}
            other => bail!(
                "Unknown embedding provider: '{}'. Must be disabled or openai.",
                other
            ),
        }

        Ok(())
    }
}

/// Load and validate the configuration file at `path`.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = r#"
[db]
path = "/tmp/corpus.sqlite"

[source]
root = "/tmp/sources"

[refine]
output_dir = "/tmp/refined"
"#;

    #[test]
    fn test_defaults_applied() {
        let cfg = parse_config(BASE).unwrap();
        assert_eq!(cfg.chunking.max_tokens, 700);
        assert_eq!(cfg.chunking.overlap_tokens, 80);
        assert_eq!(cfg.pipeline.concurrency, 10);
        assert_eq!(cfg.embedding.max_retries, 3);
        assert_eq!(cfg.refine.timeout_secs, 120);
        assert!(!cfg.embedding.is_enabled());
        assert!(cfg.source.include_globs.contains(&"**/*.pptx".to_string()));
    }

    #[test]
    fn test_overlap_must_be_smaller_than_chunk() {
        let toml = format!("{}\n[chunking]\nmax_tokens = 10\noverlap_tokens = 10\n", BASE);
        let err = parse_config(&toml).unwrap_err();
        assert!(err.to_string().contains("overlap_tokens"));
    }

    #[test]
    fn test_enabled_provider_requires_model_and_dims() {
        let toml = format!("{}\n[embedding]\nprovider = \"openai\"\n", BASE);
        let err = parse_config(&toml).unwrap_err();
        assert!(err.to_string().contains("embedding.dims"));
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let toml = format!(
            "{}\n[embedding]\nprovider = \"magic\"\nmodel = \"m\"\ndims = 3\n",
            BASE
        );
        assert!(parse_config(&toml).is_err());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let toml = format!("{}\n[pipeline]\nconcurrency = 0\n", BASE);
        assert!(parse_config(&toml).is_err());
    }
}
