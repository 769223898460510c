//! TOML configuration.
//!
//! Every section except `[db]` may be omitted; defaults are supplied by the
//! `default_*` functions below. [`load_config`] parses and validates.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use kbase_core::embedding::EmbeddingBinding;
use kbase_core::scoring::{FetchParams, MIN_BREADTH_FACTOR};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub translation: TranslationConfig,
    #[serde(default)]
    pub table: TableConfig,
    #[serde(default)]
    pub rebuild: RebuildConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub loader: LoaderConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl Config {
    /// A default configuration storing its database at `db_path`.
    pub fn with_db_path(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            chunking: ChunkingConfig::default(),
            retrieval: RetrievalConfig::default(),
            embedding: EmbeddingConfig::default(),
            translation: TranslationConfig::default(),
            table: TableConfig::default(),
            rebuild: RebuildConfig::default(),
            lock: LockConfig::default(),
            loader: LoaderConfig::default(),
            server: ServerConfig::default(),
        }
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.chunking.max_tokens == 0 {
            anyhow::bail!("chunking.max_tokens must be > 0");
        }

        let r = &self.retrieval;
        if r.default_k < 1 {
            anyhow::bail!("retrieval.default_k must be >= 1");
        }
        if r.max_k < r.default_k {
            anyhow::bail!("retrieval.max_k must be >= retrieval.default_k");
        }
        if r.global_multiplier < MIN_BREADTH_FACTOR {
            anyhow::bail!(
                "retrieval.global_multiplier must be >= {}",
                MIN_BREADTH_FACTOR
            );
        }
        if r.filtered_multiplier < MIN_BREADTH_FACTOR {
            anyhow::bail!(
                "retrieval.filtered_multiplier must be >= {}",
                MIN_BREADTH_FACTOR
            );
        }
        if !(r.global_ratio > 0.0 && r.global_ratio <= 1.0) {
            anyhow::bail!("retrieval.global_ratio must be in (0.0, 1.0]");
        }
        if r.max_fetch_k < r.min_fetch_k {
            anyhow::bail!("retrieval.max_fetch_k must be >= retrieval.min_fetch_k");
        }

        let e = &self.embedding;
        match e.provider.as_str() {
            "disabled" | "openai" | "ollama" | "local" => {}
            other => anyhow::bail!(
                "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or local.",
                other
            ),
        }
        if e.is_enabled() {
            if e.dims.is_none() || e.dims == Some(0) {
                anyhow::bail!("embedding.dims must be > 0 when provider is '{}'", e.provider);
            }
            if e.model.is_none() {
                anyhow::bail!(
                    "embedding.model must be specified when provider is '{}'",
                    e.provider
                );
            }
        }
        if e.batch_size == 0 {
            anyhow::bail!("embedding.batch_size must be > 0");
        }

        match self.translation.provider.as_str() {
            "disabled" | "openai" | "ollama" => {}
            other => anyhow::bail!(
                "Unknown translation provider: '{}'. Must be disabled, openai, or ollama.",
                other
            ),
        }
        if self.translation.is_enabled() && self.translation.model.is_none() {
            anyhow::bail!(
                "translation.model must be specified when provider is '{}'",
                self.translation.provider
            );
        }

        if self.rebuild.concurrency == 0 {
            anyhow::bail!("rebuild.concurrency must be > 0");
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_max_tokens() -> usize {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_k")]
    pub default_k: usize,
    /// Upper bound on `k` for any single search.
    #[serde(default = "default_max_k")]
    pub max_k: usize,
    #[serde(default = "default_multiplier")]
    pub global_multiplier: usize,
    #[serde(default = "default_global_ratio")]
    pub global_ratio: f64,
    #[serde(default = "default_min_fetch_k")]
    pub min_fetch_k: usize,
    #[serde(default = "default_max_fetch_k")]
    pub max_fetch_k: usize,
    #[serde(default = "default_filtered_multiplier")]
    pub filtered_multiplier: usize,
    #[serde(default = "default_fuzzy_filter_limit")]
    pub fuzzy_filter_limit: usize,
    /// Language the indexed corpus is written in.
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_true")]
    pub cross_language: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_k: default_k(),
            max_k: default_max_k(),
            global_multiplier: default_multiplier(),
            global_ratio: default_global_ratio(),
            min_fetch_k: default_min_fetch_k(),
            max_fetch_k: default_max_fetch_k(),
            filtered_multiplier: default_filtered_multiplier(),
            fuzzy_filter_limit: default_fuzzy_filter_limit(),
            language: default_language(),
            cross_language: true,
        }
    }
}

impl RetrievalConfig {
    pub fn fetch_params(&self) -> FetchParams {
        FetchParams {
            global_multiplier: self.global_multiplier,
            global_ratio: self.global_ratio,
            min_fetch_k: self.min_fetch_k,
            max_fetch_k: self.max_fetch_k,
            filtered_multiplier: self.filtered_multiplier,
        }
    }
}

fn default_k() -> usize {
    8
}
fn default_max_k() -> usize {
    1000
}
fn default_multiplier() -> usize {
    10
}
fn default_global_ratio() -> f64 {
    0.05
}
fn default_min_fetch_k() -> usize {
    50
}
fn default_max_fetch_k() -> usize {
    400
}
fn default_filtered_multiplier() -> usize {
    20
}
fn default_fuzzy_filter_limit() -> usize {
    50
}
fn default_language() -> String {
    "en".to_string()
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Endpoint override (OpenAI-compatible base URL or Ollama host).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            url: None,
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
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
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    /// The binding this section describes, if embeddings are enabled.
    pub fn binding(&self) -> Option<EmbeddingBinding> {
        if !self.is_enabled() {
            return None;
        }
        Some(EmbeddingBinding {
            provider: self.provider.clone(),
            model: self.model.clone().unwrap_or_default(),
            endpoint: self.url.clone(),
            dims: self.dims.unwrap_or(0),
        })
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TranslationConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_translation_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_cache_ttl_days")]
    pub cache_ttl_days: u64,
    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            url: None,
            timeout_secs: default_translation_timeout(),
            cache_ttl_days: default_cache_ttl_days(),
            cache_max_entries: default_cache_max_entries(),
        }
    }
}

impl TranslationConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_translation_timeout() -> u64 {
    8
}
fn default_cache_ttl_days() -> u64 {
    7
}
fn default_cache_max_entries() -> usize {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct TableConfig {
    #[serde(default = "default_row_count_ttl")]
    pub row_count_ttl_secs: u64,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            row_count_ttl_secs: default_row_count_ttl(),
        }
    }
}

fn default_row_count_ttl() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct RebuildConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Also drop records whose source is only transiently unreachable.
    #[serde(default)]
    pub drop_unreachable: bool,
}

impl Default for RebuildConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            drop_unreachable: false,
        }
    }
}

fn default_concurrency() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct LockConfig {
    #[serde(default = "default_max_wait_secs")]
    pub max_wait_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            max_wait_secs: default_max_wait_secs(),
        }
    }
}

fn default_max_wait_secs() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoaderConfig {
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_preview_chars")]
    pub preview_chars: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            fetch_timeout_secs: default_fetch_timeout(),
            preview_chars: default_preview_chars(),
        }
    }
}

fn default_include_globs() -> Vec<String> {
    [
        "**/*.md", "**/*.txt", "**/*.rst", "**/*.html", "**/*.pdf", "**/*.docx", "**/*.pptx",
        "**/*.xlsx",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_fetch_timeout() -> u64 {
    20
}
fn default_preview_chars() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7331".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &str) -> Result<Config> {
        let toml = format!("[db]\npath = \"./data/kb.sqlite\"\n{}", extra);
        let config: Config = toml::from_str(&toml)?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let config = parse("").unwrap();
        assert_eq!(config.retrieval.fuzzy_filter_limit, 50);
        assert_eq!(config.retrieval.language, "en");
        assert_eq!(config.translation.cache_ttl_days, 7);
        assert_eq!(config.table.row_count_ttl_secs, 30);
        assert!(!config.rebuild.drop_unreachable);
        assert!(config.embedding.binding().is_none());
    }

    #[test]
    fn multipliers_below_ten_are_rejected() {
        let err = parse("[retrieval]\nglobal_multiplier = 4\n").unwrap_err();
        assert!(err.to_string().contains("global_multiplier"));
        let err = parse("[retrieval]\nfiltered_multiplier = 9\n").unwrap_err();
        assert!(err.to_string().contains("filtered_multiplier"));
    }

    #[test]
    fn enabled_embedding_requires_model_and_dims() {
        assert!(parse("[embedding]\nprovider = \"ollama\"\nmodel = \"m\"\n").is_err());
        let config =
            parse("[embedding]\nprovider = \"ollama\"\nmodel = \"nomic\"\ndims = 768\n").unwrap();
        let binding = config.embedding.binding().unwrap();
        assert_eq!(binding.dims, 768);
        assert_eq!(binding.provider, "ollama");
    }

    #[test]
    fn unknown_providers_are_rejected() {
        assert!(parse("[embedding]\nprovider = \"cohere\"\n").is_err());
        assert!(parse("[translation]\nprovider = \"deepl\"\n").is_err());
    }

    #[test]
    fn fetch_bounds_must_be_ordered() {
        assert!(parse("[retrieval]\nmin_fetch_k = 100\nmax_fetch_k = 10\n").is_err());
    }

    #[test]
    fn max_k_must_cover_default_k() {
        assert!(parse("[retrieval]\ndefault_k = 20\nmax_k = 10\n").is_err());
        let config = parse("[retrieval]\nmax_k = 50\n").unwrap();
        assert_eq!(config.retrieval.max_k, 50);
        assert_eq!(parse("").unwrap().retrieval.max_k, 1000);
    }

    #[test]
    fn load_config_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kb.toml");
        std::fs::write(&path, "[db]\npath = \"x.sqlite\"\n[server]\nbind = \"0.0.0.0:9\"\n")
            .unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.server.bind, "0.0.0.0:9");
        assert!(load_config(&dir.path().join("missing.toml")).is_err());
    }
}
