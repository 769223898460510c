//! Embedding provider implementations.
//!
//! Concrete [`Embedder`]s behind the `[embedding]` config section:
//! - **[`OpenAIEmbedder`]** — calls the OpenAI embeddings API with batching, retry, and backoff.
//! - **[`OllamaEmbedder`]** — calls a local Ollama instance's `/api/embed` endpoint.
//! - **[`LocalEmbedder`]** — runs models locally via fastembed; no network calls after model download.
//!
//! Providers are created through an [`EmbedderCache`] keyed by the binding
//! fingerprint, so the same model is never initialized twice.
//!
//! # Retry Strategy
//!
//! The OpenAI and Ollama providers use exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry, then [`KbError::ProviderUnavailable`]
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kbase_core::embedding::{Embedder, EmbeddingBinding};
use kbase_core::error::KbError;
#[cfg(feature = "local-embeddings-fastembed")]
use kbase_core::models::{ProgressMessage, ProgressSink, ProgressStatus, TaskKind};

use crate::config::EmbeddingConfig;

const DEFAULT_OPENAI_URL: &str = "https://api.openai.com/v1";
const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

/// POST `body` to `url`, retrying transient failures with backoff.
async fn post_with_retry(
    client: &reqwest::Client,
    provider: &str,
    url: &str,
    bearer: Option<&str>,
    body: &serde_json::Value,
    max_retries: u32,
) -> Result<serde_json::Value> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tracing::debug!(provider, attempt, ?delay, "retrying embedding request");
            tokio::time::sleep(delay).await;
        }

        let mut req = client.post(url).json(body);
        if let Some(token) = bearer {
            req = req.bearer_auth(token);
        }

        match req.send().await {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    return Ok(response.json().await?);
                }

                let body_text = response.text().await.unwrap_or_default();
                if status.as_u16() == 429 || status.is_server_error() {
                    last_err = Some(anyhow::anyhow!(
                        "{} API error {}: {}",
                        provider,
                        status,
                        body_text
                    ));
                    continue;
                }

                bail!("{} API error {}: {}", provider, status, body_text);
            }
            Err(e) => {
                last_err = Some(
                    KbError::ProviderUnavailable(format!("{} at {}: {}", provider, url, e)).into(),
                );
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("{} request failed after retries", provider)))
}

fn parse_vectors(values: &[serde_json::Value], provider: &str) -> Result<Vec<Vec<f32>>> {
    values
        .iter()
        .map(|v| {
            v.as_array()
                .map(|a| a.iter().map(|x| x.as_f64().unwrap_or(0.0) as f32).collect())
                .ok_or_else(|| anyhow::anyhow!("Invalid {} response: embedding is not an array", provider))
        })
        .collect()
}

/// Parse the OpenAI embeddings API response, ordered by `index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing data array"))?;

    let mut items: Vec<(u64, &serde_json::Value)> = data
        .iter()
        .enumerate()
        .map(|(i, item)| {
            let index = item.get("index").and_then(|x| x.as_u64()).unwrap_or(i as u64);
            let embedding = item
                .get("embedding")
                .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing embedding"))?;
            Ok((index, embedding))
        })
        .collect::<Result<_>>()?;
    items.sort_by_key(|(i, _)| *i);
    let values: Vec<serde_json::Value> = items.into_iter().map(|(_, v)| v.clone()).collect();
    parse_vectors(&values, "OpenAI")
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: missing embeddings array"))?;
    parse_vectors(embeddings, "Ollama")
}

fn check_shape(vectors: &[Vec<f32>], expected: usize, dims: usize) -> Result<()> {
    if vectors.len() != expected {
        bail!(
            "embedding provider returned {} vectors for {} inputs",
            vectors.len(),
            expected
        );
    }
    if let Some(v) = vectors.iter().find(|v| v.len() != dims) {
        bail!(
            "embedding provider returned {} dims, configured embedding.dims is {}",
            v.len(),
            dims
        );
    }
    Ok(())
}

fn http_client(timeout_secs: u64) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?)
}

// ============ OpenAI ============

/// Embedding provider using the OpenAI API (or any compatible endpoint set
/// via `embedding.url`). Requires `OPENAI_API_KEY`.
pub struct OpenAIEmbedder {
    model: String,
    dims: usize,
    url: String,
    api_key: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAIEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| {
            KbError::ProviderUnavailable("OPENAI_API_KEY environment variable not set".into())
        })?;
        let base = config.url.as_deref().unwrap_or(DEFAULT_OPENAI_URL);

        Ok(Self {
            model,
            dims,
            url: format!("{}/embeddings", base.trim_end_matches('/')),
            api_key,
            max_retries: config.max_retries,
            client: http_client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = serde_json::json!({ "model": self.model, "input": texts });
        let json = post_with_retry(
            &self.client,
            "OpenAI",
            &self.url,
            Some(&self.api_key),
            &body,
            self.max_retries,
        )
        .await?;
        let vectors = parse_openai_response(&json)?;
        check_shape(&vectors, texts.len(), self.dims)?;
        Ok(vectors)
    }
}

// ============ Ollama ============

/// Embedding provider using a local Ollama instance (`POST /api/embed`).
pub struct OllamaEmbedder {
    model: String,
    dims: usize,
    url: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for Ollama provider"))?;
        let base = config.url.as_deref().unwrap_or(DEFAULT_OLLAMA_URL);

        Ok(Self {
            model,
            dims,
            url: format!("{}/api/embed", base.trim_end_matches('/')),
            max_retries: config.max_retries,
            client: http_client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = serde_json::json!({ "model": self.model, "input": texts });
        let json = post_with_retry(
            &self.client,
            "Ollama",
            &self.url,
            None,
            &body,
            self.max_retries,
        )
        .await?;
        let vectors = parse_ollama_response(&json)?;
        check_shape(&vectors, texts.len(), self.dims)?;
        Ok(vectors)
    }
}

// ============ Local (fastembed) ============

/// Local inference via fastembed. The model is downloaded from Hugging Face
/// on first use and cached; afterwards embeddings run offline.
#[cfg(feature = "local-embeddings-fastembed")]
pub struct LocalEmbedder {
    model_name: String,
    dims: usize,
    batch_size: usize,
    model: Arc<Mutex<Option<fastembed::TextEmbedding>>>,
}

#[cfg(feature = "local-embeddings-fastembed")]
fn default_local_dims(model_name: &str) -> usize {
    match model_name {
        "bge-base-en-v1.5" | "nomic-embed-text-v1" | "nomic-embed-text-v1.5"
        | "multilingual-e5-base" => 768,
        "bge-large-en-v1.5" | "multilingual-e5-large" => 1024,
        _ => 384,
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
fn config_to_fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    match name {
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
        "nomic-embed-text-v1" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV1),
        "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
        "multilingual-e5-small" => Ok(fastembed::EmbeddingModel::MultilingualE5Small),
        "multilingual-e5-base" => Ok(fastembed::EmbeddingModel::MultilingualE5Base),
        "multilingual-e5-large" => Ok(fastembed::EmbeddingModel::MultilingualE5Large),
        other => bail!(
            "Unknown local embedding model: '{}'. Supported models: \
             all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5, \
             nomic-embed-text-v1, nomic-embed-text-v1.5, \
             multilingual-e5-small, multilingual-e5-base, multilingual-e5-large",
            other
        ),
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
impl LocalEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model_name = config
            .model
            .clone()
            .unwrap_or_else(|| "all-minilm-l6-v2".to_string());
        config_to_fastembed_model(&model_name)?;
        let dims = config.dims.unwrap_or_else(|| default_local_dims(&model_name));
        Ok(Self {
            model_name,
            dims,
            batch_size: config.batch_size,
            model: Arc::new(Mutex::new(None)),
        })
    }

    /// Run `f` against the loaded model on the blocking pool, loading it first
    /// if needed.
    async fn with_model<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut fastembed::TextEmbedding) -> Result<T> + Send + 'static,
    {
        let slot = self.model.clone();
        let name = self.model_name.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = slot.lock().unwrap_or_else(|e| e.into_inner());
            if guard.is_none() {
                let options = fastembed::InitOptions::new(config_to_fastembed_model(&name)?)
                    .with_show_download_progress(false);
                let model = fastembed::TextEmbedding::try_new(options).map_err(|e| {
                    KbError::ProviderUnavailable(format!(
                        "failed to initialize local embedding model '{}': {}",
                        name, e
                    ))
                })?;
                *guard = Some(model);
            }
            match guard.as_mut() {
                Some(model) => f(model),
                None => bail!("local embedding model not loaded"),
            }
        })
        .await?
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
#[async_trait]
impl Embedder for LocalEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let texts = texts.to_vec();
        let expected = texts.len();
        let batch_size = self.batch_size;
        let vectors = self
            .with_model(move |model| {
                model
                    .embed(texts, Some(batch_size))
                    .map_err(|e| anyhow::anyhow!("Local embedding failed: {}", e))
            })
            .await?;
        check_shape(&vectors, expected, self.dims)?;
        Ok(vectors)
    }

    async fn warm_up(&self, progress: &dyn ProgressSink) -> Result<()> {
        let loaded = self
            .model
            .lock()
            .map(|g| g.is_some())
            .unwrap_or(false);
        if loaded {
            return Ok(());
        }
        progress.report(ProgressMessage::new(
            ProgressStatus::Downloading,
            0.0,
            format!("loading embedding model {}", self.model_name),
            TaskKind::Model,
        ));
        self.with_model(|_| Ok(())).await?;
        progress.report(ProgressMessage::new(
            ProgressStatus::Completed,
            5.0,
            format!("embedding model {} ready", self.model_name),
            TaskKind::Model,
        ));
        tracing::info!(model = %self.model_name, "local embedding model ready");
        Ok(())
    }
}

/// Create the [`Embedder`] described by `config`.
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"openai"` | [`OpenAIEmbedder`] |
/// | `"ollama"` | [`OllamaEmbedder`] |
/// | `"local"` | `LocalEmbedder` (requires `local-embeddings-fastembed`) |
///
/// `"disabled"` fails with [`KbError::ProviderUnavailable`].
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAIEmbedder::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(config)?)),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Ok(Arc::new(LocalEmbedder::new(config)?)),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings-fastembed"),
        "disabled" => Err(KbError::ProviderUnavailable(
            "embedding provider is disabled; set [embedding] provider in the config".into(),
        )
        .into()),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

/// Embedders keyed by binding fingerprint.
#[derive(Default)]
pub struct EmbedderCache {
    entries: Mutex<HashMap<String, Arc<dyn Embedder>>>,
}

impl EmbedderCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached embedder for `binding`, created with `make` on a miss.
    pub fn get_or_create(
        &self,
        binding: &EmbeddingBinding,
        make: impl FnOnce() -> Result<Arc<dyn Embedder>>,
    ) -> Result<Arc<dyn Embedder>> {
        let key = binding.fingerprint();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(e) = entries.get(&key) {
            return Ok(e.clone());
        }
        let embedder = make()?;
        tracing::debug!(binding = %key, "embedding provider created");
        entries.insert(key, embedder.clone());
        Ok(embedder)
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
