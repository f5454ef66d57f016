//! Embedding provider abstraction and implementations.
//!
//! Defines the [`EmbeddingProvider`] trait and concrete implementations:
//! - **[`DisabledProvider`]**: always fails; used when embeddings are not configured.
//! - **[`OpenAIProvider`]**: `POST /v1/embeddings` with retry and backoff.
//! - **[`OllamaProvider`]**: a local Ollama instance's `/api/embed` endpoint.
//! - **[`GeminiProvider`]**: Google's `batchEmbedContents` endpoint.
//! - **[`HashEmbedder`]**: deterministic feature hashing, no network. Used to
//!   pin embeddings in tests and offline deployments.
//! - **`LocalProvider`**: fastembed models run in-process (feature `local-embeddings`).
//!
//! Providers return raw vectors. Normalization is the index's job, so every
//! vector in a generation and every query vector go through the same path.
//!
//! # Retry Strategy
//!
//! Remote providers retry rate limits (HTTP 429), server errors (5xx) and
//! dropped connections with exponential backoff, logging each retry.
//! Timeouts and other 4xx responses fail immediately.

use anyhow::{bail, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::config::EmbeddingConfig;
use crate::error::EmbeddingProviderError;
use crate::http::{backoff, build_client, send_json, Auth, HttpFailure};

/// Dimensionality of [`HashEmbedder`] vectors when `embedding.dims` is unset.
pub const DEFAULT_HASH_DIMS: usize = 256;

/// Maps text to fixed-dimension vectors.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;

    /// Embed a batch of texts, one vector per input, in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingProviderError>;

    /// Embed a single text with exactly one provider call.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingProviderError> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        if vectors.len() != 1 {
            return Err(EmbeddingProviderError::CountMismatch {
                expected: 1,
                actual: vectors.len(),
            });
        }
        Ok(vectors.remove(0))
    }
}

/// Check a provider response against the request: one vector per input,
/// each of the advertised dimensionality.
pub fn check_vectors(
    vectors: &[Vec<f32>],
    expected_count: usize,
    dims: usize,
) -> Result<(), EmbeddingProviderError> {
    if vectors.len() != expected_count {
        return Err(EmbeddingProviderError::CountMismatch {
            expected: expected_count,
            actual: vectors.len(),
        });
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
        return Err(EmbeddingProviderError::DimensionMismatch {
            expected: dims,
            actual: bad.len(),
        });
    }
    Ok(())
}

// ============ Disabled Provider ============

/// A no-op embedding provider that always returns errors.
pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingProviderError> {
        Err(EmbeddingProviderError::Disabled)
    }
}

// ============ Hash Provider ============

/// Deterministic embeddings via the hashing trick.
///
/// Each lower-cased alphanumeric token is hashed with SHA-256 to a bucket
/// and a sign. The same text always yields the same vector, across runs and
/// toolchain versions, so a persisted index built with it stays loadable.
pub struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dims];
        let lowered = text.to_lowercase();
        let tokens = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty());
        for token in tokens {
            let digest = Sha256::digest(token.as_bytes());
            let mut bucket_bytes = [0u8; 8];
            bucket_bytes.copy_from_slice(&digest[..8]);
            let bucket = (u64::from_le_bytes(bucket_bytes) % self.dims as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    fn model_name(&self) -> &str {
        "hash"
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingProviderError> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}

// ============ Remote providers ============

/// Settings shared by the HTTP-backed providers.
#[derive(Debug, Clone)]
struct RemoteSettings {
    model: String,
    dims: usize,
    max_retries: u32,
    timeout_secs: u64,
}

impl RemoteSettings {
    fn from_config(config: &EmbeddingConfig, provider: &str) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for {} provider", provider))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for {} provider", provider))?;
        Ok(Self {
            model,
            dims,
            max_retries: config.max_retries,
            timeout_secs: config.timeout_secs,
        })
    }

    fn map_failure(&self, provider: &str, failure: HttpFailure) -> EmbeddingProviderError {
        let provider = provider.to_string();
        match failure {
            HttpFailure::Timeout => EmbeddingProviderError::Timeout {
                provider,
                secs: self.timeout_secs,
            },
            HttpFailure::Status { status, body } => EmbeddingProviderError::Http {
                provider,
                status,
                body,
            },
            HttpFailure::Network(message) => EmbeddingProviderError::Network { provider, message },
            HttpFailure::Decode(message) => {
                EmbeddingProviderError::InvalidResponse { provider, message }
            }
        }
    }

    /// POST `body` to `url`, retrying transient failures.
    async fn post_with_retry(
        &self,
        provider: &str,
        url: &str,
        auth: Auth<'_>,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, EmbeddingProviderError> {
        let client = build_client(self.timeout_secs).map_err(|f| self.map_failure(provider, f))?;
        let mut attempt = 0u32;
        loop {
            if attempt > 0 {
                tokio::time::sleep(backoff(attempt)).await;
            }
            let request = auth.apply(client.post(url).json(body));
            match send_json(request).await {
                Ok(json) => return Ok(json),
                Err(failure) if failure.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    tracing::warn!(
                        provider,
                        attempt,
                        max_retries = self.max_retries,
                        failure = ?failure,
                        "embedding request failed; retrying"
                    );
                }
                Err(failure) => return Err(self.map_failure(provider, failure)),
            }
        }
    }
}

fn invalid(provider: &str, message: &str) -> EmbeddingProviderError {
    EmbeddingProviderError::InvalidResponse {
        provider: provider.to_string(),
        message: message.to_string(),
    }
}

fn parse_float_array(value: &serde_json::Value, provider: &str) -> Result<Vec<f32>, EmbeddingProviderError> {
    value
        .as_array()
        .ok_or_else(|| invalid(provider, "embedding is not an array"))?
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| invalid(provider, "embedding contains a non-number"))
        })
        .collect()
}

fn require_env(var: &str, provider: &str) -> Result<String, EmbeddingProviderError> {
    std::env::var(var).map_err(|_| EmbeddingProviderError::Auth {
        provider: provider.to_string(),
        message: format!("{} environment variable not set", var),
    })
}

// ============ OpenAI Provider ============

/// Embedding provider using the OpenAI API (or a compatible gateway via `embedding.url`).
///
/// Requires the `OPENAI_API_KEY` environment variable.
pub struct OpenAIProvider {
    settings: RemoteSettings,
    url: String,
}

impl OpenAIProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let settings = RemoteSettings::from_config(config, "openai")?;
        if std::env::var("OPENAI_API_KEY").is_err() {
            bail!("OPENAI_API_KEY environment variable not set");
        }
        let base = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com".to_string());
        Ok(Self {
            settings,
            url: format!("{}/v1/embeddings", base.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.settings.model
    }
    fn dims(&self) -> usize {
        self.settings.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingProviderError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let api_key = require_env("OPENAI_API_KEY", "openai")?;
        let body = serde_json::json!({
            "model": self.settings.model,
            "input": texts,
        });
        let json = self
            .settings
            .post_with_retry("openai", &self.url, Auth::Bearer(&api_key), &body)
            .await?;
        let vectors = parse_openai_response(&json)?;
        check_vectors(&vectors, texts.len(), self.settings.dims)?;
        Ok(vectors)
    }
}

/// Extract `data[].embedding`, ordered by each item's `index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, EmbeddingProviderError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| invalid("openai", "missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(pos);
        let embedding = item
            .get("embedding")
            .ok_or_else(|| invalid("openai", "missing embedding"))?;
        indexed.push((index, parse_float_array(embedding, "openai")?));
    }
    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama Provider ============

/// Embedding provider using a local Ollama instance.
///
/// Calls `POST /api/embed` on the configured URL (default: `http://localhost:11434`).
pub struct OllamaProvider {
    settings: RemoteSettings,
    url: String,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let settings = RemoteSettings::from_config(config, "ollama")?;
        let base = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        Ok(Self {
            settings,
            url: format!("{}/api/embed", base.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.settings.model
    }
    fn dims(&self) -> usize {
        self.settings.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingProviderError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = serde_json::json!({
            "model": self.settings.model,
            "input": texts,
        });
        let json = self
            .settings
            .post_with_retry("ollama", &self.url, Auth::None, &body)
            .await?;
        let vectors = json
            .get("embeddings")
            .and_then(|e| e.as_array())
            .ok_or_else(|| invalid("ollama", "missing embeddings array"))?
            .iter()
            .map(|e| parse_float_array(e, "ollama"))
            .collect::<Result<Vec<_>, _>>()?;
        check_vectors(&vectors, texts.len(), self.settings.dims)?;
        Ok(vectors)
    }
}

// ============ Gemini Provider ============

/// Embedding provider using Google's Generative Language API.
///
/// Requires the `GOOGLE_API_KEY` environment variable.
pub struct GeminiProvider {
    settings: RemoteSettings,
    base: String,
}

impl GeminiProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let settings = RemoteSettings::from_config(config, "gemini")?;
        if std::env::var("GOOGLE_API_KEY").is_err() {
            bail!("GOOGLE_API_KEY environment variable not set");
        }
        let base = config
            .url
            .clone()
            .unwrap_or_else(|| "https://generativelanguage.googleapis.com".to_string());
        Ok(Self {
            settings,
            base: base.trim_end_matches('/').to_string(),
        })
    }

    fn model_path(&self) -> String {
        let model = &self.settings.model;
        if model.starts_with("models/") {
            model.clone()
        } else {
            format!("models/{}", model)
        }
    }
}

#[async_trait]
impl EmbeddingProvider for GeminiProvider {
    fn model_name(&self) -> &str {
        &self.settings.model
    }
    fn dims(&self) -> usize {
        self.settings.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingProviderError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let api_key = require_env("GOOGLE_API_KEY", "gemini")?;
        let model = self.model_path();
        let requests: Vec<serde_json::Value> = texts
            .iter()
            .map(|text| {
                serde_json::json!({
                    "model": model,
                    "content": { "parts": [{ "text": text }] },
                    "outputDimensionality": self.settings.dims,
                })
            })
            .collect();
        let body = serde_json::json!({ "requests": requests });
        let url = format!("{}/v1beta/{}:batchEmbedContents", self.base, model);
        let json = self
            .settings
            .post_with_retry("gemini", &url, Auth::GoogleApiKey(&api_key), &body)
            .await?;
        let vectors = json
            .get("embeddings")
            .and_then(|e| e.as_array())
            .ok_or_else(|| invalid("gemini", "missing embeddings array"))?
            .iter()
            .map(|e| {
                let values = e
                    .get("values")
                    .ok_or_else(|| invalid("gemini", "missing values"))?;
                parse_float_array(values, "gemini")
            })
            .collect::<Result<Vec<_>, _>>()?;
        check_vectors(&vectors, texts.len(), self.settings.dims)?;
        Ok(vectors)
    }
}

// ============ Local Provider (fastembed) ============

/// Embedding provider for in-process inference via fastembed.
///
/// Models are downloaded on first use and cached; after that no network
/// calls are made.
#[cfg(feature = "local-embeddings")]
pub struct LocalProvider {
    model_name: String,
    dims: usize,
    batch_size: usize,
    model: Arc<parking_lot::Mutex<Option<fastembed::TextEmbedding>>>,
}

#[cfg(feature = "local-embeddings")]
impl LocalProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model_name = config
            .model
            .clone()
            .unwrap_or_else(|| "bge-base-en-v1.5".to_string());
        // Validate the name eagerly so misconfiguration fails at startup.
        config_to_fastembed_model(&model_name)?;
        let dims = config.dims.unwrap_or(match model_name.as_str() {
            "all-minilm-l6-v2" | "bge-small-en-v1.5" | "multilingual-e5-small" => 384,
            "bge-large-en-v1.5" | "multilingual-e5-large" => 1024,
            _ => 768,
        });
        Ok(Self {
            model_name,
            dims,
            batch_size: config.batch_size,
            model: Arc::new(parking_lot::Mutex::new(None)),
        })
    }
}

#[cfg(feature = "local-embeddings")]
fn config_to_fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    match name {
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
        "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
        "multilingual-e5-small" => Ok(fastembed::EmbeddingModel::MultilingualE5Small),
        "multilingual-e5-base" => Ok(fastembed::EmbeddingModel::MultilingualE5Base),
        "multilingual-e5-large" => Ok(fastembed::EmbeddingModel::MultilingualE5Large),
        other => bail!(
            "Unknown local embedding model: '{}'. Supported models: \
             all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5, \
             nomic-embed-text-v1.5, multilingual-e5-small, multilingual-e5-base, multilingual-e5-large",
            other
        ),
    }
}

#[cfg(feature = "local-embeddings")]
#[async_trait]
impl EmbeddingProvider for LocalProvider {
    fn model_name(&self) -> &str {
        &self.model_name
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingProviderError> {
        let local_err = |message: String| EmbeddingProviderError::InvalidResponse {
            provider: "local".to_string(),
            message,
        };
        let texts = texts.to_vec();
        let expected = texts.len();
        let model_slot = self.model.clone();
        let model_name = self.model_name.clone();
        let batch_size = self.batch_size;

        let vectors = tokio::task::spawn_blocking(move || {
            let mut slot = model_slot.lock();
            if slot.is_none() {
                let model = config_to_fastembed_model(&model_name).map_err(|e| e.to_string())?;
                let loaded = fastembed::TextEmbedding::try_new(
                    fastembed::InitOptions::new(model).with_show_download_progress(false),
                )
                .map_err(|e| format!("failed to initialize local embedding model: {}", e))?;
                *slot = Some(loaded);
            }
            match slot.as_mut() {
                Some(model) => model
                    .embed(texts, Some(batch_size))
                    .map_err(|e| format!("local embedding failed: {}", e)),
                None => Err("local embedding model unavailable".to_string()),
            }
        })
        .await
        .map_err(|e| local_err(e.to_string()))?
        .map_err(local_err)?;

        check_vectors(&vectors, expected, self.dims)?;
        Ok(vectors)
    }
}

/// Create the [`EmbeddingProvider`] named by `embedding.provider`.
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledProvider`] |
/// | `"openai"` | [`OpenAIProvider`] |
/// | `"ollama"` | [`OllamaProvider`] |
/// | `"gemini"` | [`GeminiProvider`] |
/// | `"hash"` | [`HashEmbedder`] |
/// | `"local"` | `LocalProvider` (feature `local-embeddings`) |
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledProvider)),
        "openai" => Ok(Arc::new(OpenAIProvider::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaProvider::new(config)?)),
        "gemini" => Ok(Arc::new(GeminiProvider::new(config)?)),
        "hash" => Ok(Arc::new(HashEmbedder::new(
            config.dims.unwrap_or(DEFAULT_HASH_DIMS),
        ))),
        #[cfg(feature = "local-embeddings")]
        "local" => Ok(Arc::new(LocalProvider::new(config)?)),
        #[cfg(not(feature = "local-embeddings"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_embedding_is_deterministic() {
        let embedder = HashEmbedder::new(64);
        let a = embedder.embed_text("What is the hostel fee?");
        let b = embedder.embed_text("What is the hostel fee?");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.iter().any(|v| *v != 0.0));
    }

    #[test]
    fn hash_embedding_ignores_case_and_punctuation() {
        let embedder = HashEmbedder::new(64);
        assert_eq!(
            embedder.embed_text("Hostel FEE!"),
            embedder.embed_text("hostel, fee")
        );
    }

    #[tokio::test]
    async fn embed_makes_one_batch_call() {
        let embedder = HashEmbedder::new(16);
        let single = embedder.embed("library hours").await.unwrap();
        assert_eq!(single, embedder.embed_text("library hours"));
    }

    #[tokio::test]
    async fn disabled_provider_fails() {
        let err = DisabledProvider.embed("anything").await.unwrap_err();
        assert!(matches!(err, EmbeddingProviderError::Disabled));
    }

    #[test]
    fn check_vectors_rejects_wrong_dims() {
        let err = check_vectors(&[vec![0.0; 3]], 1, 4).unwrap_err();
        assert!(matches!(
            err,
            EmbeddingProviderError::DimensionMismatch {
                expected: 4,
                actual: 3
            }
        ));
        let err = check_vectors(&[], 2, 4).unwrap_err();
        assert!(matches!(err, EmbeddingProviderError::CountMismatch { .. }));
    }

    #[test]
    fn openai_response_ordered_by_index() {
        let json = serde_json::json!({
            "data": [
                { "index": 1, "embedding": [0.0, 1.0] },
                { "index": 0, "embedding": [1.0, 0.0] }
            ]
        });
        let vectors = parse_openai_response(&json).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn openai_response_missing_data_is_invalid() {
        let err = parse_openai_response(&serde_json::json!({})).unwrap_err();
        assert!(matches!(err, EmbeddingProviderError::InvalidResponse { .. }));
    }

    #[tokio::test]
    async fn gemini_errors_do_not_carry_the_api_key() {
        std::env::set_var("GOOGLE_API_KEY", "test-google-key-4821");
        let config = EmbeddingConfig {
            provider: "gemini".to_string(),
            model: Some("text-embedding-004".to_string()),
            dims: Some(8),
            url: Some("http://127.0.0.1:1".to_string()),
            max_retries: 0,
            ..EmbeddingConfig::default()
        };
        let provider = create_provider(&config).unwrap();
        let err = provider.embed("hi").await.unwrap_err();
        assert!(matches!(err, EmbeddingProviderError::Network { .. }), "{:?}", err);
        let message = err.to_string();
        assert!(!message.contains("test-google-key-4821"), "{}", message);
        assert!(!message.contains("?key="), "{}", message);
    }

    #[test]
    fn create_hash_provider_defaults_dims() {
        let config = EmbeddingConfig {
            provider: "hash".to_string(),
            ..EmbeddingConfig::default()
        };
        let provider = create_provider(&config).unwrap();
        assert_eq!(provider.dims(), DEFAULT_HASH_DIMS);
        assert_eq!(provider.model_name(), "hash");
    }
}
