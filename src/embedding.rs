//! Concrete embedding backends and provider selection.
//!
//! The [`EmbeddingProvider`] trait, the matrix type and the hash backend
//! live in `ragchat-core`. This module adds the backends that need I/O:
//!
//! - **[`OpenAiEmbedder`]**: calls an OpenAI-compatible `POST /embeddings`.
//! - **`LocalEmbedder`**: runs a fastembed model on a blocking thread
//!   (cargo feature `local-embeddings`).
//!
//! # Provider Selection
//!
//! ```rust
//! # use ragchat::config::EmbeddingConfig;
//! # use ragchat::embedding::create_provider;
//! let config = EmbeddingConfig::default(); // provider = "hash"
//! let provider = create_provider(&config).unwrap();
//! assert_eq!(provider.model_name(), "dummy-32-hash");
//! ```
//!
//! # Failures
//!
//! Backends never retry. Network errors, HTTP 429 and 5xx surface as
//! [`RagError::Embedding`], which callers treat as fatal for the request.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use ragchat_core::embedding::{EmbeddingProvider, HashEmbedder, DEFAULT_HASH_DIM};
use ragchat_core::RagError;

use crate::config::EmbeddingConfig;

pub const DEFAULT_OPENAI_MODEL: &str = "text-embedding-3-small";
const DEFAULT_OPENAI_URL: &str = "https://api.openai.com/v1";

// ============ OpenAI Provider ============

/// Embedding provider using an OpenAI-compatible API.
///
/// Texts are sent in batches of `batch_size`; vectors come back in input
/// order regardless of how the server orders `data[]`.
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    dims: usize,
    batch_size: usize,
}

impl OpenAiEmbedder {
    /// Build a provider with an explicit API key.
    pub fn new(config: &EmbeddingConfig, api_key: impl Into<String>) -> Result<Self> {
        let model = config
            .model
            .clone()
            .unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string());
        let dims = config.dims.unwrap_or(1536);
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| DEFAULT_OPENAI_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            url,
            api_key: api_key.into(),
            model,
            dims,
            batch_size: config.batch_size.max(1),
        })
    }

    /// Build a provider reading `OPENAI_API_KEY` from the environment.
    pub fn from_env(config: &EmbeddingConfig) -> Result<Self> {
        let key = match std::env::var("OPENAI_API_KEY") {
            Ok(k) if !k.trim().is_empty() => k,
            _ => bail!("OPENAI_API_KEY environment variable not set"),
        };
        Self::new(config, key)
    }

    async fn embed_chunk(&self, texts: &[String]) -> ragchat_core::Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .client
            .post(format!("{}/embeddings", self.url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| RagError::Embedding(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(RagError::Embedding(format!(
                "OpenAI API error {}: {}",
                status, body_text
            )));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| RagError::Embedding(format!("invalid response body: {}", e)))?;
        parse_openai_response(&json)
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> ragchat_core::Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            out.extend(self.embed_chunk(batch).await?);
        }
        Ok(out)
    }
}

/// Extract `data[].embedding`, ordered by each item's `index`.
fn parse_openai_response(json: &serde_json::Value) -> ragchat_core::Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| RagError::Embedding("Invalid OpenAI response: missing data array".into()))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| RagError::Embedding("Invalid OpenAI response: missing embedding".into()))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(pos);

        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        indexed.push((index, vec));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Local Provider (fastembed) ============

#[cfg(feature = "local-embeddings")]
pub use local::LocalEmbedder;

#[cfg(feature = "local-embeddings")]
mod local {
    use super::*;
    use std::sync::Mutex;

    /// Local inference through fastembed. The model is downloaded on first
    /// use and kept loaded for the life of the provider.
    pub struct LocalEmbedder {
        model_name: String,
        dims: usize,
        batch_size: usize,
        model: Arc<Mutex<Option<fastembed::TextEmbedding>>>,
    }

    impl LocalEmbedder {
        pub fn new(config: &EmbeddingConfig) -> Result<Self> {
            let model_name = config
                .model
                .clone()
                .unwrap_or_else(|| "all-minilm-l6-v2".to_string());
            // Fail at startup on an unknown name, not on the first request.
            to_fastembed_model(&model_name)?;
            let dims = config.dims.unwrap_or(match model_name.as_str() {
                "bge-base-en-v1.5" | "nomic-embed-text-v1.5" => 768,
                "bge-large-en-v1.5" => 1024,
                _ => 384,
            });
            Ok(Self {
                model_name,
                dims,
                batch_size: config.batch_size,
                model: Arc::new(Mutex::new(None)),
            })
        }
    }

    fn to_fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
        match name {
            "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
            "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
            "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
            "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
            "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
            other => bail!(
                "Unknown local embedding model: '{}'. Supported models: \
                 all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5, \
                 nomic-embed-text-v1.5",
                other
            ),
        }
    }

    #[async_trait]
    impl EmbeddingProvider for LocalEmbedder {
        fn model_name(&self) -> &str {
            &self.model_name
        }

        fn dims(&self) -> usize {
            self.dims
        }

        async fn embed_batch(&self, texts: &[String]) -> ragchat_core::Result<Vec<Vec<f32>>> {
            let texts = texts.to_vec();
            let slot = Arc::clone(&self.model);
            let name = self.model_name.clone();
            let batch_size = self.batch_size;

            tokio::task::spawn_blocking(move || {
                let mut guard = slot
                    .lock()
                    .map_err(|_| RagError::Embedding("local model lock poisoned".into()))?;
                if guard.is_none() {
                    let kind = to_fastembed_model(&name)
                        .map_err(|e| RagError::Embedding(e.to_string()))?;
                    let model = fastembed::TextEmbedding::try_new(
                        fastembed::InitOptions::new(kind).with_show_download_progress(true),
                    )
                    .map_err(|e| {
                        RagError::Embedding(format!("Failed to initialize local model: {}", e))
                    })?;
                    *guard = Some(model);
                }
                let model = guard
                    .as_mut()
                    .ok_or_else(|| RagError::Embedding("local model unavailable".into()))?;
                model
                    .embed(texts, Some(batch_size))
                    .map_err(|e| RagError::Embedding(format!("Local embedding failed: {}", e)))
            })
            .await
            .map_err(|e| RagError::Embedding(format!("embedding task panicked: {}", e)))?
        }
    }
}

/// Create the configured [`EmbeddingProvider`].
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"hash"` | [`HashEmbedder`] |
/// | `"openai"` | [`OpenAiEmbedder`] |
/// | `"local"` | `LocalEmbedder` (feature `local-embeddings`) |
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "hash" => Ok(Arc::new(HashEmbedder::new(
            config.dims.unwrap_or(DEFAULT_HASH_DIM),
        ))),
        "openai" => Ok(Arc::new(OpenAiEmbedder::from_env(config)?)),
        #[cfg(feature = "local-embeddings")]
        "local" => Ok(Arc::new(LocalEmbedder::new(config)?)),
        #[cfg(not(feature = "local-embeddings"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ragchat_core::embedding::embed_texts;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn openai_config(url: &str, batch_size: usize) -> EmbeddingConfig {
        EmbeddingConfig {
            provider: "openai".to_string(),
            model: None,
            dims: Some(3),
            batch_size,
            timeout_secs: 5,
            url: Some(url.to_string()),
        }
    }

    #[test]
    fn test_hash_is_default() {
        let p = create_provider(&EmbeddingConfig::default()).unwrap();
        assert_eq!(p.model_name(), "dummy-32-hash");
        assert_eq!(p.dims(), 32);
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let cfg = EmbeddingConfig {
            provider: "faiss".to_string(),
            ..EmbeddingConfig::default()
        };
        assert!(create_provider(&cfg).is_err());
    }

    #[test]
    fn test_parse_orders_by_index() {
        let json = serde_json::json!({
            "data": [
                {"index": 1, "embedding": [0.0, 1.0]},
                {"index": 0, "embedding": [1.0, 0.0]}
            ]
        });
        let rows = parse_openai_response(&json).unwrap();
        assert_eq!(rows, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[tokio::test]
    async fn test_openai_embeds_and_normalizes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .and(header("authorization", "Bearer test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"index": 0, "embedding": [3.0, 4.0, 0.0]}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let p = OpenAiEmbedder::new(&openai_config(&server.uri(), 16), "test-key").unwrap();
        assert_eq!(p.model_name(), DEFAULT_OPENAI_MODEL);
        let m = embed_texts(&p, &["hello"]).await.unwrap();
        assert_eq!((m.rows(), m.dim()), (1, 3));
        assert!((m.row(0)[0] - 0.6).abs() < 1e-5);
        assert!((m.row(0)[1] - 0.8).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_openai_batches_requests() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [
                    {"index": 0, "embedding": [1.0, 0.0, 0.0]},
                    {"index": 1, "embedding": [0.0, 1.0, 0.0]}
                ]
            })))
            .expect(2)
            .mount(&server)
            .await;

        let p = OpenAiEmbedder::new(&openai_config(&server.uri(), 2), "k").unwrap();
        let texts: Vec<String> = (0..4).map(|i| format!("t{}", i)).collect();
        let rows = p.embed_batch(&texts).await.unwrap();
        assert_eq!(rows.len(), 4);
    }

    #[tokio::test]
    async fn test_openai_server_error_is_embedding_error_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .expect(1)
            .mount(&server)
            .await;

        let p = OpenAiEmbedder::new(&openai_config(&server.uri(), 16), "k").unwrap();
        let err = embed_texts(&p, &["hello"]).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("503"));
    }
}
