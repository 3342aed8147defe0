//! The retrieval engine as the serving layer sees it.
//!
//! [`RagEngine`] owns the active embedding backend and the shared
//! [`VectorStore`]. It is constructed once per process and passed by
//! reference (through `Arc`) to the HTTP handlers, the CLI and the agent.
//!
//! # Locking
//!
//! The store sits behind a `tokio::sync::RwLock`. Queries and eval runs
//! embed the question first and take the read lock only for search and
//! re-ranking, so they proceed concurrently. Ingest takes the write lock
//! only for add and save, after embedding has finished.
//!
//! # Lazy initialization
//!
//! The store is loaded on first use with the dimension of a real embedding
//! from the active backend.
//! Querying before anything was ingested yields no hits instead of
//! [`RagError::NotInitialized`](ragchat_core::RagError::NotInitialized).

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Deserializer, Serialize};
use tokio::sync::RwLock;

use ragchat_core::embedding::{embed_one, EmbeddingProvider};
use ragchat_core::eval::{eval_suite, EvalMetrics, EvalQuery};
use ragchat_core::retrieve::{retrieve_with_vector, Hit, RetrieveParams};

use crate::config::{ChunkingConfig, Config, RetrievalConfig};
use crate::embedding::create_provider;
use crate::vector_store::{StoreError, VectorStore, INDEX_FILE};

/// Embedded once to learn the backend's output width.
const STORE_PROBE_TEXT: &str = "init";

pub struct RagEngine {
    provider: Arc<dyn EmbeddingProvider>,
    store: Arc<RwLock<VectorStore>>,
    pub(crate) chunking: ChunkingConfig,
    retrieval: RetrievalConfig,
}

impl RagEngine {
    pub fn new(config: &Config, provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            provider,
            store: Arc::new(RwLock::new(VectorStore::new(config.store.dir.clone()))),
            chunking: config.chunking.clone(),
            retrieval: config.retrieval.clone(),
        }
    }

    /// Build the engine with the backend named in `[embedding]`.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Ok(Self::new(config, create_provider(&config.embedding)?))
    }

    pub fn provider(&self) -> &dyn EmbeddingProvider {
        self.provider.as_ref()
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    pub fn store(&self) -> &Arc<RwLock<VectorStore>> {
        &self.store
    }

    pub fn retrieval(&self) -> &RetrievalConfig {
        &self.retrieval
    }

    /// Load or create the store, once, for the width the backend actually
    /// produces. The configured `dims()` may not match the model.
    pub async fn ensure_store(&self) -> Result<(), StoreError> {
        if self.store.read().await.is_initialized() {
            return Ok(());
        }
        let dim = embed_one(self.provider.as_ref(), STORE_PROBE_TEXT).await?.dim();
        let mut store = self.store.write().await;
        if !store.is_initialized() {
            let outcome = store.load_or_init(dim)?;
            tracing::info!(
                event = "store.init",
                dim,
                count = store.count(),
                outcome = ?outcome,
                "vector store ready"
            );
        }
        Ok(())
    }

    /// Like [`ensure_store`](Self::ensure_store), and also writes empty
    /// artifacts when none exist yet. Returns the number of stored vectors.
    pub async fn init_store(&self) -> Result<usize, StoreError> {
        self.ensure_store().await?;
        let store = self.store.read().await;
        if !store.dir().join(INDEX_FILE).exists() {
            store.save()?;
        }
        Ok(store.count())
    }

    /// Retrieval parameters from config defaults plus per-request overrides.
    pub fn params(&self, k: Option<usize>, department: Option<String>, mmr_lambda: Option<f32>) -> RetrieveParams {
        RetrieveParams {
            k: k.unwrap_or(self.retrieval.default_k),
            department,
            mmr_lambda,
            pool_size: self.retrieval.pool_size,
            preview_chars: self.retrieval.preview_chars,
        }
    }

    /// Ranked hits for `question`. Blank questions never reach the backend.
    pub async fn query(&self, question: &str, params: &RetrieveParams) -> Result<Vec<Hit>, StoreError> {
        if question.trim().is_empty() {
            return Ok(Vec::new());
        }
        self.ensure_store().await?;

        let started = Instant::now();
        let hits = self.search_hits(question, params).await?;
        tracing::info!(
            event = "rag.query",
            k = params.k,
            department = params.department.as_deref().unwrap_or(""),
            mmr = params.mmr_lambda.is_some(),
            hits = hits.len(),
            latency_ms = started.elapsed().as_millis() as u64,
            "retrieval complete"
        );
        Ok(hits)
    }

    /// Recall@k over a labeled set, using the default MMR lambda and no
    /// department filter.
    pub async fn eval(&self, queries: &[EvalQuery], k: usize) -> Result<EvalMetrics, StoreError> {
        self.ensure_store().await?;
        let lambda = Some(self.retrieval.mmr_lambda);
        let metrics = eval_suite(queries, k, |question, k| {
            let params = self.params(Some(k), None, lambda);
            async move { self.search_hits(&question, &params).await }
        })
        .await?;
        tracing::info!(
            event = "rag.eval",
            n = metrics.n,
            recall_at_k = metrics.recall_at_k,
            p95_latency_ms = metrics.p95_latency_ms,
            "eval complete"
        );
        Ok(metrics)
    }

    /// Embeds without holding the store lock; the read guard covers only the
    /// in-memory search and re-rank.
    async fn search_hits(&self, question: &str, params: &RetrieveParams) -> ragchat_core::Result<Vec<Hit>> {
        let question = question.trim();
        if question.is_empty() || params.k == 0 || self.store.read().await.count() == 0 {
            return Ok(Vec::new());
        }
        let query = embed_one(self.provider.as_ref(), question).await?;

        let store = self.store.read().await;
        if store.count() == 0 {
            return Ok(Vec::new());
        }
        let index = store
            .index()
            .map_err(|_| ragchat_core::RagError::NotInitialized)?;
        retrieve_with_vector(query.row(0), index, params)
    }
}

// ============ Request / response shapes ============

/// Body of `POST /api/rag/query`.
///
/// `mmr_lambda` distinguishes "absent" (use the configured default) from
/// an explicit `null` (rank by raw similarity).
#[derive(Debug, Default, Deserialize)]
pub struct QueryRequest {
    #[serde(default, alias = "query")]
    pub question: Option<String>,
    #[serde(default, alias = "top_k")]
    pub k: Option<usize>,
    #[serde(default)]
    pub department: Option<String>,
    #[serde(default, deserialize_with = "explicit_null")]
    pub mmr_lambda: Option<Option<f32>>,
}

impl QueryRequest {
    pub fn params(&self, engine: &RagEngine) -> RetrieveParams {
        let lambda = self
            .mmr_lambda
            .unwrap_or(Some(engine.retrieval().mmr_lambda));
        engine.params(self.k, self.department.clone(), lambda)
    }
}

fn explicit_null<'de, D>(deserializer: D) -> Result<Option<Option<f32>>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Some(Option::deserialize(deserializer)?))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QueryResponse {
    pub ok: bool,
    pub hits: Vec<Hit>,
}

/// Body of `POST /api/rag/eval`.
#[derive(Debug, Default, Deserialize)]
pub struct EvalRequest {
    #[serde(default)]
    pub queries: Vec<EvalQuery>,
    #[serde(default)]
    pub k: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EvalResponse {
    pub ok: bool,
    pub metrics: EvalMetrics,
}
