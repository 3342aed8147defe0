//! Ingestion pipeline: chunk → redact → embed → add → save.
//!
//! Documents without an `id` get a random UUID; documents without a
//! `department` are filed under `"general"`. An empty batch (or one whose
//! texts are all blank) is a zero-count success and touches nothing.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use ragchat_core::chunk::{chunk_document, Chunk};
use ragchat_core::embedding::embed_texts;

use crate::rag::RagEngine;
use crate::redact::{redact, DEFAULT_MASK};
use crate::vector_store::StoreError;

pub const DEFAULT_DEPARTMENT: &str = "general";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IngestDoc {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub department: Option<String>,
    #[serde(default)]
    pub text: String,
}

/// Body of `POST /api/rag/ingest` and the `ragchat ingest` input file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IngestRequest {
    #[serde(default)]
    pub docs: Vec<IngestDoc>,
    /// Clear the store before adding.
    #[serde(default)]
    pub overwrite: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestResponse {
    pub ok: bool,
    /// Number of chunks added.
    pub ingested: usize,
    pub emb_model: String,
}

impl RagEngine {
    pub async fn ingest(&self, request: IngestRequest) -> Result<IngestResponse, StoreError> {
        let mut chunks: Vec<Chunk> = Vec::new();
        for doc in &request.docs {
            let doc_id = doc
                .id
                .as_deref()
                .filter(|s| !s.trim().is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            let department = doc
                .department
                .as_deref()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(DEFAULT_DEPARTMENT);

            for mut chunk in chunk_document(
                &doc_id,
                department,
                &doc.text,
                self.chunking.size,
                self.chunking.overlap,
            )? {
                chunk.text = redact(&chunk.text, DEFAULT_MASK);
                chunks.push(chunk);
            }
        }

        let emb_model = self.model_name().to_string();
        if chunks.is_empty() {
            return Ok(IngestResponse {
                ok: true,
                ingested: 0,
                emb_model,
            });
        }

        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        let vectors = embed_texts(self.provider(), &texts).await?;
        // Chunks are whitespace-normalized and non-empty, so every text
        // survives cleaning and rows line up with chunks.
        if vectors.is_sentinel() {
            return Ok(IngestResponse {
                ok: true,
                ingested: 0,
                emb_model,
            });
        }

        let ingested = chunks.len();
        {
            let mut store = self.store().write().await;
            store.load_or_init(vectors.dim())?;
            if request.overwrite {
                store.reset(vectors.dim());
            }
            store.add(&vectors, chunks)?;
            store.save()?;
            tracing::info!(
                event = "rag.ingest",
                docs = request.docs.len(),
                chunks = ingested,
                total = store.count(),
                model = %emb_model,
                overwrite = request.overwrite,
                "ingest complete"
            );
        }

        Ok(IngestResponse {
            ok: true,
            ingested,
            emb_model,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use ragchat_core::embedding::HashEmbedder;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn engine(tmp: &TempDir) -> RagEngine {
        let mut cfg = Config::minimal();
        cfg.store.dir = tmp.path().join("rag");
        RagEngine::new(&cfg, Arc::new(HashEmbedder::default()))
    }

    fn doc(id: Option<&str>, dept: Option<&str>, text: &str) -> IngestDoc {
        IngestDoc {
            id: id.map(str::to_string),
            department: dept.map(str::to_string),
            text: text.to_string(),
        }
    }

    #[tokio::test]
    async fn test_empty_batch_is_zero_success() {
        let tmp = TempDir::new().unwrap();
        let e = engine(&tmp);
        let resp = e.ingest(IngestRequest::default()).await.unwrap();
        assert!(resp.ok);
        assert_eq!(resp.ingested, 0);
        assert_eq!(resp.emb_model, "dummy-32-hash");
        assert!(!tmp.path().join("rag").exists());
    }

    #[tokio::test]
    async fn test_defaults_and_chunk_ids() {
        let tmp = TempDir::new().unwrap();
        let e = engine(&tmp);
        let text = "policy ".repeat(100);
        let resp = e
            .ingest(IngestRequest {
                docs: vec![doc(None, None, &text)],
                overwrite: false,
            })
            .await
            .unwrap();
        assert!(resp.ingested >= 2);

        let store = e.store().read().await;
        let meta = store.index().unwrap().metadata();
        assert_eq!(meta.len(), resp.ingested);
        assert!(meta.iter().all(|c| c.department == "general"));
        assert!(Uuid::parse_str(&meta[0].doc_id).is_ok());
        assert_eq!(meta[1].chunk_id, format!("{}::chunk1", meta[0].doc_id));
        assert!(tmp.path().join("rag").join("rag_index.bin").exists());
    }

    #[tokio::test]
    async fn test_chunks_are_redacted() {
        let tmp = TempDir::new().unwrap();
        let e = engine(&tmp);
        e.ingest(IngestRequest {
            docs: vec![doc(Some("A"), Some("HR"), "contact hr@corp.example.com for help")],
            overwrite: false,
        })
        .await
        .unwrap();
        let store = e.store().read().await;
        let text = &store.index().unwrap().metadata()[0].text;
        assert_eq!(text, "contact [REDACTED] for help");
    }

    #[tokio::test]
    async fn test_overwrite_replaces_contents() {
        let tmp = TempDir::new().unwrap();
        let e = engine(&tmp);
        let first = IngestRequest {
            docs: vec![doc(Some("A"), None, "alpha"), doc(Some("B"), None, "beta")],
            overwrite: false,
        };
        e.ingest(first).await.unwrap();
        e.ingest(IngestRequest {
            docs: vec![doc(Some("C"), None, "gamma")],
            overwrite: true,
        })
        .await
        .unwrap();

        let store = e.store().read().await;
        assert_eq!(store.count(), 1);
        assert_eq!(store.index().unwrap().metadata()[0].doc_id, "C");
    }

    #[tokio::test]
    async fn test_ingest_persists_across_engines() {
        let tmp = TempDir::new().unwrap();
        engine(&tmp)
            .ingest(IngestRequest {
                docs: vec![doc(Some("A"), Some("HR"), "leave policy")],
                overwrite: false,
            })
            .await
            .unwrap();

        let e2 = engine(&tmp);
        e2.ensure_store().await.unwrap();
        assert_eq!(e2.store().read().await.count(), 1);
    }
}
