//! # ragchat
//!
//! A chat backend with conversation history and a small
//! retrieval-augmented generation engine.
//!
//! ## Architecture
//!
//! ```text
//!                ┌──────────────┐
//!   HTTP / CLI ─▶│  server/main │
//!                └──────┬───────┘
//!          ┌────────────┼──────────────┐
//!          ▼            ▼              ▼
//!   ┌────────────┐ ┌──────────┐ ┌────────────┐
//!   │ ChatService│ │ RagEngine│ │SessionStore│
//!   │  LlmClient │ │  ingest  │ │  (SQLite)  │
//!   │  +breaker  │ │  query   │ └────────────┘
//!   └────────────┘ └────┬─────┘
//!                       ▼
//!              ┌─────────────────┐
//!              │ VectorStore     │  rag_index.bin + rag_meta.json
//!              │ (ragchat-core)  │
//!              └─────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! ragchat init
//! ragchat ingest ./docs.json
//! ragchat query "what is the leave policy?" --department HR --k 2
//! ragchat serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`embedding`] | Embedding backend selection (hash, OpenAI, local) |
//! | [`vector_store`] | Persisted vector index and metadata |
//! | [`redact`] | Best-effort PII scrubbing |
//! | [`rag`] | Retrieval engine: query and eval |
//! | [`ingest`] | Chunk, redact, embed, store |
//! | [`llm`] | Chat backends and the retrying, circuit-broken client |
//! | [`chat`] | Chat validation and prompt assembly |
//! | [`models`] | Session and message records |
//! | [`sessions`] | Session persistence and export |
//! | [`agent`] | Plan / execute / validate agent over tools |
//! | [`server`] | HTTP server |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`telemetry`] | Tracing subscriber setup |

pub mod agent;
pub mod chat;
pub mod config;
pub mod db;
pub mod embedding;
pub mod ingest;
pub mod llm;
pub mod migrate;
pub mod models;
pub mod rag;
pub mod redact;
pub mod server;
pub mod sessions;
pub mod telemetry;
pub mod vector_store;
