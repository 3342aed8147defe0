//! # ragchat core
//!
//! Pure retrieval logic for ragchat: overlap chunking, the embedding
//! backend trait, a flat inner-product vector index with parallel metadata,
//! filtered MMR retrieval, recall@k evaluation, and the circuit breaker
//! state machine used by the LLM client.
//!
//! This crate contains no tokio, sqlx, HTTP, or filesystem I/O. Persistence,
//! concrete network backends, and serving live in the `ragchat` app crate.
//!
//! ## Data flow
//!
//! ```text
//! documents ─▶ chunk ─▶ Embedder ─▶ FlatIndex::add
//! query ─────▶ Embedder ─▶ FlatIndex::search ─▶ retrieve (filter + MMR) ─▶ hits
//! ```

pub mod breaker;
pub mod chunk;
pub mod embedding;
pub mod error;
pub mod eval;
pub mod index;
pub mod retrieve;

pub use error::{RagError, Result};
