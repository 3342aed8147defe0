//! Query-time retrieval: pool search, hard metadata filter, MMR re-ranking.
//!
//! # Algorithm
//!
//! 1. Trim the query. A blank query returns no hits and never reaches the
//!    embedding backend.
//! 2. Embed the query and fetch a candidate pool of `pool_size` neighbors
//!    (deliberately larger than `k`, so MMR has room to diversify).
//! 3. Drop candidates whose department differs from the filter. An empty
//!    filtered pool means no hits; there is no unfiltered fallback.
//! 4. With `mmr_lambda` set, run [`mmr_select`] over the candidates' stored
//!    vectors. Without it, take the top `k` by raw similarity.
//! 5. Cut each hit's text to `preview_chars` characters plus `"..."`.
//!
//! # MMR
//!
//! ```text
//! mmr(c) = λ · sim(q, c) − (1 − λ) · max_{s ∈ selected} sim(c, s)
//! ```
//!
//! The diversity term is 0 while nothing is selected. The first candidate
//! with the maximum score wins, so equal scores resolve by pool order.

use serde::{Deserialize, Serialize};

use crate::embedding::{dot, embed_one, EmbeddingProvider};
use crate::error::Result;
use crate::index::FlatIndex;

/// Neighbors fetched before filtering and re-ranking.
pub const DEFAULT_POOL_SIZE: usize = 25;

/// Characters of chunk text returned per hit.
pub const DEFAULT_PREVIEW_CHARS: usize = 220;

const ELLIPSIS: &str = "...";

/// Knobs for a single [`retrieve`] call.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrieveParams {
    pub k: usize,
    /// Exact-match department filter.
    pub department: Option<String>,
    /// `None` disables MMR and ranks by raw similarity.
    pub mmr_lambda: Option<f32>,
    pub pool_size: usize,
    pub preview_chars: usize,
}

impl RetrieveParams {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            department: None,
            mmr_lambda: None,
            pool_size: DEFAULT_POOL_SIZE,
            preview_chars: DEFAULT_PREVIEW_CHARS,
        }
    }

    pub fn department(mut self, department: impl Into<String>) -> Self {
        self.department = Some(department.into());
        self
    }

    pub fn mmr_lambda(mut self, lambda: Option<f32>) -> Self {
        self.mmr_lambda = lambda;
        self
    }
}

/// A ranked retrieval result with a truncated text preview.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hit {
    /// Inner-product similarity, rounded to 4 decimals.
    pub score: f32,
    pub doc_id: String,
    pub chunk_id: String,
    pub department: String,
    pub text: String,
}

/// Retrieve up to `params.k` hits for `query`.
///
/// # Errors
///
/// Embedding failures propagate unchanged. Searching an empty index yields
/// [`crate::RagError::NotInitialized`].
pub async fn retrieve(
    query: &str,
    provider: &dyn EmbeddingProvider,
    index: &FlatIndex,
    params: &RetrieveParams,
) -> Result<Vec<Hit>> {
    let query = query.trim();
    if query.is_empty() || params.k == 0 {
        return Ok(Vec::new());
    }

    let qmat = embed_one(provider, query).await?;
    retrieve_with_vector(qmat.row(0), index, params)
}

/// Steps 2 to 5 for an already embedded query. Synchronous, so callers can
/// embed first and hold a lock on the index only for this part.
pub fn retrieve_with_vector(qvec: &[f32], index: &FlatIndex, params: &RetrieveParams) -> Result<Vec<Hit>> {
    if params.k == 0 {
        return Ok(Vec::new());
    }
    let pool = index.search(qvec, params.pool_size)?;

    let candidates: Vec<_> = pool
        .into_iter()
        .filter(|n| match (&params.department, index.chunk(n.index)) {
            (Some(dept), Some(chunk)) => &chunk.department == dept,
            (None, Some(_)) => true,
            (_, None) => false,
        })
        .collect();
    if candidates.is_empty() {
        return Ok(Vec::new());
    }

    let picked: Vec<usize> = match params.mmr_lambda {
        Some(lambda) => {
            let vectors: Vec<&[f32]> = candidates
                .iter()
                .filter_map(|n| index.vector(n.index))
                .collect();
            mmr_select(qvec, &vectors, params.k, lambda)
        }
        None => (0..candidates.len().min(params.k)).collect(),
    };

    Ok(picked
        .into_iter()
        .filter_map(|i| {
            let n = candidates[i];
            index.chunk(n.index).map(|chunk| Hit {
                score: round4(n.score),
                doc_id: chunk.doc_id.clone(),
                chunk_id: chunk.chunk_id.clone(),
                department: chunk.department.clone(),
                text: preview(&chunk.text, params.preview_chars),
            })
        })
        .collect())
}

/// Greedy Maximal Marginal Relevance selection.
///
/// Returns positions into `candidates`, in selection order, at most `k` of
/// them. Deterministic for fixed inputs.
pub fn mmr_select(query: &[f32], candidates: &[&[f32]], k: usize, lambda: f32) -> Vec<usize> {
    let relevance: Vec<f32> = candidates.iter().map(|c| dot(query, c)).collect();
    let mut selected: Vec<usize> = Vec::with_capacity(k.min(candidates.len()));
    let mut remaining: Vec<usize> = (0..candidates.len()).collect();

    while selected.len() < k && !remaining.is_empty() {
        let mut best_pos = 0;
        let mut best_score = f32::NEG_INFINITY;

        for (pos, &cand) in remaining.iter().enumerate() {
            let diversity = selected
                .iter()
                .map(|&s| dot(candidates[cand], candidates[s]))
                .fold(None, |acc: Option<f32>, x| Some(acc.map_or(x, |a| a.max(x))))
                .unwrap_or(0.0);
            let score = lambda * relevance[cand] - (1.0 - lambda) * diversity;
            if score > best_score {
                best_score = score;
                best_pos = pos;
            }
        }

        selected.push(remaining.remove(best_pos));
    }

    selected
}

/// First `max_chars` characters, with `"..."` appended when cut.
pub fn preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte, _)) => format!("{}{}", &text[..byte], ELLIPSIS),
        None => text.to_string(),
    }
}

fn round4(x: f32) -> f32 {
    (x * 10_000.0).round() / 10_000.0
}
