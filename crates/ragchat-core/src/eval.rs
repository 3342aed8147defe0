//! Recall@k and latency over a labeled query set.
//!
//! Each query is timed around its retrieval call. A query counts as a hit
//! when any of its top-k results carries the expected `doc_id`. The suite
//! reports mean recall and the 95th-percentile latency, taken from the
//! ascending latencies at index `ceil(0.95 · n) − 1` (clamped to 0).

use std::future::Future;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::retrieve::Hit;

/// One labeled query. Accepts `q` as an alias for `question`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalQuery {
    #[serde(alias = "q")]
    pub question: String,
    pub expected_doc_id: String,
}

/// Aggregate metrics for a suite run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalMetrics {
    pub recall_at_k: f64,
    pub p95_latency_ms: f64,
    pub n: usize,
}

impl EvalMetrics {
    fn empty() -> Self {
        Self {
            recall_at_k: 0.0,
            p95_latency_ms: 0.0,
            n: 0,
        }
    }
}

/// Run every query through `retrieve_fn` and aggregate.
///
/// `retrieve_fn(question, k)` is awaited once per query, in order.
/// The first retrieval error aborts the suite.
pub async fn eval_suite<F, Fut>(queries: &[EvalQuery], k: usize, mut retrieve_fn: F) -> Result<EvalMetrics>
where
    F: FnMut(String, usize) -> Fut,
    Fut: Future<Output = Result<Vec<Hit>>>,
{
    if queries.is_empty() {
        return Ok(EvalMetrics::empty());
    }

    let mut found = 0usize;
    let mut latencies = Vec::with_capacity(queries.len());
    for query in queries {
        let started = Instant::now();
        let hits = retrieve_fn(query.question.clone(), k).await?;
        latencies.push(started.elapsed().as_secs_f64() * 1000.0);

        if hits
            .iter()
            .take(k)
            .any(|h| h.doc_id == query.expected_doc_id)
        {
            found += 1;
        }
    }

    Ok(EvalMetrics {
        recall_at_k: found as f64 / queries.len() as f64,
        p95_latency_ms: p95(&mut latencies),
        n: queries.len(),
    })
}

/// 95th percentile of `values` (sorted in place). 0.0 when empty.
pub fn p95(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    values[p95_index(values.len())]
}

fn p95_index(n: usize) -> usize {
    // ceil(0.95 * n) in integers, clear of float rounding at exact multiples.
    let rank = (95 * n).div_ceil(100);
    rank.saturating_sub(1).min(n.saturating_sub(1))
}
