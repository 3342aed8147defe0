//! A minimal plan → execute → validate agent over a tool registry.
//!
//! ```text
//! goal ──plan()──▶ [PlanStep { tool: "rag.search", args }]
//!                      │
//!                      ▼  ToolRegistry::find(tool).execute(args, ctx)
//!                  { hits }
//!                      │
//!                      ▼  validate()
//!                  { hits, valid: !hits.is_empty() }
//! ```
//!
//! The planner is deliberately trivial: every goal becomes one retrieval
//! step. Tools implement [`Tool`] and reach the retrieval engine through
//! [`ToolContext`].

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use ragchat_core::retrieve::Hit;

use crate::rag::RagEngine;

pub const RAG_SEARCH: &str = "rag.search";

#[async_trait]
pub trait Tool: Send + Sync {
    /// Registry key, e.g. `"rag.search"`.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Run the tool. `params` is always a JSON object.
    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value>;
}

/// What a tool may touch while it runs.
#[derive(Clone)]
pub struct ToolContext {
    engine: Arc<RagEngine>,
}

impl ToolContext {
    pub fn new(engine: Arc<RagEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &RagEngine {
        &self.engine
    }
}

/// Retrieval over the vector store with the configured MMR default.
pub struct RagSearchTool;

#[async_trait]
impl Tool for RagSearchTool {
    fn name(&self) -> &str {
        RAG_SEARCH
    }

    fn description(&self) -> &str {
        "Retrieve the most relevant document chunks for a query"
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let query = params
            .get("query")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let k = params
            .get("k")
            .and_then(|v| v.as_u64())
            .map(|k| k as usize);
        let department = params
            .get("department")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let engine = ctx.engine();
        let lambda = Some(engine.retrieval().mmr_lambda);
        let hits = engine.query(query, &engine.params(k, department, lambda)).await?;
        Ok(serde_json::to_value(hits)?)
    }
}

pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// A registry holding `rag.search`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(RagSearchTool));
        registry
    }

    /// Register a tool. Lookups return the first tool registered under a name.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn find(&self, name: &str) -> Option<&dyn Tool> {
        self.tools
            .iter()
            .find(|t| t.name() == name)
            .map(|t| t.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanStep {
    pub tool: String,
    pub args: Value,
}

pub fn plan(goal: &str, k: usize) -> Vec<PlanStep> {
    vec![PlanStep {
        tool: RAG_SEARCH.to_string(),
        args: json!({ "query": goal, "k": k }),
    }]
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentResult {
    pub hits: Vec<Hit>,
    pub valid: bool,
}

/// A result is valid when it cites at least one hit.
pub fn validate(mut result: AgentResult) -> AgentResult {
    result.valid = !result.hits.is_empty();
    result
}

pub async fn run_agent(goal: &str, k: usize, tools: &ToolRegistry, ctx: &ToolContext) -> Result<AgentResult> {
    let mut result = AgentResult::default();
    for step in plan(goal, k) {
        let Some(tool) = tools.find(&step.tool) else {
            bail!("unknown tool: {}", step.tool);
        };
        let out = tool.execute(step.args, ctx).await?;
        result.hits = serde_json::from_value(out)?;
    }
    let result = validate(result);
    tracing::info!(event = "agent.run", hits = result.hits.len(), valid = result.valid, "agent finished");
    Ok(result)
}

/// Body of `POST /api/rag/agent`.
#[derive(Debug, Default, Deserialize)]
pub struct AgentRequest {
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub k: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AgentResponse {
    pub ok: bool,
    pub result: AgentResult,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::ingest::{IngestDoc, IngestRequest};
    use ragchat_core::embedding::HashEmbedder;
    use tempfile::TempDir;

    fn ctx(tmp: &TempDir) -> ToolContext {
        let mut cfg = Config::minimal();
        cfg.store.dir = tmp.path().join("rag");
        ToolContext::new(Arc::new(RagEngine::new(&cfg, Arc::new(HashEmbedder::default()))))
    }

    #[test]
    fn test_plan_is_single_search_step() {
        let steps = plan("what is the leave policy?", 3);
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].tool, "rag.search");
        assert_eq!(steps[0].args["query"], "what is the leave policy?");
        assert_eq!(steps[0].args["k"], 3);
    }

    #[test]
    fn test_registry_find() {
        let registry = ToolRegistry::with_builtins();
        assert_eq!(registry.len(), 1);
        assert!(registry.find("rag.search").is_some());
        assert!(registry.find("web.search").is_none());
        assert!(ToolRegistry::default().is_empty());
    }

    #[tokio::test]
    async fn test_agent_on_empty_store_is_invalid() {
        let tmp = TempDir::new().unwrap();
        let result = run_agent("anything", 4, &ToolRegistry::with_builtins(), &ctx(&tmp))
            .await
            .unwrap();
        assert!(result.hits.is_empty());
        assert!(!result.valid);
    }

    #[tokio::test]
    async fn test_agent_finds_hits() {
        let tmp = TempDir::new().unwrap();
        let ctx = ctx(&tmp);
        ctx.engine()
            .ingest(IngestRequest {
                docs: vec![IngestDoc {
                    id: Some("HR-1".into()),
                    department: Some("HR".into()),
                    text: "Annual leave policy for all employees".into(),
                }],
                overwrite: false,
            })
            .await
            .unwrap();

        let result = run_agent("leave policy", 2, &ToolRegistry::with_builtins(), &ctx)
            .await
            .unwrap();
        assert!(result.valid);
        assert_eq!(result.hits[0].doc_id, "HR-1");
    }

    #[tokio::test]
    async fn test_missing_tool_errors() {
        let tmp = TempDir::new().unwrap();
        let err = run_agent("x", 1, &ToolRegistry::new(), &ctx(&tmp)).await.unwrap_err();
        assert!(err.to_string().contains("unknown tool"));
    }
}
