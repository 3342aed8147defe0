//! TOML configuration.
//!
//! Every section except `[db]`, `[store]` and `[server]` may be omitted and
//! falls back to the defaults below. Secrets never live in the file; the
//! OpenAI key is read from `OPENAI_API_KEY` (optionally via `.env`).
//!
//! ```toml
//! [db]
//! path = "./data/ragchat.sqlite"
//!
//! [store]
//! dir = "./data/rag"
//!
//! [server]
//! bind = "127.0.0.1:8080"
//!
//! [embedding]
//! provider = "hash"      # hash | openai | local
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use ragchat_core::chunk::{DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE};
use ragchat_core::retrieve::{DEFAULT_POOL_SIZE, DEFAULT_PREVIEW_CHARS};

/// Env var that overrides `chat.context_max_turns`.
pub const CONTEXT_TURNS_ENV: &str = "CHAT_CONTEXT_MAX_TURNS";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub store: StoreConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// Directory holding `rag_index.bin` and `rag_meta.json`.
    pub dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_CHUNK_SIZE,
            overlap: DEFAULT_CHUNK_OVERLAP,
        }
    }
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}
fn default_chunk_overlap() -> usize {
    DEFAULT_CHUNK_OVERLAP
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_k")]
    pub default_k: usize,
    #[serde(default = "default_mmr_lambda")]
    pub mmr_lambda: f32,
    #[serde(default = "default_preview_chars")]
    pub preview_chars: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            default_k: default_k(),
            mmr_lambda: default_mmr_lambda(),
            preview_chars: DEFAULT_PREVIEW_CHARS,
        }
    }
}

fn default_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}
fn default_k() -> usize {
    4
}
fn default_mmr_lambda() -> f32 {
    0.6
}
fn default_preview_chars() -> usize {
    DEFAULT_PREVIEW_CHARS
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_embedding_timeout_secs")]
    pub timeout_secs: u64,
    /// OpenAI-compatible base URL, e.g. `https://api.openai.com/v1`.
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            timeout_secs: default_embedding_timeout_secs(),
            url: None,
        }
    }
}

fn default_provider() -> String {
    "hash".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_embedding_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: u32,
    #[serde(default = "default_breaker_cooldown_secs")]
    pub breaker_cooldown_secs: u64,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            timeout_secs: default_llm_timeout_secs(),
            max_retries: default_max_retries(),
            breaker_threshold: default_breaker_threshold(),
            breaker_cooldown_secs: default_breaker_cooldown_secs(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            jitter_ms: default_jitter_ms(),
        }
    }
}

fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_llm_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    2
}
fn default_breaker_threshold() -> u32 {
    3
}
fn default_breaker_cooldown_secs() -> u64 {
    20
}
fn default_backoff_base_ms() -> u64 {
    1000
}
fn default_backoff_max_ms() -> u64 {
    5000
}
fn default_jitter_ms() -> u64 {
    250
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    #[serde(default = "default_max_message_chars")]
    pub max_message_chars: usize,
    #[serde(default = "default_allowed_models")]
    pub allowed_models: Vec<String>,
    #[serde(default = "default_model")]
    pub default_model: String,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_context_max_turns")]
    pub context_max_turns: usize,
    #[serde(default = "default_rag_k")]
    pub rag_k: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_message_chars: default_max_message_chars(),
            allowed_models: default_allowed_models(),
            default_model: default_model(),
            system_prompt: default_system_prompt(),
            context_max_turns: default_context_max_turns(),
            rag_k: default_rag_k(),
        }
    }
}

fn default_max_message_chars() -> usize {
    4000
}
fn default_allowed_models() -> Vec<String> {
    vec!["gpt-3.5-turbo".to_string(), "gpt-4".to_string()]
}
fn default_model() -> String {
    "gpt-3.5-turbo".to_string()
}
fn default_system_prompt() -> String {
    "You are a helpful assistant.".to_string()
}
fn default_context_max_turns() -> usize {
    6
}
fn default_rag_k() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

impl Config {
    /// Built-in defaults under `./data`, used when no config file exists
    /// and by tests.
    pub fn minimal() -> Self {
        Self {
            db: DbConfig {
                path: PathBuf::from("./data/ragchat.sqlite"),
            },
            store: StoreConfig {
                dir: PathBuf::from("./data/rag"),
            },
            chunking: ChunkingConfig::default(),
            retrieval: RetrievalConfig::default(),
            embedding: EmbeddingConfig::default(),
            llm: LlmConfig::default(),
            chat: ChatConfig::default(),
            server: ServerConfig {
                bind: "127.0.0.1:8080".to_string(),
            },
        }
    }

    /// Apply environment overrides on top of file values.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(raw) = std::env::var(CONTEXT_TURNS_ENV) {
            self.chat.context_max_turns = raw
                .trim()
                .parse()
                .with_context(|| format!("{} must be a non-negative integer", CONTEXT_TURNS_ENV))?;
        }
        Ok(())
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        // Validate chunking
        ragchat_core::chunk::validate(self.chunking.size, self.chunking.overlap)
            .map_err(|e| anyhow::anyhow!("chunking: {}", e))?;

        // Validate retrieval
        if self.retrieval.pool_size == 0 {
            anyhow::bail!("retrieval.pool_size must be >= 1");
        }
        if self.retrieval.default_k == 0 {
            anyhow::bail!("retrieval.default_k must be >= 1");
        }
        if !(0.0..=1.0).contains(&self.retrieval.mmr_lambda) {
            anyhow::bail!("retrieval.mmr_lambda must be in [0.0, 1.0]");
        }

        // Validate embedding
        match self.embedding.provider.as_str() {
            "hash" | "openai" | "local" => {}
            other => anyhow::bail!(
                "Unknown embedding provider: '{}'. Must be hash, openai, or local.",
                other
            ),
        }
        if self.embedding.dims == Some(0) {
            anyhow::bail!("embedding.dims must be > 0");
        }
        if self.embedding.batch_size == 0 {
            anyhow::bail!("embedding.batch_size must be > 0");
        }

        // Validate llm
        if self.llm.breaker_threshold == 0 {
            anyhow::bail!("llm.breaker_threshold must be >= 1");
        }
        if self.llm.backoff_max_ms < self.llm.backoff_base_ms {
            anyhow::bail!("llm.backoff_max_ms must be >= llm.backoff_base_ms");
        }

        // Validate chat
        if self.chat.max_message_chars == 0 {
            anyhow::bail!("chat.max_message_chars must be > 0");
        }
        if !self
            .chat
            .allowed_models
            .iter()
            .any(|m| m == &self.chat.default_model)
        {
            anyhow::bail!(
                "chat.default_model '{}' is not listed in chat.allowed_models",
                self.chat.default_model
            );
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.apply_env()?;
    config.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(body: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(body.as_bytes()).unwrap();
        f
    }

    const BASE: &str = r#"
[db]
path = "/tmp/ragchat.sqlite"

[store]
dir = "/tmp/rag"

[server]
bind = "127.0.0.1:0"
"#;

    #[test]
    fn test_defaults_fill_missing_sections() {
        let f = write_config(BASE);
        let cfg = load_config(f.path()).unwrap();
        assert_eq!(cfg.chunking.size, 350);
        assert_eq!(cfg.chunking.overlap, 60);
        assert_eq!(cfg.retrieval.pool_size, 25);
        assert_eq!(cfg.retrieval.preview_chars, 220);
        assert_eq!(cfg.embedding.provider, "hash");
        assert_eq!(cfg.llm.max_retries, 2);
        assert_eq!(cfg.llm.breaker_threshold, 3);
        assert_eq!(cfg.llm.breaker_cooldown_secs, 20);
        assert_eq!(cfg.chat.max_message_chars, 4000);
        assert_eq!(cfg.embedding.dims, None);
    }

    #[test]
    fn test_rejects_bad_overlap() {
        let f = write_config(&format!("{}\n[chunking]\nsize = 10\noverlap = 10\n", BASE));
        let err = load_config(f.path()).unwrap_err();
        assert!(err.to_string().contains("chunking"));
    }

    #[test]
    fn test_rejects_unknown_provider() {
        let f = write_config(&format!("{}\n[embedding]\nprovider = \"faiss\"\n", BASE));
        let err = load_config(f.path()).unwrap_err();
        assert!(err.to_string().contains("Unknown embedding provider"));
    }

    #[test]
    fn test_rejects_lambda_out_of_range() {
        let f = write_config(&format!("{}\n[retrieval]\nmmr_lambda = 1.5\n", BASE));
        assert!(load_config(f.path()).is_err());
    }

    #[test]
    fn test_rejects_default_model_not_allowed() {
        let f = write_config(&format!(
            "{}\n[chat]\nallowed_models = [\"gpt-4\"]\ndefault_model = \"gpt-3.5-turbo\"\n",
            BASE
        ));
        assert!(load_config(f.path()).is_err());
    }

    #[test]
    fn test_minimal_is_valid() {
        Config::minimal().validate().unwrap();
    }
}
