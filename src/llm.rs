//! Outbound model calls: the [`ChatBackend`] seam, the OpenAI backend, and
//! [`LlmClient`], the retry / backoff / circuit-breaker façade every chat
//! request goes through.
//!
//! # Retry policy
//!
//! ```text
//! delay(attempt) = min(base · 2^attempt, max) + uniform(0, jitter)
//! ```
//!
//! A logical call makes at most `1 + max_retries` attempts. Every failed
//! attempt is logged and counted by the breaker, so retries can trip it
//! mid-sequence. The breaker is checked before each attempt; while it is
//! open the call fails with [`LlmError::CircuitOpen`] without touching the
//! backend.
//!
//! # Streaming
//!
//! Failures while establishing the stream, or before its first token, are
//! retried like any other attempt. Once a token has reached the caller the
//! stream is never re-issued: a later failure is counted by the breaker and
//! ends the stream with that error. A clean end of stream records success.

use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use ragchat_core::breaker::{CircuitBreaker, CircuitOpen};

use crate::config::LlmConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }
}

/// Token accounting, when the backend reports it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Usage {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub usage: Option<Usage>,
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("circuit breaker open")]
    CircuitOpen(#[from] CircuitOpen),

    #[error("model request failed: {0}")]
    Transport(String),

    #[error("model API returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid model response: {0}")]
    Decode(String),

    #[error("model stream failed: {0}")]
    Stream(String),
}

impl LlmError {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, LlmError::CircuitOpen(_))
    }
}

/// A finite, non-restartable sequence of text tokens.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

/// A chat-completion backend. Implementations make exactly one attempt.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn complete(&self, model: &str, messages: &[ChatMessage]) -> Result<Completion, LlmError>;

    /// Establish a token stream. Errors while consuming it arrive as items.
    async fn stream(&self, model: &str, messages: &[ChatMessage]) -> Result<TokenStream, LlmError>;
}

// ============ Retry policy ============

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub jitter: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &LlmConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms),
            jitter: Duration::from_millis(config.jitter_ms),
        }
    }

    /// No waiting between attempts.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff_base: Duration::ZERO,
            backoff_max: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    /// Backoff before retrying after failed attempt number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self
            .backoff_base
            .saturating_mul(2u32.saturating_pow(attempt.min(16)));
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
        };
        exp.min(self.backoff_max) + jitter
    }
}

// ============ Client façade ============

#[derive(Clone)]
pub struct LlmClient {
    backend: Arc<dyn ChatBackend>,
    breaker: Arc<Mutex<CircuitBreaker>>,
    policy: RetryPolicy,
}

impl LlmClient {
    pub fn new(backend: Arc<dyn ChatBackend>, policy: RetryPolicy, breaker: CircuitBreaker) -> Self {
        Self {
            backend,
            breaker: Arc::new(Mutex::new(breaker)),
            policy,
        }
    }

    pub fn from_config(config: &LlmConfig, backend: Arc<dyn ChatBackend>) -> Self {
        Self::new(
            backend,
            RetryPolicy::from_config(config),
            CircuitBreaker::new(
                config.breaker_threshold,
                Duration::from_secs(config.breaker_cooldown_secs),
            ),
        )
    }

    /// True while the breaker is cooling down.
    pub fn breaker_open(&self) -> bool {
        lock(&self.breaker).is_open()
    }

    pub fn consecutive_failures(&self) -> u32 {
        lock(&self.breaker).consecutive_failures()
    }

    /// Non-streaming completion returning the trimmed assistant text.
    pub async fn complete(&self, model: &str, messages: &[ChatMessage]) -> Result<String, LlmError> {
        let mut attempt = 0;
        loop {
            check(&self.breaker)?;
            match self.backend.complete(model, messages).await {
                Ok(completion) => {
                    lock(&self.breaker).record_success();
                    let usage = completion.usage.unwrap_or_default();
                    tracing::info!(
                        event = "llm.complete",
                        model,
                        prompt_tokens = usage.prompt_tokens,
                        completion_tokens = usage.completion_tokens,
                        total_tokens = usage.total_tokens,
                        "chat completion"
                    );
                    return Ok(completion.text.trim().to_string());
                }
                Err(err) => {
                    record_failure(&self.breaker, "complete", attempt, &err);
                    if attempt >= self.policy.max_retries {
                        return Err(err);
                    }
                    tokio::time::sleep(self.policy.delay(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Streaming completion. The returned stream yields tokens and at most
    /// one terminal error.
    pub fn stream(&self, model: &str, messages: &[ChatMessage]) -> TokenStream {
        let backend = Arc::clone(&self.backend);
        let breaker = Arc::clone(&self.breaker);
        let policy = self.policy.clone();
        let model = model.to_string();
        let messages = messages.to_vec();

        Box::pin(async_stream::stream! {
            let mut attempt: u32 = 0;
            'attempts: loop {
                if let Err(open) = check(&breaker) {
                    yield Err(open);
                    return;
                }

                let mut tokens = match backend.stream(&model, &messages).await {
                    Ok(tokens) => tokens,
                    Err(err) => {
                        record_failure(&breaker, "stream", attempt, &err);
                        if attempt >= policy.max_retries {
                            yield Err(err);
                            return;
                        }
                        tokio::time::sleep(policy.delay(attempt)).await;
                        attempt += 1;
                        continue 'attempts;
                    }
                };

                let mut emitted = false;
                loop {
                    match tokens.next().await {
                        Some(Ok(token)) => {
                            emitted = true;
                            yield Ok(token);
                        }
                        Some(Err(err)) => {
                            record_failure(&breaker, "stream", attempt, &err);
                            if emitted || attempt >= policy.max_retries {
                                yield Err(err);
                                return;
                            }
                            tokio::time::sleep(policy.delay(attempt)).await;
                            attempt += 1;
                            continue 'attempts;
                        }
                        None => {
                            lock(&breaker).record_success();
                            return;
                        }
                    }
                }
            }
        })
    }
}

fn lock(breaker: &Mutex<CircuitBreaker>) -> MutexGuard<'_, CircuitBreaker> {
    breaker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn check(breaker: &Mutex<CircuitBreaker>) -> Result<(), LlmError> {
    Ok(lock(breaker).check()?)
}

fn record_failure(breaker: &Mutex<CircuitBreaker>, op: &str, attempt: u32, err: &LlmError) {
    tracing::warn!(event = "llm.attempt_failed", op, attempt, error = %err, "model call failed");
    let mut b = lock(breaker);
    if b.record_failure() {
        tracing::error!(
            event = "breaker.open",
            failures = b.consecutive_failures(),
            cooldown_s = b.cooldown().as_secs(),
            "circuit opened"
        );
    }
}

// ============ OpenAI backend ============

/// OpenAI-compatible `POST {base_url}/chat/completions`.
///
/// The timeout bounds request setup only; a stream may run longer.
pub struct OpenAiChat {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl OpenAiChat {
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().connect_timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            timeout,
        })
    }

    /// Build from `[llm]`, reading `OPENAI_API_KEY` from the environment.
    pub fn from_config(config: &LlmConfig) -> anyhow::Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty());
        if api_key.is_none() {
            tracing::warn!("OPENAI_API_KEY not set; chat requests will be unauthenticated");
        }
        Self::new(&config.base_url, api_key, Duration::from_secs(config.timeout_secs))
    }

    fn request(&self, body: &serde_json::Value) -> reqwest::RequestBuilder {
        let req = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(body);
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }

    async fn send(&self, body: serde_json::Value) -> Result<reqwest::Response, LlmError> {
        let response = tokio::time::timeout(self.timeout, self.request(&body).send())
            .await
            .map_err(|_| LlmError::Transport(format!("timed out after {:?}", self.timeout)))?
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[derive(Deserialize)]
struct CompletionBody {
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl ChatBackend for OpenAiChat {
    async fn complete(&self, model: &str, messages: &[ChatMessage]) -> Result<Completion, LlmError> {
        let response = self
            .send(serde_json::json!({ "model": model, "messages": messages }))
            .await?;
        let body: CompletionBody = tokio::time::timeout(self.timeout, response.json())
            .await
            .map_err(|_| LlmError::Transport(format!("timed out after {:?}", self.timeout)))?
            .map_err(|e| LlmError::Decode(e.to_string()))?;
        let text = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        Ok(Completion {
            text,
            usage: body.usage,
        })
    }

    async fn stream(&self, model: &str, messages: &[ChatMessage]) -> Result<TokenStream, LlmError> {
        let response = self
            .send(serde_json::json!({ "model": model, "messages": messages, "stream": true }))
            .await?;
        let mut bytes = response.bytes_stream();

        Ok(Box::pin(async_stream::stream! {
            let mut lines = SseLineBuffer::default();
            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        yield Err(LlmError::Stream(e.to_string()));
                        return;
                    }
                };
                for line in lines.push(&chunk) {
                    match parse_sse_line(&line) {
                        SseEvent::Token(token) => yield Ok(token),
                        SseEvent::Done => return,
                        SseEvent::Skip => {}
                    }
                }
            }
        }))
    }
}

/// Splits a byte stream into complete lines, holding back a partial tail.
#[derive(Default)]
struct SseLineBuffer {
    pending: Vec<u8>,
}

impl SseLineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line).trim().to_string());
        }
        lines
    }
}

#[derive(Debug, PartialEq)]
enum SseEvent {
    Token(String),
    Done,
    Skip,
}

/// One `data:` line of an OpenAI chat stream. Malformed partials are skipped.
fn parse_sse_line(line: &str) -> SseEvent {
    let Some(data) = line.strip_prefix("data:") else {
        return SseEvent::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseEvent::Done;
    }
    let Ok(json) = serde_json::from_str::<serde_json::Value>(data) else {
        return SseEvent::Skip;
    };
    match json
        .pointer("/choices/0/delta/content")
        .and_then(|c| c.as_str())
    {
        Some(token) if !token.is_empty() => SseEvent::Token(token.to_string()),
        _ => SseEvent::Skip,
    }
}
