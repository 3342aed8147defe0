//! Chat requests: validation, prompt assembly and the session-aware
//! completion flow used by `/api/chat` and `/api/chat/stream`.
//!
//! # Prompt layout
//!
//! ```text
//! system     chat.system_prompt
//! system     "Session memory: ..."            (session has memory)
//! system     "Context: [doc::chunkN] ..."     (rag: true and hits found)
//! user/asst  last context_max_turns exchanges (session_id given)
//! user       the current message
//! ```
//!
//! With a `session_id`, a successful exchange appends the user message and
//! the assistant reply to the session. A stream appends only after it
//! finished cleanly.

use std::sync::Arc;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use ragchat_core::retrieve::Hit;

use crate::config::ChatConfig;
use crate::llm::{ChatMessage, LlmClient, LlmError, TokenStream};
use crate::models::{Message, Role};
use crate::rag::RagEngine;
use crate::sessions::{SessionError, SessionStore};
use crate::vector_store::StoreError;

pub const MISSING_MESSAGE: &str = "Missing JSON body or 'message' field";
pub const MESSAGE_TOO_LARGE: &str = "Message too large";

/// Rejections raised before any model call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatValidationError {
    #[error("{}", MISSING_MESSAGE)]
    MissingMessage,

    #[error("{}", MESSAGE_TOO_LARGE)]
    TooLarge,

    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A validated chat request.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatInput {
    pub message: String,
    pub model: String,
    pub session_id: Option<String>,
    pub rag: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatResponse {
    pub reply: String,
}

/// Parse and validate a raw request body.
///
/// The message is trimmed first; the size cap counts characters.
pub fn parse_request(body: &[u8], config: &ChatConfig) -> Result<ChatInput, ChatValidationError> {
    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|_| ChatValidationError::MissingMessage)?;
    let obj = value
        .as_object()
        .ok_or(ChatValidationError::MissingMessage)?;
    let raw_message = obj
        .get("message")
        .ok_or(ChatValidationError::MissingMessage)?;

    let message = match raw_message {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.trim().to_string(),
        _ => return Err(ChatValidationError::Invalid("'message' must be a string".into())),
    };
    if message.chars().count() > config.max_message_chars {
        return Err(ChatValidationError::TooLarge);
    }
    if message.is_empty() {
        return Err(ChatValidationError::Invalid("'message' must not be empty".into()));
    }

    let model = match obj.get("model") {
        None | Some(serde_json::Value::Null) => config.default_model.clone(),
        Some(serde_json::Value::String(m)) => m.clone(),
        Some(_) => return Err(ChatValidationError::Invalid("'model' must be a string".into())),
    };
    if !config.allowed_models.iter().any(|m| m == &model) {
        return Err(ChatValidationError::Invalid(format!(
            "model '{}' is not allowed; expected one of: {}",
            model,
            config.allowed_models.join(", ")
        )));
    }

    let session_id = match obj.get("session_id") {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(_) => {
            return Err(ChatValidationError::Invalid(
                "'session_id' must be a non-empty string".into(),
            ))
        }
    };
    let rag = obj.get("rag").and_then(|v| v.as_bool()).unwrap_or(false);

    Ok(ChatInput {
        message,
        model,
        session_id,
        rag,
    })
}

/// Assemble the model prompt. `history` must be oldest first.
pub fn build_prompt(
    config: &ChatConfig,
    memory: Option<&str>,
    hits: &[Hit],
    history: &[Message],
    message: &str,
) -> Vec<ChatMessage> {
    let mut prompt = vec![ChatMessage::system(config.system_prompt.clone())];

    if let Some(memory) = memory.map(str::trim).filter(|m| !m.is_empty()) {
        prompt.push(ChatMessage::system(format!("Session memory:\n{}", memory)));
    }
    if !hits.is_empty() {
        prompt.push(ChatMessage::system(render_context(hits)));
    }
    for m in history {
        prompt.push(match m.role {
            Role::User => ChatMessage::user(m.content.clone()),
            Role::Assistant => ChatMessage::assistant(m.content.clone()),
        });
    }
    prompt.push(ChatMessage::user(message));
    prompt
}

fn render_context(hits: &[Hit]) -> String {
    let mut out = String::from(
        "Answer using the context below when it is relevant. Cite sources as [doc_id::chunkN].\n\nContext:\n",
    );
    for hit in hits {
        out.push_str(&format!("[{}] {}\n", hit.chunk_id, hit.text));
    }
    out
}

// ============ Service ============

#[derive(Clone)]
pub struct ChatService {
    config: ChatConfig,
    llm: LlmClient,
    engine: Arc<RagEngine>,
    sessions: SessionStore,
}

impl ChatService {
    pub fn new(config: ChatConfig, llm: LlmClient, engine: Arc<RagEngine>, sessions: SessionStore) -> Self {
        Self {
            config,
            llm,
            engine,
            sessions,
        }
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    pub fn llm(&self) -> &LlmClient {
        &self.llm
    }

    /// Build the prompt for `input`, loading session context and RAG hits.
    pub async fn prepare(&self, input: &ChatInput) -> Result<Vec<ChatMessage>, ChatError> {
        let (memory, history) = match &input.session_id {
            Some(id) => {
                let session = self.sessions.get(id).await?;
                let history = self
                    .sessions
                    .recent_messages(id, self.config.context_max_turns.saturating_mul(2))
                    .await?;
                (session.memory, history)
            }
            None => (None, Vec::new()),
        };

        let hits = if input.rag {
            let lambda = Some(self.engine.retrieval().mmr_lambda);
            let params = self.engine.params(Some(self.config.rag_k), None, lambda);
            self.engine.query(&input.message, &params).await?
        } else {
            Vec::new()
        };

        Ok(build_prompt(
            &self.config,
            memory.as_deref(),
            &hits,
            &history,
            &input.message,
        ))
    }

    pub async fn reply(&self, input: &ChatInput) -> Result<String, ChatError> {
        let prompt = self.prepare(input).await?;
        let reply = self.llm.complete(&input.model, &prompt).await?;
        if let Some(id) = &input.session_id {
            self.record_exchange(id, &input.message, &reply).await?;
        }
        Ok(reply)
    }

    /// Stream the reply. Session persistence happens after a clean finish;
    /// a failure to persist is logged and does not affect the stream.
    pub async fn stream(&self, input: &ChatInput, request_id: &str) -> Result<TokenStream, ChatError> {
        let prompt = self.prepare(input).await?;
        let mut tokens = self.llm.stream(&input.model, &prompt);

        tracing::info!(event = "chat.stream.start", request_id, model = %input.model, "stream started");
        let service = self.clone();
        let input = input.clone();
        let request_id = request_id.to_string();

        Ok(Box::pin(async_stream::stream! {
            let mut reply = String::new();
            while let Some(item) = tokens.next().await {
                match item {
                    Ok(token) => {
                        reply.push_str(&token);
                        yield Ok(token);
                    }
                    Err(err) => {
                        tracing::error!(
                            event = "chat.stream.error",
                            request_id = %request_id,
                            model = %input.model,
                            error = %err,
                            "stream failed"
                        );
                        yield Err(err);
                        return;
                    }
                }
            }

            tracing::info!(
                event = "chat.stream.complete",
                request_id = %request_id,
                model = %input.model,
                chars = reply.chars().count(),
                "stream complete"
            );
            if let Some(id) = &input.session_id {
                if let Err(e) = service.record_exchange(id, &input.message, &reply).await {
                    tracing::warn!(session_id = %id, error = %e, "failed to persist streamed reply");
                }
            }
        }))
    }

    async fn record_exchange(&self, session_id: &str, message: &str, reply: &str) -> Result<(), SessionError> {
        self.sessions
            .append_message(session_id, Role::User, message, None)
            .await?;
        self.sessions
            .append_message(session_id, Role::Assistant, reply, None)
            .await?;
        Ok(())
    }
}
