//! Streaming model clients
//!
//! Thin clients for the two provider shapes the backends consume, plus the
//! shared chat message types.

pub mod completion;
pub mod messages;
pub mod openai;
pub mod sse;

use thiserror::Error;

pub use completion::{CompletionChunk, CompletionClient};
pub use messages::{estimate_text_tokens, estimate_tokens, ChatMessage, FunctionCall, Tool, ToolCall};
pub use openai::{ChatDelta, OpenAiClient, ToolCallDelta};

/// Error type for model provider calls
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("provider returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid stream payload: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Token counts reported by a provider
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}
