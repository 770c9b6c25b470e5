//! CompletionClient trait — the abstraction over the language model.
//!
//! The orchestrator serializes the transcript into wire messages and asks
//! for the next completion as raw text; all structure (actions, tool
//! calls) lives in the tag protocol inside the text, so the client surface
//! is deliberately small.

use async_trait::async_trait;

use crate::error::ProviderError;
use crate::message::WireMessage;

/// A chat-completion backend.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// A human-readable name for this backend (e.g. "groq", "openai").
    fn name(&self) -> &str;

    /// Send the conversation and return the model's raw output text.
    async fn complete(&self, messages: &[WireMessage]) -> Result<String, ProviderError>;
}
