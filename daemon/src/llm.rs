use async_trait::async_trait;
use thiserror::Error;

/// What the model answered for one prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelReply {
    Text(String),
    /// The prompt or the answer was withheld, with the stated reason.
    Blocked(String),
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("unexpected response: {0}")]
    InvalidResponse(String),
}

/// A conversation with a model that remembers its earlier turns.
#[async_trait]
pub trait ChatSession: Send {
    /// Send one user turn. `audio` is a WAV recording attached to the turn.
    async fn send(&mut self, prompt: &str, audio: Option<&[u8]>) -> Result<ModelReply, LlmError>;
}

/// Factory for conversations with a named model.
pub trait ScriptModel: Send + Sync {
    fn start_session(&self, model: &str) -> Box<dyn ChatSession>;
}
