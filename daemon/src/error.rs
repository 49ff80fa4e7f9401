use crate::llm::LlmError;
use crate::transcribe::TranscribeError;
use shared::ConfigError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        source: std::io::Error,
    },

    #[error("{0} is not set")]
    MissingEnv(&'static str),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("AI backend error: {0}")]
    Llm(#[from] LlmError),

    #[error("transcription backend error: {0}")]
    Transcribe(#[from] TranscribeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
