use async_trait::async_trait;
use shared::TranscriptionMethod;
use std::sync::Arc;
use thiserror::Error;

/// What a pending request carries into script generation.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandInput {
    Text(String),
    /// WAV bytes forwarded unmodified to the model.
    Audio(Vec<u8>),
}

impl CommandInput {
    pub fn text(&self) -> Option<&str> {
        match self {
            CommandInput::Text(text) => Some(text),
            CommandInput::Audio(_) => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum TranscribeError {
    #[error("no speech recognized")]
    NoSpeech,

    #[error("{0} transcription is not available: {1}")]
    Unavailable(&'static str, String),

    #[error("invalid audio: {0}")]
    Audio(String),

    #[error("transcription backend failed: {0}")]
    Backend(String),

    #[error("transcription request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Converts a WAV recording into text.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, wav: &[u8]) -> Result<String, TranscribeError>;
}

/// The two text-producing strategies. Direct audio needs no backend.
#[derive(Clone)]
pub struct Transcribers {
    pub local: Arc<dyn Transcriber>,
    pub cloud: Arc<dyn Transcriber>,
}

impl Transcribers {
    pub fn new(local: Arc<dyn Transcriber>, cloud: Arc<dyn Transcriber>) -> Self {
        Self { local, cloud }
    }

    /// Turn captured audio into the input for the selected method.
    ///
    /// Succeeds only with non-empty text or the untouched audio.
    pub async fn prepare(
        &self,
        method: TranscriptionMethod,
        wav: Vec<u8>,
    ) -> Result<CommandInput, TranscribeError> {
        let backend = match method {
            TranscriptionMethod::DirectAudio => return Ok(CommandInput::Audio(wav)),
            TranscriptionMethod::Whisper => &self.local,
            TranscriptionMethod::GoogleStt => &self.cloud,
        };

        let text = backend.transcribe(&wav).await?;
        let text = text.trim();
        if text.is_empty() {
            return Err(TranscribeError::NoSpeech);
        }
        Ok(CommandInput::Text(text.to_string()))
    }
}

/// Stand-in for a backend that was not compiled in or could not start.
pub struct UnavailableTranscriber {
    name: &'static str,
    reason: String,
}

impl UnavailableTranscriber {
    pub fn new(name: &'static str, reason: impl Into<String>) -> Self {
        Self {
            name,
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl Transcriber for UnavailableTranscriber {
    async fn transcribe(&self, _wav: &[u8]) -> Result<String, TranscribeError> {
        Err(TranscribeError::Unavailable(self.name, self.reason.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(&'static str);

    #[async_trait]
    impl Transcriber for Fixed {
        async fn transcribe(&self, _wav: &[u8]) -> Result<String, TranscribeError> {
            Ok(self.0.to_string())
        }
    }

    fn transcribers() -> Transcribers {
        Transcribers::new(Arc::new(Fixed("  select the cube \n")), Arc::new(Fixed("   ")))
    }

    #[tokio::test]
    async fn direct_audio_passes_bytes_through() {
        let input = transcribers()
            .prepare(TranscriptionMethod::DirectAudio, vec![1, 2, 3])
            .await
            .unwrap();
        assert_eq!(input, CommandInput::Audio(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn local_transcription_is_trimmed() {
        let input = transcribers()
            .prepare(TranscriptionMethod::Whisper, vec![])
            .await
            .unwrap();
        assert_eq!(input.text(), Some("select the cube"));
    }

    #[tokio::test]
    async fn blank_transcription_is_an_explicit_failure() {
        let err = transcribers()
            .prepare(TranscriptionMethod::GoogleStt, vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, TranscribeError::NoSpeech));
    }

    #[tokio::test]
    async fn unavailable_backend_reports_its_name() {
        let backend = UnavailableTranscriber::new("Whisper", "built without the `whisper` feature");
        let err = backend.transcribe(&[]).await.unwrap_err();
        assert!(err.to_string().starts_with("Whisper transcription is not available"));
    }
}
