use crate::audio::wav_sample_rate;
use crate::transcribe::{TranscribeError, Transcriber};
use async_trait::async_trait;
use base64::Engine;
use log::{info, warn};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use shared::CloudSttConfig;
use std::time::Duration;

pub const API_KEY_ENV: &str = "GOOGLE_STT_API_KEY";
pub const ACCESS_TOKEN_ENV: &str = "GOOGLE_STT_ACCESS_TOKEN";

/// Ambient credentials for the Speech-to-Text REST API.
pub enum SttCredentials {
    ApiKey(SecretString),
    AccessToken(SecretString),
}

impl SttCredentials {
    /// An API key wins over an access token when both are set.
    pub fn from_env() -> Option<Self> {
        let non_empty = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        if let Some(key) = non_empty(API_KEY_ENV) {
            return Some(SttCredentials::ApiKey(SecretString::from(key)));
        }
        non_empty(ACCESS_TOKEN_ENV).map(|token| SttCredentials::AccessToken(SecretString::from(token)))
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RecognizeRequest<'a> {
    config: RecognitionConfig<'a>,
    audio: RecognitionAudio,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RecognitionConfig<'a> {
    encoding: &'static str,
    sample_rate_hertz: u32,
    language_code: &'a str,
}

#[derive(Debug, Serialize)]
struct RecognitionAudio {
    content: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct RecognizeResponse {
    #[serde(default)]
    results: Vec<RecognitionResult>,
}

#[derive(Debug, Deserialize)]
struct RecognitionResult {
    #[serde(default)]
    alternatives: Vec<Alternative>,
}

#[derive(Debug, Deserialize)]
struct Alternative {
    #[serde(default)]
    transcript: String,
}

impl RecognizeResponse {
    /// Top alternative of the first result, trimmed.
    pub fn transcript(&self) -> Option<String> {
        let text = self.results.first()?.alternatives.first()?.transcript.trim();
        (!text.is_empty()).then(|| text.to_string())
    }
}

/// Google Cloud Speech-to-Text `speech:recognize` over REST.
pub struct GoogleSttTranscriber {
    client: reqwest::Client,
    config: CloudSttConfig,
    credentials: Option<SttCredentials>,
}

impl GoogleSttTranscriber {
    pub fn new(config: &CloudSttConfig, credentials: Option<SttCredentials>, timeout: Duration) -> Result<Self, TranscribeError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        if credentials.is_none() {
            warn!(
                "[Google STT] Neither {} nor {} is set; cloud transcription will fail",
                API_KEY_ENV, ACCESS_TOKEN_ENV
            );
        }
        Ok(Self {
            client,
            config: config.clone(),
            credentials,
        })
    }
}

#[async_trait]
impl Transcriber for GoogleSttTranscriber {
    async fn transcribe(&self, wav: &[u8]) -> Result<String, TranscribeError> {
        let credentials = self.credentials.as_ref().ok_or_else(|| {
            TranscribeError::Unavailable("Google STT", format!("set {} or {}", API_KEY_ENV, ACCESS_TOKEN_ENV))
        })?;
        let sample_rate = wav_sample_rate(wav).map_err(|e| TranscribeError::Audio(e.to_string()))?;

        info!("[Google STT] Transcribing {} bytes at {} Hz", wav.len(), sample_rate);
        let body = RecognizeRequest {
            config: RecognitionConfig {
                encoding: "LINEAR16",
                sample_rate_hertz: sample_rate,
                language_code: &self.config.language_code,
            },
            audio: RecognitionAudio {
                content: base64::engine::general_purpose::STANDARD.encode(wav),
            },
        };

        let request = self.client.post(&self.config.endpoint).json(&body);
        let request = match credentials {
            SttCredentials::ApiKey(key) => request.query(&[("key", key.expose_secret())]),
            SttCredentials::AccessToken(token) => request.bearer_auth(token.expose_secret()),
        };

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(TranscribeError::Backend(format!("HTTP {}: {}", status, detail)));
        }

        let parsed: RecognizeResponse = response.json().await?;
        match parsed.transcript() {
            Some(text) => {
                info!("[Google STT] Transcription result: '{}'", text);
                Ok(text)
            }
            None => {
                warn!("[Google STT] Received no transcription results");
                Err(TranscribeError::NoSpeech)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_alternative_is_used() {
        let response: RecognizeResponse = serde_json::from_str(
            r#"{"results":[{"alternatives":[{"transcript":" add a sphere ","confidence":0.93},
                {"transcript":"add a spear"}]}],"totalBilledTime":"2s"}"#,
        )
        .unwrap();
        assert_eq!(response.transcript().as_deref(), Some("add a sphere"));
    }

    #[test]
    fn empty_response_has_no_transcript() {
        let response: RecognizeResponse = serde_json::from_str("{}").unwrap();
        assert!(response.transcript().is_none());

        let blank: RecognizeResponse =
            serde_json::from_str(r#"{"results":[{"alternatives":[{"transcript":"  "}]}]}"#).unwrap();
        assert!(blank.transcript().is_none());
    }

    #[test]
    fn request_body_uses_api_field_names() {
        let body = RecognizeRequest {
            config: RecognitionConfig {
                encoding: "LINEAR16",
                sample_rate_hertz: 16000,
                language_code: "en-US",
            },
            audio: RecognitionAudio {
                content: base64::engine::general_purpose::STANDARD.encode(b"RIFF"),
            },
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["config"]["sampleRateHertz"], 16000);
        assert_eq!(value["config"]["languageCode"], "en-US");
        assert_eq!(value["audio"]["content"], "UklGRg==");
    }

    #[tokio::test]
    async fn missing_credentials_fail_without_network() {
        let stt = GoogleSttTranscriber::new(&CloudSttConfig::default(), None, Duration::from_secs(1)).unwrap();
        let wav = crate::audio::encode_wav(&[0; 160], 16000).unwrap();
        let err = stt.transcribe(&wav).await.unwrap_err();
        assert!(matches!(err, TranscribeError::Unavailable("Google STT", _)));
    }
}
