use crate::llm::{ChatSession, LlmError, ModelReply, ScriptModel};
use async_trait::async_trait;
use base64::Engine;
use log::{debug, warn};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use shared::GeminiConfig;
use std::sync::Arc;
use std::time::Duration;

pub const API_KEY_ENV: &str = "GEMINI_API_KEY";

const SAFETY_CATEGORIES: [&str; 4] = [
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
];
const SAFETY_THRESHOLD: &str = "BLOCK_MEDIUM_AND_ABOVE";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
    safety_settings: Vec<SafetySetting>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Content {
    role: String,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    inline_data: Option<InlineData>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    top_k: u32,
    max_output_tokens: u32,
}

#[derive(Debug, Clone, Serialize)]
struct SafetySetting {
    category: &'static str,
    threshold: &'static str,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    #[serde(default)]
    message: String,
}

impl Content {
    fn user(prompt: &str, audio: Option<&[u8]>) -> Self {
        let mut parts = vec![Part {
            text: Some(prompt.to_string()),
            ..Default::default()
        }];
        if let Some(wav) = audio {
            parts.push(Part {
                inline_data: Some(InlineData {
                    mime_type: "audio/wav".to_string(),
                    data: base64::engine::general_purpose::STANDARD.encode(wav),
                }),
                ..Default::default()
            });
        }
        Self {
            role: "user".to_string(),
            parts,
        }
    }

    fn model(text: &str) -> Self {
        Self {
            role: "model".to_string(),
            parts: vec![Part {
                text: Some(text.to_string()),
                ..Default::default()
            }],
        }
    }

    fn text(&self) -> String {
        self.parts.iter().filter_map(|p| p.text.as_deref()).collect()
    }
}

impl GenerateContentResponse {
    fn into_reply(self) -> Result<ModelReply, LlmError> {
        if let Some(reason) = self.prompt_feedback.and_then(|f| f.block_reason) {
            return Ok(ModelReply::Blocked(reason));
        }

        let candidate = self
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse("no candidates in response".to_string()))?;

        let text = candidate.content.as_ref().map(Content::text).unwrap_or_default();
        match candidate.finish_reason.as_deref() {
            Some(reason @ ("SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT"))
                if text.trim().is_empty() =>
            {
                Ok(ModelReply::Blocked(reason.to_string()))
            }
            _ => Ok(ModelReply::Text(text)),
        }
    }
}

struct GeminiShared {
    http: reqwest::Client,
    api_key: SecretString,
    config: GeminiConfig,
}

/// Google Gemini `generateContent` backend.
#[derive(Clone)]
pub struct GeminiClient {
    shared: Arc<GeminiShared>,
}

impl GeminiClient {
    pub fn new(config: &GeminiConfig, api_key: SecretString) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            shared: Arc::new(GeminiShared {
                http,
                api_key,
                config: config.clone(),
            }),
        })
    }
}

impl ScriptModel for GeminiClient {
    fn start_session(&self, model: &str) -> Box<dyn ChatSession> {
        Box::new(GeminiSession {
            shared: Arc::clone(&self.shared),
            model: model.to_string(),
            history: Vec::new(),
        })
    }
}

/// One conversation. Turns are kept in memory only.
pub struct GeminiSession {
    shared: Arc<GeminiShared>,
    model: String,
    history: Vec<Content>,
}

impl GeminiSession {
    fn url(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.shared.config.endpoint.trim_end_matches('/'),
            self.model
        )
    }

    fn request(&self, prompt: &str, audio: Option<&[u8]>) -> GenerateContentRequest {
        let config = &self.shared.config;
        let mut contents = self.history.clone();
        contents.push(Content::user(prompt, audio));

        GenerateContentRequest {
            contents,
            generation_config: GenerationConfig {
                temperature: config.temperature,
                top_p: config.top_p,
                top_k: config.top_k,
                max_output_tokens: config.max_output_tokens,
            },
            safety_settings: SAFETY_CATEGORIES
                .iter()
                .map(|&category| SafetySetting {
                    category,
                    threshold: SAFETY_THRESHOLD,
                })
                .collect(),
        }
    }
}

#[async_trait]
impl ChatSession for GeminiSession {
    async fn send(&mut self, prompt: &str, audio: Option<&[u8]>) -> Result<ModelReply, LlmError> {
        let body = self.request(prompt, audio);
        debug!(
            "Calling {} with {} turns (audio: {})",
            self.model,
            body.contents.len(),
            audio.is_some()
        );

        let response = self
            .shared
            .http
            .post(self.url())
            .header("x-goog-api-key", self.shared.api_key.expose_secret())
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let raw = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiErrorBody>(&raw)
                .map(|b| b.error.message)
                .unwrap_or(raw);
            return Err(LlmError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: GenerateContentResponse = response.json().await?;
        let reply = parsed.into_reply()?;

        match &reply {
            ModelReply::Text(text) => {
                self.history.push(Content::user(prompt, audio));
                self.history.push(Content::model(text));
            }
            ModelReply::Blocked(reason) => warn!("Gemini blocked the request: {}", reason),
        }
        Ok(reply)
    }
}
