use crate::llm::{ChatSession, LlmError, ModelReply};
use crate::prompt::{self, PromptReason, ERROR_MARKER};
use crate::transcribe::CommandInput;
use log::{info, warn};
use shared::{GenerationConfig, SceneContext};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl From<&GenerationConfig> for RetryPolicy {
    fn from(config: &GenerationConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: config.retry_backoff(),
        }
    }
}

/// One script request as seen by the generation loop.
pub struct GenerationJob<'a> {
    pub command: &'a CommandInput,
    pub context: &'a SceneContext,
    /// Reason for the first attempt. Later attempts always ask again after
    /// an unusable reply.
    pub first_reason: PromptReason<'a>,
    /// Attach the recording until the session has accepted a turn with it.
    pub attach_audio: bool,
}

#[derive(Debug)]
pub enum AttemptFailure {
    Empty,
    ErrorMarker(String),
    Blocked(String),
    Model(LlmError),
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptFailure::Empty => write!(f, "empty reply"),
            AttemptFailure::ErrorMarker(line) => write!(f, "model declined: {}", line),
            AttemptFailure::Blocked(reason) => write!(f, "reply blocked ({})", reason),
            AttemptFailure::Model(e) => write!(f, "{}", e),
        }
    }
}

#[derive(Debug)]
pub struct GenerationFailure {
    pub attempts: u32,
    pub last: AttemptFailure,
}

impl fmt::Display for GenerationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no usable script after {} attempt(s): {}", self.attempts, self.last)
    }
}

/// Unwrap a reply fenced as a Markdown code block.
pub fn strip_code_fence(reply: &str) -> &str {
    let trimmed = reply.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string, e.g. "python".
    let body = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => return "",
    };
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

/// Accept a reply only if it holds a non-blank script with no error marker.
pub fn validate_reply(reply: &ModelReply) -> Result<String, AttemptFailure> {
    match reply {
        ModelReply::Blocked(reason) => Err(AttemptFailure::Blocked(reason.clone())),
        ModelReply::Text(text) => {
            let script = strip_code_fence(text);
            if script.is_empty() {
                return Err(AttemptFailure::Empty);
            }
            if let Some(line) = script.lines().find(|l| l.contains(ERROR_MARKER)) {
                return Err(AttemptFailure::ErrorMarker(line.trim().to_string()));
            }
            Ok(script.to_string())
        }
    }
}

/// Ask the session for a script, retrying unusable replies up to the policy
/// limit. The first usable reply wins.
pub async fn generate(
    session: &mut dyn ChatSession,
    job: &GenerationJob<'_>,
    policy: &RetryPolicy,
) -> Result<String, GenerationFailure> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attach_audio = job.attach_audio;
    let mut last = AttemptFailure::Empty;

    for attempt in 1..=max_attempts {
        info!("Script generation attempt {}/{}", attempt, max_attempts);

        let reason = if attempt == 1 {
            job.first_reason
        } else {
            PromptReason::NothingUsable
        };
        let text = prompt::build(job.command, job.context, reason);
        let audio = match (attach_audio, job.command) {
            (true, CommandInput::Audio(wav)) => Some(wav.as_slice()),
            _ => None,
        };

        let outcome = match session.send(&text, audio).await {
            Ok(reply) => {
                if matches!(reply, ModelReply::Text(_)) {
                    attach_audio = false;
                }
                validate_reply(&reply)
            }
            Err(e) => Err(AttemptFailure::Model(e)),
        };

        match outcome {
            Ok(script) => {
                info!("Generated script on attempt {}", attempt);
                return Ok(script);
            }
            Err(failure) => {
                warn!("Script generation attempt {} failed: {}", attempt, failure);
                last = failure;
            }
        }

        if attempt < max_attempts {
            tokio::time::sleep(policy.backoff).await;
        }
    }

    Err(GenerationFailure {
        attempts: max_attempts,
        last,
    })
}
