use crate::connection::{Connection, ConnectionState};
use crate::correlator::{Correlator, CorrelatorError, ExecutionErrorReport, PendingRequest};
use crate::llm::ScriptModel;
use crate::orchestrator::{self, GenerationJob, RetryPolicy};
use crate::prompt::PromptReason;
use crate::transcribe::{CommandInput, Transcribers};
use log::{debug, error, info, warn};
use serde_json::Value;
use shared::{ClientConfig, ClientMessage, Config, DaemonMessage, RequestId, SceneContext, TranscriptionMethod};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

const MESSAGE_TYPES: [&str; 4] = ["configure", "context_response", "process_text", "execution_error"];

/// Shared command-processing core. One instance serves every connection;
/// per-connection state lives in [`Connection`].
pub struct Daemon {
    correlator: Correlator,
    model: Arc<dyn ScriptModel>,
    transcribers: Transcribers,
    policy: RetryPolicy,
    recordings_dir: Option<PathBuf>,
}

impl Daemon {
    pub fn new(config: &Config, model: Arc<dyn ScriptModel>, transcribers: Transcribers) -> Self {
        Self {
            correlator: Correlator::new(config.generation.max_corrections, config.generation.max_delivered),
            model,
            transcribers,
            policy: RetryPolicy::from(&config.generation),
            recordings_dir: config.capture.recordings_dir.clone(),
        }
    }

    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    /// Dispatch one decoded frame. Anything that is not a well-formed client
    /// message is answered with an `error` and otherwise ignored.
    pub async fn handle_value(&self, conn: &Connection, value: Value) {
        let message_type = value.get("type").and_then(Value::as_str).map(str::to_string);

        match serde_json::from_value::<ClientMessage>(value) {
            Ok(message) => self.handle_message(conn, message).await,
            Err(e) => match message_type.as_deref() {
                None => {
                    warn!("[{}] Message without a type: {}", conn, e);
                    conn.error("Invalid message: missing 'type' field.");
                }
                Some("configure") => {
                    warn!("[{}] Invalid configuration message: {}", conn, e);
                    conn.error("Invalid config message received.");
                }
                Some(known) if MESSAGE_TYPES.contains(&known) => {
                    warn!("[{}] Invalid '{}' message: {}", conn, known, e);
                    conn.error(format!("Invalid '{}' message: {}", known, e));
                }
                Some(unknown) => {
                    warn!("[{}] Received unknown message type: '{}'", conn, unknown);
                    conn.error(format!("Unknown message type '{}' received.", unknown));
                }
            },
        }
    }

    pub async fn handle_message(&self, conn: &Connection, message: ClientMessage) {
        debug!("[{}] Handling client message: {:?}", conn, message);

        match message {
            ClientMessage::Configure { model, method } => self.configure(conn, model, method).await,
            ClientMessage::ProcessText { text, context } => self.process_text(conn, text, context).await,
            ClientMessage::ContextResponse { request_id, context } => {
                self.context_response(conn, request_id, context).await
            }
            ClientMessage::ExecutionError {
                request_id,
                error_type,
                error_message,
            } => self.execution_error(conn, request_id, error_type, error_message).await,
        }
    }

    async fn configure(&self, conn: &Connection, model: String, method: TranscriptionMethod) {
        let model = model.trim().to_string();
        if model.is_empty() {
            warn!("[{}] Configuration without a model name", conn);
            conn.error("Invalid config message received.");
            return;
        }

        let mut state = conn.state.lock().await;
        // A new configuration always starts a new conversation.
        state.session = Some(self.model.start_session(&model));
        state.config = Some(ClientConfig {
            model: model.clone(),
            method,
        });
        drop(state);

        info!("[{}] Configured: model {}, method {}", conn, model, method);
        conn.info(format!("Configuration received (Model: {}, Method: {})", model, method));
    }

    /// Text commands carry their own context, so the request is resolved as
    /// soon as it is created.
    async fn process_text(&self, conn: &Connection, text: String, context: SceneContext) {
        let mut state = conn.state.lock().await;

        let config = match state.config.clone() {
            Some(config) => config,
            None => {
                warn!("[{}] Received 'process_text' but client not configured", conn);
                conn.send(DaemonMessage::request_error(
                    RequestId::generate(),
                    "Client not configured.",
                    Some(text),
                ));
                return;
            }
        };

        let text = text.trim().to_string();
        if text.is_empty() {
            warn!("[{}] Invalid 'process_text' request: missing text", conn);
            conn.send(DaemonMessage::request_error(
                RequestId::generate(),
                "Invalid text command: Missing text command.",
                Some(text),
            ));
            return;
        }

        info!("[{}] Text command: {}", conn, text);
        let id = self
            .correlator
            .create(conn.id, CommandInput::Text(text), &config.model, config.method)
            .await;
        match self.correlator.resolve(&id, conn.id).await {
            Ok(request) => self.respond(conn, &mut state, request, &context, None).await,
            Err(e) => error!("[{}] Lost text request {}: {}", conn, id, e),
        }
    }

    async fn context_response(&self, conn: &Connection, request_id: RequestId, context: SceneContext) {
        let mut state = conn.state.lock().await;

        let request = match self.correlator.resolve(&request_id, conn.id).await {
            Ok(request) => request,
            Err(e) => {
                warn!("[{}] Rejected context response: {}", conn, e);
                conn.error(format!("Context response rejected: {}", e));
                return;
            }
        };
        info!("[{}] Received context for request {}", conn, request_id);

        let report = self.correlator.take_execution_error(&request_id, conn.id).await;
        self.respond(conn, &mut state, request, &context, report).await;
    }

    async fn execution_error(&self, conn: &Connection, request_id: RequestId, error_type: String, error_message: String) {
        // Held so a correction cannot interleave with a running generation.
        let _state = conn.state.lock().await;

        match self
            .correlator
            .record_execution_error(&request_id, &error_type, &error_message, conn.id)
            .await
        {
            Ok(()) => {
                info!(
                    "[{}] Script for {} failed in the host: {}: {}",
                    conn, request_id, error_type, error_message
                );
                conn.send(DaemonMessage::RequestContext {
                    message: format!("Script failed ({}): send scene context to retry.", error_type),
                    request_id,
                });
            }
            Err(CorrelatorError::CorrectionLimit { request_id, limit }) => {
                warn!("[{}] Request {} exhausted {} correction round(s)", conn, request_id, limit);
                conn.send(DaemonMessage::request_error(
                    request_id.clone(),
                    format!(
                        "Script generation failed (Request ID: {}): still failing after {} correction(s).",
                        request_id, limit
                    ),
                    None,
                ));
            }
            Err(e) => {
                warn!("[{}] Rejected execution error report: {}", conn, e);
                conn.error(format!("Execution error rejected: {}", e));
            }
        }
    }

    /// Turn a captured recording into a pending request and ask the client
    /// for scene context. Called from the audio worker.
    pub async fn process_captured(&self, conn: &Connection, wav: Vec<u8>) {
        let config = conn.state.lock().await.config.clone();
        let Some(config) = config else {
            warn!("[{}] Command captured but client not configured", conn);
            conn.error("Client configuration missing.");
            return;
        };

        if let Some(dir) = &self.recordings_dir {
            self.save_recording(conn, dir, &wav).await;
        }

        let label = config.method.label();
        // Transcription runs without the state lock so text commands on the
        // same connection are not held up by it.
        let input = match self.transcribers.prepare(config.method, wav).await {
            Ok(input) => input,
            Err(e) => {
                warn!("[{}] {} transcription failed: {}", conn, label, e);
                conn.info(format!("{} transcription failed: {}", label, e));
                return;
            }
        };
        let message = match &input {
            CommandInput::Text(text) => {
                info!("[{}] Transcribed command ({}): {}", conn, label, text);
                format!("Transcribed command ({}): {}", label, text)
            }
            CommandInput::Audio(_) => format!("Processing audio command with {}...", label),
        };

        let state = conn.state.lock().await;
        if conn.is_closed() || state.config.is_none() {
            debug!("[{}] Connection went away during transcription", conn);
            return;
        }
        let id = self
            .correlator
            .create(conn.id, input, &config.model, config.method)
            .await;

        let sent = conn.send(DaemonMessage::RequestContext {
            request_id: id.clone(),
            message,
        });
        if !sent {
            self.correlator.discard(&id).await;
        }
        drop(state);
    }

    /// Release everything the connection owns. Returns `false` if teardown
    /// already ran.
    pub async fn teardown(&self, conn: &Connection) -> bool {
        if !conn.begin_teardown() {
            return false;
        }
        conn.close();

        let mut state = conn.state.lock().await;
        state.clear();
        let purged = self.correlator.purge(conn.id).await;
        drop(state);

        if purged.total() > 0 {
            info!(
                "[{}] Dropped {} pending, {} delivered and {} error entries",
                conn, purged.pending, purged.delivered, purged.errors
            );
        }
        info!("[{}] Connection cleaned up", conn);
        true
    }

    async fn respond(
        &self,
        conn: &Connection,
        state: &mut ConnectionState,
        request: PendingRequest,
        context: &SceneContext,
        report: Option<ExecutionErrorReport>,
    ) {
        let session = state
            .session
            .get_or_insert_with(|| self.model.start_session(&request.model));

        let first_reason = match &report {
            Some(report) => PromptReason::ExecutionFailed {
                category: &report.category,
                detail: &report.detail,
            },
            None => PromptReason::Initial,
        };
        let job = GenerationJob {
            command: &request.input,
            context,
            first_reason,
            attach_audio: request.corrections == 0,
        };
        let original_text = request.input.text().map(str::to_string);

        match orchestrator::generate(&mut **session, &job, &self.policy).await {
            Ok(script) => {
                info!("[{}] Generated script for request {}", conn, request.id);
                debug!("[{}] Script for {}:\n{}", conn, request.id, script);
                let sent = conn.send(DaemonMessage::Script {
                    request_id: request.id.clone(),
                    script,
                    original_text,
                    message: "Generated script".to_string(),
                });
                if sent {
                    self.correlator.mark_delivered(request).await;
                }
            }
            Err(failure) => {
                error!("[{}] Script generation failed for {}: {}", conn, request.id, failure);
                conn.send(DaemonMessage::request_error(
                    request.id.clone(),
                    format!("Script generation failed (Request ID: {}): {}", request.id, failure),
                    original_text,
                ));
            }
        }
    }

    async fn save_recording(&self, conn: &Connection, dir: &Path, wav: &[u8]) {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let suffix: String = Uuid::new_v4().simple().to_string().chars().take(8).collect();
        let path = dir.join(format!("command_audio_{}_{}.wav", stamp, suffix));

        if let Err(e) = tokio::fs::create_dir_all(dir).await {
            warn!("[{}] Cannot create recordings directory {}: {}", conn, dir.display(), e);
            return;
        }
        match tokio::fs::write(&path, wav).await {
            Ok(()) => debug!("[{}] Saved command audio to {}", conn, path.display()),
            Err(e) => warn!("[{}] Failed to save command audio to {}: {}", conn, path.display(), e),
        }
    }
}
