use crate::audio::{AudioError, AudioSource};
use crate::capture::{CaptureEvents, CaptureWorker};
use crate::connection::Connection;
use crate::daemon::Daemon;
use crate::server::Shutdown;
use crate::utterance::{ListenSettings, UtteranceRecorder};
use crate::wake::{WakePhrases, WakeRecognizer};
use anyhow::Context;
use log::{error, info};
use shared::{CaptureConfig, Config, WakeConfig};
use std::sync::Arc;
use tokio::runtime::Handle;

/// Microphone and wake-word recognizer for one connection. Opened on the
/// audio worker thread and never moved off it.
pub struct AudioDevices {
    pub source: Box<dyn AudioSource>,
    pub recognizer: Box<dyn WakeRecognizer>,
}

pub trait AudioBackend: Send + Sync {
    fn open(&self) -> Result<AudioDevices, AudioError>;
}

/// Real input devices. Each half is only available when its feature is
/// compiled in.
pub struct LiveAudio {
    capture: CaptureConfig,
    wake: WakeConfig,
}

impl LiveAudio {
    pub fn new(config: &Config) -> Self {
        Self {
            capture: config.capture.clone(),
            wake: config.wake.clone(),
        }
    }

    #[cfg(feature = "microphone")]
    fn open_microphone(&self) -> Result<Box<dyn AudioSource>, AudioError> {
        Ok(Box::new(crate::audio::MicrophoneSource::open(&self.capture)?))
    }

    #[cfg(not(feature = "microphone"))]
    fn open_microphone(&self) -> Result<Box<dyn AudioSource>, AudioError> {
        Err(AudioError::Unavailable(format!(
            "microphone capture at {} Hz is not compiled in (build with --features microphone)",
            self.capture.sample_rate
        )))
    }

    #[cfg(feature = "vosk")]
    fn open_recognizer(&self, sample_rate: u32) -> Result<Box<dyn WakeRecognizer>, AudioError> {
        let recognizer = crate::wake::VoskRecognizer::new(&self.wake.model_path, sample_rate, &self.wake.phrases)?;
        Ok(Box::new(recognizer))
    }

    #[cfg(not(feature = "vosk"))]
    fn open_recognizer(&self, _sample_rate: u32) -> Result<Box<dyn WakeRecognizer>, AudioError> {
        Err(AudioError::Unavailable(format!(
            "wake-word recognition with {} is not compiled in (build with --features vosk)",
            self.wake.model_path.display()
        )))
    }
}

impl AudioBackend for LiveAudio {
    fn open(&self) -> Result<AudioDevices, AudioError> {
        let source = self.open_microphone()?;
        let recognizer = self.open_recognizer(source.sample_rate())?;
        Ok(AudioDevices { source, recognizer })
    }
}

/// Everything a connection's audio worker needs besides the connection.
#[derive(Clone)]
pub struct AudioPipeline {
    backend: Arc<dyn AudioBackend>,
    phrases: WakePhrases,
    listen: ListenSettings,
}

impl AudioPipeline {
    pub fn new(backend: Arc<dyn AudioBackend>, config: &Config) -> Self {
        Self {
            backend,
            phrases: WakePhrases::new(config.wake.phrases.iter().cloned()),
            listen: ListenSettings::from(&config.capture),
        }
    }
}

struct ConnectionEvents<'a> {
    daemon: &'a Daemon,
    conn: &'a Connection,
    shutdown: &'a Shutdown,
    handle: Handle,
}

impl CaptureEvents for ConnectionEvents<'_> {
    fn notify(&mut self, message: &str) {
        self.conn.info(message);
    }

    fn command_captured(&mut self, wav: Vec<u8>) {
        self.handle.block_on(self.daemon.process_captured(self.conn, wav));
    }

    fn should_stop(&self) -> bool {
        self.conn.is_closed() || self.shutdown.is_triggered()
    }
}

/// Body of the per-connection audio worker. Runs on a blocking thread until
/// the connection closes or the server shuts down. Device failures end the
/// worker and are reported to the client once.
pub fn run_audio_worker(
    daemon: Arc<Daemon>,
    conn: Arc<Connection>,
    pipeline: AudioPipeline,
    shutdown: Shutdown,
    handle: Handle,
) -> anyhow::Result<()> {
    let devices = match pipeline.backend.open() {
        Ok(devices) => devices,
        Err(e) => {
            error!("[{}] Audio input unavailable: {}", conn, e);
            conn.error(format!("Audio input unavailable: {}", e));
            return Err(e).context("failed to open audio input");
        }
    };

    info!("[{}] Audio worker started", conn);
    let mut worker = CaptureWorker::new(
        devices.source,
        devices.recognizer,
        pipeline.phrases,
        UtteranceRecorder::new(pipeline.listen),
    );
    let mut events = ConnectionEvents {
        daemon: &daemon,
        conn: &conn,
        shutdown: &shutdown,
        handle,
    };

    if let Err(e) = worker.run(&mut events) {
        error!("[{}] Audio worker stopped: {}", conn, e);
        conn.error(format!("Audio worker stopped: {}", e));
        return Err(e).context("audio capture failed");
    }

    info!("[{}] Audio worker finished", conn);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::testing::{silence, tone, ScriptedSource};
    use crate::capture::{ADJUSTING_NOISE, LISTENING, LISTENING_FOR_WAKE_WORD, WAKE_WORD_DETECTED};
    use crate::connection::Outbox;
    use crate::llm::{ChatSession, LlmError, ModelReply, ScriptModel};
    use crate::server::shutdown_channel;
    use crate::transcribe::{Transcribers, UnavailableTranscriber};
    use crate::wake::testing::ScriptedRecognizer;
    use crate::wake::Recognition;
    use async_trait::async_trait;
    use shared::DaemonMessage;
    use std::time::Duration;

    const FRAME: usize = 1600;

    struct NoModel;

    struct NoSession;

    impl ScriptModel for NoModel {
        fn start_session(&self, _model: &str) -> Box<dyn ChatSession> {
            Box::new(NoSession)
        }
    }

    #[async_trait]
    impl ChatSession for NoSession {
        async fn send(&mut self, _prompt: &str, _audio: Option<&[u8]>) -> Result<ModelReply, LlmError> {
            Ok(ModelReply::Text("import bpy".to_string()))
        }
    }

    enum FakeBackend {
        Broken,
        Scripted(Vec<Vec<i16>>),
    }

    impl AudioBackend for FakeBackend {
        fn open(&self) -> Result<AudioDevices, AudioError> {
            match self {
                FakeBackend::Broken => Err(AudioError::Device("no input device".to_string())),
                FakeBackend::Scripted(frames) => Ok(AudioDevices {
                    source: Box::new(ScriptedSource::new(frames.clone(), Some(silence(FRAME)))),
                    recognizer: Box::new(ScriptedRecognizer::new(vec![Recognition::Final(
                        "okay blender".to_string(),
                    )])),
                }),
            }
        }
    }

    fn setup(backend: FakeBackend) -> (Arc<Daemon>, AudioPipeline) {
        let mut config = Config::default();
        config.capture.calibration_ms = 200;
        config.capture.pause_threshold_ms = 300;
        config.capture.listen_timeout_secs = 1;
        let unavailable = || Arc::new(UnavailableTranscriber::new("test", "not needed"));
        let daemon = Daemon::new(
            &config,
            Arc::new(NoModel),
            Transcribers::new(unavailable(), unavailable()),
        );
        (Arc::new(daemon), AudioPipeline::new(Arc::new(backend), &config))
    }

    fn connection() -> (Arc<Connection>, tokio::sync::mpsc::UnboundedReceiver<DaemonMessage>) {
        let (outbox, rx) = Outbox::channel();
        (Arc::new(Connection::new("127.0.0.1:4100".parse().unwrap(), outbox)), rx)
    }

    #[tokio::test]
    async fn device_failure_is_reported_once_and_ends_the_worker() {
        let (daemon, pipeline) = setup(FakeBackend::Broken);
        let (conn, mut rx) = connection();
        let (_trigger, shutdown) = shutdown_channel();

        let handle = Handle::current();
        let result = tokio::task::spawn_blocking({
            let conn = conn.clone();
            move || run_audio_worker(daemon, conn, pipeline, shutdown, handle)
        })
        .await
        .unwrap();

        assert!(result.is_err());
        match rx.try_recv().unwrap() {
            DaemonMessage::Error { message, request_id, .. } => {
                assert!(message.contains("no input device"));
                assert!(request_id.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn spoken_command_becomes_a_context_request() {
        let mut frames = vec![silence(FRAME), silence(FRAME), silence(FRAME)];
        frames.extend(std::iter::repeat(tone(FRAME, 3000)).take(5));
        let (daemon, pipeline) = setup(FakeBackend::Scripted(frames));
        let (conn, mut rx) = connection();
        let (_trigger, shutdown) = shutdown_channel();

        daemon
            .handle_message(
                &conn,
                shared::ClientMessage::Configure {
                    model: "m1".to_string(),
                    method: shared::TranscriptionMethod::DirectAudio,
                },
            )
            .await;
        rx.recv().await.unwrap();

        let handle = Handle::current();
        let worker = tokio::task::spawn_blocking({
            let (daemon, conn) = (daemon.clone(), conn.clone());
            move || run_audio_worker(daemon, conn, pipeline, shutdown, handle)
        });

        let mut messages = Vec::new();
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            let done = matches!(message, DaemonMessage::RequestContext { .. });
            messages.push(message);
            if done {
                break;
            }
        }
        conn.close();
        worker.await.unwrap().unwrap();

        let narration: Vec<DaemonMessage> = [LISTENING_FOR_WAKE_WORD, WAKE_WORD_DETECTED, ADJUSTING_NOISE, LISTENING]
            .into_iter()
            .map(DaemonMessage::info)
            .collect();
        assert_eq!(&messages[..4], narration.as_slice());
        assert_eq!(messages.len(), 5);
        assert_eq!(daemon.correlator().pending_count().await, 1);
    }

    #[tokio::test]
    async fn shutdown_stops_the_worker() {
        let (daemon, pipeline) = setup(FakeBackend::Scripted(vec![]));
        let (conn, _rx) = connection();
        let (trigger, shutdown) = shutdown_channel();
        trigger.trigger();

        let handle = Handle::current();
        let result = tokio::task::spawn_blocking(move || run_audio_worker(daemon, conn, pipeline, shutdown, handle))
            .await
            .unwrap();
        assert!(result.is_ok());
    }
}
