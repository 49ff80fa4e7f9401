//! Shared helpers for the end-to-end tests: a server on an ephemeral port with
//! scripted AI and transcription backends, and a minimal protocol client.
#![allow(dead_code)]

use articulate_daemon::llm::{ChatSession, LlmError, ModelReply, ScriptModel};
use articulate_daemon::transcribe::{TranscribeError, Transcriber, Transcribers};
use articulate_daemon::{shutdown_channel, Daemon, Server, ShutdownTrigger};
use async_trait::async_trait;
use serde_json::Value;
use shared::protocol::{receive_message, send_message, MessageBuffer};
use shared::{Config, DaemonMessage};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything the fake model saw.
#[derive(Debug, Default)]
pub struct ModelLog {
    pub sessions: Vec<String>,
    pub prompts: Vec<String>,
}

/// Replies from a shared queue, falling back to `default` once it is empty.
#[derive(Clone)]
pub struct FakeModel {
    pub log: Arc<Mutex<ModelLog>>,
    replies: Arc<Mutex<VecDeque<String>>>,
    default: String,
}

impl FakeModel {
    pub fn replying(default: &str) -> Self {
        Self {
            log: Arc::default(),
            replies: Arc::default(),
            default: default.to_string(),
        }
    }

    pub fn queue(&self, reply: &str) {
        self.replies.lock().unwrap().push_back(reply.to_string());
    }

    pub fn prompts(&self) -> Vec<String> {
        self.log.lock().unwrap().prompts.clone()
    }

    pub fn sessions(&self) -> usize {
        self.log.lock().unwrap().sessions.len()
    }
}

impl ScriptModel for FakeModel {
    fn start_session(&self, model: &str) -> Box<dyn ChatSession> {
        self.log.lock().unwrap().sessions.push(model.to_string());
        Box::new(self.clone())
    }
}

#[async_trait]
impl ChatSession for FakeModel {
    async fn send(&mut self, prompt: &str, _audio: Option<&[u8]>) -> Result<ModelReply, LlmError> {
        self.log.lock().unwrap().prompts.push(prompt.to_string());
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default.clone());
        Ok(ModelReply::Text(reply))
    }
}

pub struct FixedTranscriber(pub &'static str);

#[async_trait]
impl Transcriber for FixedTranscriber {
    async fn transcribe(&self, _wav: &[u8]) -> Result<String, TranscribeError> {
        Ok(self.0.to_string())
    }
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub daemon: Arc<Daemon>,
    pub model: FakeModel,
    trigger: ShutdownTrigger,
    task: JoinHandle<()>,
}

impl TestServer {
    pub async fn start(model: FakeModel) -> Self {
        let mut config = Config::default();
        config.server.port = 0;
        config.server.read_timeout_ms = 50;
        config.generation.retry_backoff_ms = 1;

        let transcribers = Transcribers::new(
            Arc::new(FixedTranscriber("select the cube")),
            Arc::new(FixedTranscriber("select the cube")),
        );
        let daemon = Arc::new(Daemon::new(&config, Arc::new(model.clone()), transcribers));
        let server = Server::bind(&config, daemon.clone(), None).await.unwrap();
        let addr = server.local_addr().unwrap();

        let (trigger, shutdown) = shutdown_channel();
        let task = tokio::spawn(async move {
            server.run(shutdown).await.unwrap();
        });

        Self {
            addr,
            daemon,
            model,
            trigger,
            task,
        }
    }

    pub async fn connect(&self) -> TestClient {
        let mut client = TestClient {
            stream: TcpStream::connect(self.addr).await.unwrap(),
            buffer: MessageBuffer::default(),
        };
        assert_eq!(
            client.recv().await,
            DaemonMessage::Ready {
                message: "Server ready and connected.".to_string()
            }
        );
        client
    }

    /// Wait until the server has dropped every pending request.
    pub async fn wait_for_no_pending(&self) {
        tokio::time::timeout(RECV_TIMEOUT, async {
            while self.daemon.correlator().pending_count().await > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    pub async fn shutdown(self) {
        self.trigger.trigger();
        tokio::time::timeout(RECV_TIMEOUT, self.task).await.unwrap().unwrap();
    }
}

pub struct TestClient {
    pub stream: TcpStream,
    buffer: MessageBuffer,
}

impl TestClient {
    pub async fn send(&mut self, message: Value) {
        send_message(&mut self.stream, &message).await.unwrap();
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        use tokio::io::AsyncWriteExt;
        self.stream.write_all(bytes).await.unwrap();
    }

    pub async fn recv(&mut self) -> DaemonMessage {
        self.try_recv(RECV_TIMEOUT).await.expect("expected a message from the server")
    }

    /// `None` if nothing arrives within `wait` or the server closed the stream.
    pub async fn try_recv(&mut self, wait: Duration) -> Option<DaemonMessage> {
        match tokio::time::timeout(wait, receive_message(&mut self.stream, &mut self.buffer)).await {
            Ok(result) => result.unwrap(),
            Err(_) => None,
        }
    }

    pub async fn configure(&mut self, model: &str, method: &str) {
        self.send(serde_json::json!({"type": "configure", "model": model, "method": method}))
            .await;
        match self.recv().await {
            DaemonMessage::Info { message } => assert!(message.starts_with("Configuration received")),
            other => panic!("unexpected reply to configure: {:?}", other),
        }
    }
}
