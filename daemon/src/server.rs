use crate::connection::{Connection, Outbox};
use crate::daemon::Daemon;
use crate::error::DaemonError;
use crate::listener::{run_audio_worker, AudioPipeline};
use log::{debug, error, info, warn};
use serde_json::Value;
use shared::protocol::{send_message, MessageBuffer};
use shared::{Config, DaemonMessage};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

const READ_CHUNK: usize = 8192;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Receiving side of the process-wide shutdown signal.
#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

pub fn shutdown_channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, Shutdown { rx })
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

impl Shutdown {
    /// A dropped trigger counts as shutdown.
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    pub async fn wait(&mut self) {
        let _ = self.rx.wait_for(|stop| *stop).await;
    }
}

#[derive(Debug, Clone, Copy)]
struct ConnectionSettings {
    read_timeout: Duration,
    max_frame_bytes: usize,
}

/// Why a connection's read loop ended.
#[derive(Debug)]
enum ReadExit {
    PeerClosed,
    Closed,
    Shutdown,
    Failed(std::io::Error),
}

pub struct Server {
    listener: TcpListener,
    daemon: Arc<Daemon>,
    audio: Option<AudioPipeline>,
    settings: ConnectionSettings,
}

impl Server {
    /// Bind the configured address. `audio` is `None` when connections should
    /// not get an audio worker.
    pub async fn bind(config: &Config, daemon: Arc<Daemon>, audio: Option<AudioPipeline>) -> Result<Self, DaemonError> {
        let address = config.server.bind_address();
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|source| DaemonError::Bind { address, source })?;

        Ok(Self {
            listener,
            daemon,
            audio,
            settings: ConnectionSettings {
                read_timeout: config.server.read_timeout(),
                max_frame_bytes: config.server.max_frame_bytes,
            },
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, DaemonError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until shutdown, then give open connections a short
    /// grace period before aborting them.
    pub async fn run(self, mut shutdown: Shutdown) -> Result<(), DaemonError> {
        info!("Server listening on {}", self.local_addr()?);
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        connections.spawn(handle_connection(
                            stream,
                            peer,
                            self.daemon.clone(),
                            self.audio.clone(),
                            shutdown.clone(),
                            self.settings,
                        ));
                    }
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = finished {
                        error!("Connection task failed: {}", e);
                    }
                }
            }
        }

        info!("Shutting down, waiting for {} connection(s)", connections.len());
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("Aborting {} connection(s) still busy", connections.len());
            connections.abort_all();
        }
        info!("Server stopped");
        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    daemon: Arc<Daemon>,
    audio: Option<AudioPipeline>,
    shutdown: Shutdown,
    settings: ConnectionSettings,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("[{}] Cannot set TCP_NODELAY: {}", peer, e);
    }
    let (reader, writer) = stream.into_split();
    let (outbox, rx) = Outbox::channel();
    let conn = Arc::new(Connection::new(peer, outbox));
    info!("[{}] Client connected ({})", conn, conn.id);

    let writer_task = tokio::spawn(write_loop(writer, rx, conn.clone()));
    conn.send(DaemonMessage::Ready {
        message: "Server ready and connected.".to_string(),
    });

    let audio_task = audio.map(|pipeline| {
        let (daemon, conn, shutdown) = (daemon.clone(), conn.clone(), shutdown.clone());
        let handle = Handle::current();
        tokio::task::spawn_blocking(move || run_audio_worker(daemon, conn, pipeline, shutdown, handle))
    });

    match read_loop(&daemon, &conn, reader, shutdown, settings).await {
        ReadExit::PeerClosed => info!("[{}] Client closed the connection", conn),
        ReadExit::Closed => debug!("[{}] Connection closed locally", conn),
        ReadExit::Shutdown => {
            conn.send(DaemonMessage::Stopped {
                message: "Server shutting down.".to_string(),
            });
        }
        ReadExit::Failed(e) => warn!("[{}] Read failed: {}", conn, e),
    }

    daemon.teardown(&conn).await;

    if let Some(task) = audio_task {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("[{}] Audio worker ended with: {:#}", conn, e),
            Err(e) => error!("[{}] Audio worker panicked: {}", conn, e),
        }
    }
    if let Err(e) = writer_task.await {
        error!("[{}] Writer task failed: {}", conn, e);
    }
    info!("[{}] Client disconnected", conn);
}

async fn read_loop(
    daemon: &Daemon,
    conn: &Connection,
    mut reader: OwnedReadHalf,
    mut shutdown: Shutdown,
    settings: ConnectionSettings,
) -> ReadExit {
    let mut buffer = MessageBuffer::new(settings.max_frame_bytes);
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        loop {
            match buffer.next_message::<Value>() {
                Ok(Some(value)) => daemon.handle_value(conn, value).await,
                Ok(None) => break,
                Err(e) => {
                    warn!("[{}] Protocol error: {}", conn, e);
                    conn.error(format!("Protocol error: {}", e));
                }
            }
        }

        tokio::select! {
            _ = shutdown.wait() => return ReadExit::Shutdown,
            _ = conn.closed() => return ReadExit::Closed,
            read = tokio::time::timeout(settings.read_timeout, reader.read(&mut chunk)) => match read {
                Err(_) => {}
                Ok(Ok(0)) => return ReadExit::PeerClosed,
                Ok(Ok(n)) => buffer.extend(&chunk[..n]),
                Ok(Err(e)) => return ReadExit::Failed(e),
            },
        }
    }
}

/// Owns the write half. Queued messages are flushed before the socket is shut
/// down, so a final `stopped` still goes out.
async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<DaemonMessage>, conn: Arc<Connection>) {
    loop {
        let message = tokio::select! {
            biased;
            message = rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
            _ = conn.closed() => {
                while let Ok(message) = rx.try_recv() {
                    if send_message(&mut writer, &message).await.is_err() {
                        break;
                    }
                }
                break;
            }
        };

        if let Err(e) = send_message(&mut writer, &message).await {
            warn!("[{}] Write failed: {}", conn, e);
            conn.close();
            break;
        }
    }

    // The peer may already be gone.
    let _ = writer.shutdown().await;
}
