use crate::llm::ChatSession;
use shared::{ClientConfig, DaemonMessage};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{mpsc, watch, Mutex};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of an accepted socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Mutable per-connection state, guarded by the connection mutex.
#[derive(Default)]
pub struct ConnectionState {
    pub config: Option<ClientConfig>,
    pub session: Option<Box<dyn ChatSession>>,
}

impl ConnectionState {
    pub fn clear(&mut self) {
        self.config = None;
        self.session = None;
    }
}

/// Sending half of the channel drained by the connection's writer task.
#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<DaemonMessage>,
}

impl Outbox {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<DaemonMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue a message. Returns `false` once the writer has gone away.
    pub fn send(&self, message: DaemonMessage) -> bool {
        self.tx.send(message).is_ok()
    }
}

pub struct Connection {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    pub state: Mutex<ConnectionState>,
    outbox: Outbox,
    closed: watch::Sender<bool>,
    torn_down: AtomicBool,
}

impl Connection {
    pub fn new(peer: SocketAddr, outbox: Outbox) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            id: ConnectionId::next(),
            peer,
            state: Mutex::new(ConnectionState::default()),
            outbox,
            closed,
            torn_down: AtomicBool::new(false),
        }
    }

    /// Queue a message for the client. Messages to a closed connection are
    /// dropped.
    pub fn send(&self, message: DaemonMessage) -> bool {
        if self.is_closed() {
            return false;
        }
        self.outbox.send(message)
    }

    pub fn info(&self, message: impl Into<String>) -> bool {
        self.send(DaemonMessage::info(message))
    }

    pub fn error(&self, message: impl Into<String>) -> bool {
        self.send(DaemonMessage::error(message))
    }

    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the connection has been closed.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// True for exactly one caller.
    pub fn begin_teardown(&self) -> bool {
        !self.torn_down.swap(true, Ordering::SeqCst)
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection() -> (Connection, mpsc::UnboundedReceiver<DaemonMessage>) {
        let (outbox, rx) = Outbox::channel();
        (Connection::new("127.0.0.1:5000".parse().unwrap(), outbox), rx)
    }

    #[test]
    fn ids_are_unique() {
        let (a, _) = connection();
        let (b, _) = connection();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn teardown_is_claimed_once() {
        let (conn, _rx) = connection();
        assert!(conn.begin_teardown());
        assert!(!conn.begin_teardown());
    }

    #[test]
    fn closed_connection_drops_messages() {
        let (conn, mut rx) = connection();
        assert!(conn.info("first"));
        conn.close();
        assert!(!conn.info("second"));

        assert_eq!(rx.try_recv().unwrap(), DaemonMessage::info("first"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn close_wakes_watchers() {
        let (conn, _rx) = connection();
        let conn = std::sync::Arc::new(conn);
        let waiter = tokio::spawn({
            let conn = conn.clone();
            async move { conn.closed().await }
        });
        conn.close();
        waiter.await.unwrap();
        assert!(conn.is_closed());
        // Already closed: returns at once.
        conn.closed().await;
    }
}
