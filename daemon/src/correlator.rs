use crate::connection::ConnectionId;
use crate::transcribe::CommandInput;
use log::debug;
use shared::{RequestId, TranscriptionMethod};
use std::collections::{HashMap, VecDeque};
use thiserror::Error;
use tokio::sync::Mutex;

/// A command waiting for the client's scene context.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRequest {
    pub id: RequestId,
    pub connection: ConnectionId,
    pub input: CommandInput,
    pub model: String,
    pub method: TranscriptionMethod,
    /// Correction rounds already run after failed executions.
    pub corrections: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionErrorReport {
    pub category: String,
    pub detail: String,
    pub connection: ConnectionId,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CorrelatorError {
    #[error("unknown or expired request ID: {0}")]
    NotFound(RequestId),

    #[error("request {0} belongs to another connection")]
    NotOwner(RequestId),

    #[error("request {request_id} already went through {limit} correction round(s)")]
    CorrectionLimit { request_id: RequestId, limit: u32 },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PurgeStats {
    pub pending: usize,
    pub delivered: usize,
    pub errors: usize,
}

impl PurgeStats {
    pub fn total(&self) -> usize {
        self.pending + self.delivered + self.errors
    }
}

#[derive(Default)]
struct Tables {
    pending: HashMap<RequestId, PendingRequest>,
    delivered: HashMap<RequestId, PendingRequest>,
    /// Delivered ids per connection, oldest first.
    delivery_order: HashMap<ConnectionId, VecDeque<RequestId>>,
    errors: HashMap<RequestId, ExecutionErrorReport>,
}

impl Tables {
    fn take_delivered(&mut self, id: &RequestId) -> Option<PendingRequest> {
        let request = self.delivered.remove(id)?;
        if let Some(order) = self.delivery_order.get_mut(&request.connection) {
            order.retain(|delivered| delivered != id);
            if order.is_empty() {
                self.delivery_order.remove(&request.connection);
            }
        }
        Some(request)
    }
}

/// Matches asynchronous client replies back to the request that caused
/// them. Every entry is owned by one connection and is only visible to it.
pub struct Correlator {
    tables: Mutex<Tables>,
    max_corrections: u32,
    max_delivered: usize,
}

impl Correlator {
    /// `max_delivered` is per connection and at least one.
    pub fn new(max_corrections: u32, max_delivered: usize) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            max_corrections,
            max_delivered: max_delivered.max(1),
        }
    }

    pub async fn create(
        &self,
        connection: ConnectionId,
        input: CommandInput,
        model: &str,
        method: TranscriptionMethod,
    ) -> RequestId {
        let id = RequestId::generate();
        let request = PendingRequest {
            id: id.clone(),
            connection,
            input,
            model: model.to_string(),
            method,
            corrections: 0,
        };
        self.tables.lock().await.pending.insert(id.clone(), request);
        debug!("Stored pending request {} for connection {}", id, connection);
        id
    }

    /// Consume a pending request. A foreign connection gets `NotOwner` and
    /// the entry stays where it is.
    pub async fn resolve(&self, id: &RequestId, connection: ConnectionId) -> Result<PendingRequest, CorrelatorError> {
        let mut tables = self.tables.lock().await;
        let owner = tables
            .pending
            .get(id)
            .map(|request| request.connection)
            .ok_or_else(|| CorrelatorError::NotFound(id.clone()))?;
        if owner != connection {
            return Err(CorrelatorError::NotOwner(id.clone()));
        }
        tables
            .pending
            .remove(id)
            .ok_or_else(|| CorrelatorError::NotFound(id.clone()))
    }

    /// Store a failure report for a delivered script and re-arm the request
    /// so the next context response runs a correction round. A request past
    /// its correction limit is forgotten.
    pub async fn record_execution_error(
        &self,
        id: &RequestId,
        category: &str,
        detail: &str,
        connection: ConnectionId,
    ) -> Result<(), CorrelatorError> {
        let mut tables = self.tables.lock().await;

        let owner = tables
            .delivered
            .get(id)
            .map(|request| request.connection)
            .ok_or_else(|| CorrelatorError::NotFound(id.clone()))?;
        if owner != connection {
            return Err(CorrelatorError::NotOwner(id.clone()));
        }

        let mut request = tables
            .take_delivered(id)
            .ok_or_else(|| CorrelatorError::NotFound(id.clone()))?;
        if request.corrections >= self.max_corrections {
            debug!("Dropping request {} after {} correction round(s)", id, request.corrections);
            return Err(CorrelatorError::CorrectionLimit {
                request_id: id.clone(),
                limit: self.max_corrections,
            });
        }
        request.corrections += 1;
        tables.pending.insert(id.clone(), request);

        tables.errors.insert(
            id.clone(),
            ExecutionErrorReport {
                category: category.to_string(),
                detail: detail.to_string(),
                connection,
            },
        );
        Ok(())
    }

    pub async fn take_execution_error(&self, id: &RequestId, connection: ConnectionId) -> Option<ExecutionErrorReport> {
        let mut tables = self.tables.lock().await;
        let owned = tables.errors.get(id).is_some_and(|report| report.connection == connection);
        if owned {
            tables.errors.remove(id)
        } else {
            None
        }
    }

    /// Keep a request whose script reached the client, in case it fails.
    /// Only the newest `max_delivered` per connection are kept.
    pub async fn mark_delivered(&self, request: PendingRequest) {
        let mut guard = self.tables.lock().await;
        let tables = &mut *guard;
        let (id, connection) = (request.id.clone(), request.connection);
        tables.delivered.insert(id.clone(), request);

        let order = tables.delivery_order.entry(connection).or_default();
        order.retain(|delivered| delivered != &id);
        order.push_back(id);
        while order.len() > self.max_delivered {
            if let Some(evicted) = order.pop_front() {
                tables.delivered.remove(&evicted);
                debug!("Evicted delivered request {} for connection {}", evicted, connection);
            }
        }
    }

    /// Drop a pending request whose context request never reached the client.
    pub async fn discard(&self, id: &RequestId) -> bool {
        let mut tables = self.tables.lock().await;
        tables.errors.remove(id);
        tables.pending.remove(id).is_some()
    }

    pub async fn purge(&self, connection: ConnectionId) -> PurgeStats {
        let mut tables = self.tables.lock().await;
        let before = (tables.pending.len(), tables.delivered.len(), tables.errors.len());

        tables.pending.retain(|_, r| r.connection != connection);
        tables.delivered.retain(|_, r| r.connection != connection);
        tables.delivery_order.remove(&connection);
        tables.errors.retain(|_, r| r.connection != connection);

        PurgeStats {
            pending: before.0 - tables.pending.len(),
            delivered: before.1 - tables.delivered.len(),
            errors: before.2 - tables.errors.len(),
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.tables.lock().await.pending.len()
    }
}
