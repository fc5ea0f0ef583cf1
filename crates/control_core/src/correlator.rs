//! Call/response on top of the fire-and-forget relay.
//!
//! Every dispatched batch gets a fresh correlation id and a pending record;
//! the matching `batch_result` resolves the caller's [`PendingBatch`].

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use shared::protocol::{BatchOutcome, CorrelationId, DeviceCommand, RelayMessage};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::{
    error::{CorrelationError, DispatchError},
    relay::RelayTransport,
};

struct PendingRequest {
    batch: Vec<DeviceCommand>,
    issued_at: Instant,
    completion: oneshot::Sender<BatchOutcome>,
}

/// Handle on one dispatched batch. Dropping it means the caller no longer
/// cares; the pending record stays until answered or reaped.
#[derive(Debug)]
pub struct PendingBatch {
    correlation_id: CorrelationId,
    receiver: oneshot::Receiver<BatchOutcome>,
}

impl PendingBatch {
    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }
}

pub struct Correlator {
    transport: Arc<dyn RelayTransport>,
    pending: Mutex<HashMap<CorrelationId, PendingRequest>>,
}

impl Correlator {
    pub fn new(transport: Arc<dyn RelayTransport>) -> Self {
        Self {
            transport,
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn with_pending<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut HashMap<CorrelationId, PendingRequest>) -> R,
    {
        let mut guard = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    /// Publishes `batch` and returns without waiting for the switcher.
    ///
    /// When the relay refuses the message no pending record is left behind.
    pub fn dispatch(&self, batch: Vec<DeviceCommand>) -> Result<PendingBatch, DispatchError> {
        let (completion, receiver) = oneshot::channel();
        let correlation_id = self.with_pending(|pending| {
            let mut id = CorrelationId::random();
            while pending.contains_key(&id) {
                id = CorrelationId::random();
            }
            pending.insert(
                id,
                PendingRequest {
                    batch: batch.clone(),
                    issued_at: Instant::now(),
                    completion,
                },
            );
            id
        });

        let command_count = batch.len();
        let message = RelayMessage::DispatchBatch {
            correlation_id,
            commands: batch,
        };
        if let Err(err) = self.transport.publish(message) {
            self.with_pending(|pending| pending.remove(&correlation_id));
            warn!(%correlation_id, error = %err, "correlator: relay refused batch");
            return Err(err.into());
        }

        debug!(%correlation_id, command_count, "correlator: batch dispatched");
        Ok(PendingBatch {
            correlation_id,
            receiver,
        })
    }

    /// Resolves the matching pending record. Unknown, late or duplicate ids
    /// are dropped and reported as `false`.
    pub fn on_response(&self, correlation_id: CorrelationId, outcome: BatchOutcome) -> bool {
        let Some(request) = self.with_pending(|pending| pending.remove(&correlation_id)) else {
            debug!(%correlation_id, "correlator: discarding response without pending request");
            return false;
        };
        debug!(
            %correlation_id,
            command_count = request.batch.len(),
            elapsed_ms = request.issued_at.elapsed().as_millis() as u64,
            "correlator: batch answered"
        );
        // The caller may have stopped listening.
        let _ = request.completion.send(outcome);
        true
    }

    /// Waits up to `timeout` for the outcome; on expiry the correlation is
    /// abandoned so a late answer is discarded.
    pub async fn wait(
        &self,
        pending: PendingBatch,
        timeout: Duration,
    ) -> Result<BatchOutcome, CorrelationError> {
        let PendingBatch {
            correlation_id,
            receiver,
        } = pending;
        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(CorrelationError::Abandoned(correlation_id)),
            Err(_) => {
                self.abandon(correlation_id);
                Err(CorrelationError::TimedOut(correlation_id))
            }
        }
    }

    pub fn abandon(&self, correlation_id: CorrelationId) -> bool {
        self.with_pending(|pending| pending.remove(&correlation_id))
            .is_some()
    }

    /// Drops every record older than `max_age`; their waiters see
    /// [`CorrelationError::Abandoned`]. Returns the abandoned batches.
    pub fn reap_expired(&self, max_age: Duration) -> Vec<(CorrelationId, Vec<DeviceCommand>)> {
        let reaped: Vec<_> = self.with_pending(|pending| {
            let expired: Vec<CorrelationId> = pending
                .iter()
                .filter(|(_, request)| request.issued_at.elapsed() >= max_age)
                .map(|(id, _)| *id)
                .collect();
            expired
                .into_iter()
                .filter_map(|id| pending.remove(&id).map(|request| (id, request.batch)))
                .collect()
        });
        if !reaped.is_empty() {
            info!(count = reaped.len(), "correlator: reaped expired batches");
        }
        reaped
    }

    pub fn pending_count(&self) -> usize {
        self.with_pending(|pending| pending.len())
    }
}

#[cfg(test)]
#[path = "tests/correlator_tests.rs"]
mod tests;
