use std::sync::Mutex;

use shared::protocol::RelayMessage;
use tokio::sync::mpsc;
use tracing::info;

use crate::error::TransportError;

/// Outbound side of the pub/sub relay. Publishing never waits for the peer.
pub trait RelayTransport: Send + Sync {
    fn publish(&self, message: RelayMessage) -> Result<(), TransportError>;
}

struct Attachment {
    generation: u64,
    sender: mpsc::UnboundedSender<RelayMessage>,
}

/// Relay endpoint for a single agent; a newer attachment replaces the older.
#[derive(Default)]
pub struct RelayHub {
    inner: Mutex<HubState>,
}

#[derive(Default)]
struct HubState {
    next_generation: u64,
    attached: Option<Attachment>,
}

impl RelayHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the generation to pass back to [`RelayHub::detach`] and the
    /// stream of messages to forward to the agent.
    pub fn attach(&self) -> (u64, mpsc::UnboundedReceiver<RelayMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.next_generation += 1;
        let generation = inner.next_generation;
        if inner.attached.is_some() {
            info!(generation, "relay: replacing previously attached agent");
        }
        inner.attached = Some(Attachment { generation, sender });
        (generation, receiver)
    }

    /// No-op when a newer agent has attached in the meantime.
    pub fn detach(&self, generation: u64) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner
            .attached
            .as_ref()
            .is_some_and(|a| a.generation == generation)
        {
            inner.attached = None;
            return true;
        }
        false
    }

    pub fn is_connected(&self) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .attached
            .as_ref()
            .is_some_and(|a| !a.sender.is_closed())
    }
}

impl RelayTransport for RelayHub {
    fn publish(&self, message: RelayMessage) -> Result<(), TransportError> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let attachment = inner.attached.as_ref().ok_or(TransportError::Disconnected)?;
        attachment
            .sender
            .send(message)
            .map_err(|_| TransportError::Closed)
    }
}
