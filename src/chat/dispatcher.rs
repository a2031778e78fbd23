// Broadcast fan-out to every registered client

use crate::chat::client::{ClientId, ClientRegistry};
use crate::chat::error::RelayError;
use crate::chat::message::Message;
use std::sync::Arc;

/// Outcome of one broadcast pass
#[derive(Debug, Default)]
pub struct BroadcastReport {
    /// Clients the payload was queued for
    pub delivered: Vec<ClientId>,
    /// Clients that could not take the payload
    pub failed: Vec<(ClientId, RelayError)>,
}

impl BroadcastReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Writes messages to every registered client's outbound queue
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<ClientRegistry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<ClientRegistry>) -> Self {
        Self { registry }
    }

    /// Fan `message` out to a snapshot of the registry, sender included
    ///
    /// Queuing never waits on a peer. A client whose queue is full or whose
    /// writer is gone is reported as failed and the pass moves on.
    pub fn broadcast(&self, message: &Message) -> BroadcastReport {
        let clients = self.registry.snapshot();
        let mut report = BroadcastReport::default();

        for client in &clients {
            match client.enqueue(message.content.clone()) {
                Ok(()) => report.delivered.push(client.id),
                Err(e) => {
                    tracing::warn!("Failed to send to client {}: {}", client.id, e);
                    report.failed.push((client.id, e));
                }
            }
        }

        report
    }

    /// Remove clients that failed during a pass and close their channels
    ///
    /// Runs after the pass has finished, never while iterating it.
    pub fn evict_failed(&self, report: &BroadcastReport) -> usize {
        let mut evicted = 0;

        for (id, _) in &report.failed {
            if let Some(client) = self.registry.remove(id) {
                client.evict();
                evicted += 1;
                tracing::info!("Removed failed client {}", id);
            }
        }

        evicted
    }
}
