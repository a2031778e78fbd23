// Message broker: logs and broadcasts messages one at a time

use crate::chat::client::ClientRegistry;
use crate::chat::dispatcher::Dispatcher;
use crate::chat::error::{RelayError, RelayResult};
use crate::chat::message::{Message, MessageLog};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Handle for communicating with the broker
#[derive(Clone, Debug)]
pub struct BrokerHandle {
    tx: mpsc::Sender<BrokerCommand>,
}

impl BrokerHandle {
    pub fn new(tx: mpsc::Sender<BrokerCommand>) -> Self {
        Self { tx }
    }

    /// Hand a received message to the broker and wait until it is broadcast
    ///
    /// Returns the log sequence number once every registered client, the
    /// sender included, has had the message queued. Waiting here keeps the
    /// sender registered until its own message has gone out.
    pub async fn publish(&self, message: Message) -> RelayResult<u64> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(BrokerCommand::Publish { message, ack })
            .await
            .map_err(|_| RelayError::BrokerUnavailable)?;
        done.await.map_err(|_| RelayError::BrokerUnavailable)
    }

    /// Stop the broker once every command queued before this one is handled
    pub async fn shutdown(&self) -> RelayResult<()> {
        self.tx
            .send(BrokerCommand::Shutdown)
            .await
            .map_err(|_| RelayError::BrokerUnavailable)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Commands that can be sent to the broker
#[derive(Debug)]
pub enum BrokerCommand {
    /// A client sent a message; `ack` receives the sequence number after broadcast
    Publish {
        message: Message,
        ack: oneshot::Sender<u64>,
    },
    /// Shutdown the broker
    Shutdown,
}

/// Serializes `append + broadcast` so the log order is the delivery order
pub struct MessageBroker {
    log: Arc<MessageLog>,
    dispatcher: Dispatcher,
    rx: mpsc::Receiver<BrokerCommand>,
}

impl MessageBroker {
    /// Create a new message broker
    pub fn new(
        log: Arc<MessageLog>,
        registry: Arc<ClientRegistry>,
        queue_len: usize,
    ) -> (Self, BrokerHandle) {
        let (tx, rx) = mpsc::channel(queue_len.max(1));

        let broker = Self {
            log,
            dispatcher: Dispatcher::new(registry),
            rx,
        };

        (broker, BrokerHandle::new(tx))
    }

    /// Run the broker event loop
    pub async fn run(mut self) {
        tracing::info!("Message broker started");

        while let Some(cmd) = self.rx.recv().await {
            match cmd {
                BrokerCommand::Publish { message, ack } => {
                    let seq = self.handle_publish(message).await;
                    // The publisher may have gone away; nothing to report then
                    let _ = ack.send(seq);
                }
                BrokerCommand::Shutdown => {
                    tracing::info!("Broker shutting down");
                    break;
                }
            }
        }

        tracing::info!("Message broker stopped");
    }

    async fn handle_publish(&self, message: Message) -> u64 {
        let seq = self.log.append(message.clone()).await;

        tracing::debug!(
            "Message {} from {} ({} bytes): {}",
            seq,
            message.sender,
            message.content.len(),
            message.content_lossy()
        );

        let report = self.dispatcher.broadcast(&message);
        if !report.is_clean() {
            let evicted = self.dispatcher.evict_failed(&report);
            tracing::warn!(
                "Message {} reached {} clients, {} evicted",
                seq,
                report.delivered.len(),
                evicted
            );
        }
        seq
    }
}
