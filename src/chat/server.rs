// Listener/acceptor and server lifecycle

use crate::chat::broker::{BrokerHandle, MessageBroker};
use crate::chat::client::ClientRegistry;
use crate::chat::config::RelayConfig;
use crate::chat::error::{RelayError, RelayResult};
use crate::chat::handler::{handle_connection, HandlerContext};
use crate::chat::message::MessageLog;
use crate::chat::tls::SecureChannelFactory;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Back-off after a failed `accept`, e.g. when out of file descriptors
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// What a graceful shutdown did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ShutdownSummary {
    /// Clients whose channels were closed
    pub clients_closed: usize,
    /// Whether every handler exited within the grace period
    pub handlers_drained: bool,
    /// Messages written to the archive, if one is configured
    pub archived: usize,
}

/// A running relay
pub struct RelayServer {
    config: RelayConfig,
    local_addr: SocketAddr,
    registry: Arc<ClientRegistry>,
    log: Arc<MessageLog>,
    broker_handle: BrokerHandle,
    broker_task: JoinHandle<()>,
    accept_task: JoinHandle<()>,
    stop_accepting: CancellationToken,
    shutdown: CancellationToken,
    connections: TaskTracker,
}

impl RelayServer {
    /// Bind the listener and start accepting connections
    pub async fn start(config: RelayConfig, tls: SecureChannelFactory) -> RelayResult<Self> {
        config.validate()?;

        let addr = config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| RelayError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        tracing::info!("Listening on {} (TLS fingerprint {})", local_addr, tls.fingerprint());

        let registry = Arc::new(ClientRegistry::new(config.server.max_clients));
        let log = Arc::new(MessageLog::new(config.log.retention()));
        let shutdown = CancellationToken::new();
        let stop_accepting = CancellationToken::new();
        let connections = TaskTracker::new();

        let (broker, broker_handle) =
            MessageBroker::new(log.clone(), registry.clone(), config.delivery.broker_queue_len);
        let broker_task = tokio::spawn(broker.run());

        log.clone()
            .start_cleanup_task(config.log.cleanup_interval(), shutdown.clone());

        let ctx = HandlerContext {
            registry: registry.clone(),
            broker: broker_handle.clone(),
            limits: config.connection_limits(),
            shutdown: shutdown.clone(),
        };

        let accept_task = tokio::spawn(accept_loop(
            listener,
            tls,
            ctx,
            connections.clone(),
            stop_accepting.clone(),
        ));

        Ok(Self {
            config,
            local_addr,
            registry,
            log,
            broker_handle,
            broker_task,
            accept_task,
            stop_accepting,
            shutdown,
            connections,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn registry(&self) -> Arc<ClientRegistry> {
        self.registry.clone()
    }

    pub fn log(&self) -> Arc<MessageLog> {
        self.log.clone()
    }

    /// Close the listening socket
    ///
    /// Connected clients keep chatting until their own connections end.
    pub fn stop(&self) {
        self.stop_accepting.cancel();
    }

    /// Stop accepting, close every client, and wait for handlers to exit
    pub async fn shutdown(self) -> RelayResult<ShutdownSummary> {
        tracing::info!("Shutting down relay on {}", self.local_addr);

        self.stop_accepting.cancel();
        if let Err(e) = self.accept_task.await {
            tracing::error!("Accept task failed: {}", e);
        }

        let clients_closed = self.registry.close_all();
        self.shutdown.cancel();
        self.connections.close();

        let grace = self.config.server.shutdown_grace();
        let handlers_drained = tokio::time::timeout(grace, self.connections.wait())
            .await
            .is_ok();
        if !handlers_drained {
            tracing::warn!(
                "{} connection handlers still running after {:?}",
                self.connections.len(),
                grace
            );
        }

        if self.broker_handle.shutdown().await.is_ok() {
            if let Err(e) = self.broker_task.await {
                tracing::error!("Broker task failed: {}", e);
            }
        }

        let archived = match &self.config.log.archive_path {
            Some(path) => self.log.archive_to(path).await?,
            None => 0,
        };

        tracing::info!(
            "Relay stopped ({} clients closed, {} messages archived)",
            clients_closed,
            archived
        );

        Ok(ShutdownSummary {
            clients_closed,
            handlers_drained,
            archived,
        })
    }
}

async fn accept_loop(
    listener: TcpListener,
    tls: SecureChannelFactory,
    ctx: HandlerContext,
    connections: TaskTracker,
    stop: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = stop.cancelled() => {
                tracing::info!("Listener shutting down");
                break;
            }
        };

        let (stream, peer) = match accepted {
            Ok(conn) => conn,
            Err(e) => {
                tracing::error!("Accept error: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };

        // Cheap check before spending a handshake; registration re-checks
        if ctx.registry.is_full() {
            tracing::warn!(
                "Rejecting {}: registry full ({} clients)",
                peer,
                ctx.registry.capacity()
            );
            drop(stream);
            continue;
        }

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Could not set TCP_NODELAY for {}: {}", peer, e);
        }

        let tls = tls.clone();
        let ctx = ctx.clone();
        connections.spawn(async move {
            handle_connection(stream, peer, tls, ctx).await;
        });
    }

    // Dropping the listener closes the socket
    drop(listener);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::tls::generate_self_signed;

    fn test_tls() -> SecureChannelFactory {
        let cert = generate_self_signed(&["localhost".to_string()]).unwrap();
        SecureChannelFactory::from_pem(
            &cert.certificate_pem,
            &cert.private_key_pem,
            Duration::from_secs(2),
        )
        .unwrap()
    }

    fn test_config() -> RelayConfig {
        let mut config = RelayConfig::default();
        config.server.bind_address = "127.0.0.1".to_string();
        config.server.port = 0;
        config
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let server = RelayServer::start(test_config(), test_tls()).await.unwrap();
        assert_ne!(server.local_addr().port(), 0);
        assert!(server.registry().is_empty());

        let summary = server.shutdown().await.unwrap();
        assert_eq!(summary.clients_closed, 0);
        assert!(summary.handlers_drained);
        assert_eq!(summary.archived, 0);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let first = RelayServer::start(test_config(), test_tls()).await.unwrap();

        let mut config = test_config();
        config.server.port = first.local_addr().port();
        let err = RelayServer::start(config, test_tls()).await.err().unwrap();
        assert!(matches!(err, RelayError::Bind { .. }));

        first.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = test_config();
        config.server.max_clients = 0;
        let err = RelayServer::start(config, test_tls()).await.err().unwrap();
        assert!(matches!(err, RelayError::Config(_)));
    }

    #[tokio::test]
    async fn test_stop_closes_listener() {
        let server = RelayServer::start(test_config(), test_tls()).await.unwrap();
        let addr = server.local_addr();

        server.stop();
        let mut refused = false;
        for _ in 0..50 {
            if tokio::net::TcpStream::connect(addr).await.is_err() {
                refused = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(refused, "listener still accepting after stop()");

        server.shutdown().await.unwrap();
    }
}
