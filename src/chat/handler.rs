// Per-connection handler: handshake, read loop, teardown

use crate::chat::broker::BrokerHandle;
use crate::chat::client::{ClientConnection, ClientId, ClientRegistry};
use crate::chat::error::RelayError;
use crate::chat::message::Message;
use crate::chat::tls::SecureChannelFactory;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Lifecycle of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Handshaking,
    Active,
    Draining,
    Closed,
}

/// Why a connection ended
#[derive(Debug)]
pub enum Termination {
    /// TLS negotiation failed; no client was created
    HandshakeFailed(RelayError),
    /// The registry refused the client (full or duplicate)
    Rejected(RelayError),
    /// Peer closed its side
    EndOfStream,
    ReadError(RelayError),
    /// Removed by the relay, e.g. after a failed delivery
    Evicted,
    /// Server shutdown, or the broker is gone
    Shutdown,
}

/// Per-connection limits
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    /// Largest payload a single read may produce
    pub max_frame_size: usize,
    /// Payloads that may wait for a slow peer before it is evicted
    pub outbound_queue_len: usize,
    /// Bound on each write to the peer
    pub write_timeout: Duration,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            max_frame_size: 4096,
            outbound_queue_len: 64,
            write_timeout: Duration::from_secs(5),
        }
    }
}

/// Everything a handler shares with the rest of the relay
#[derive(Clone, Debug)]
pub struct HandlerContext {
    pub registry: Arc<ClientRegistry>,
    pub broker: BrokerHandle,
    pub limits: ConnectionLimits,
    /// Cancelled on graceful server shutdown
    pub shutdown: CancellationToken,
}

/// Drive a freshly accepted connection through its whole lifecycle
pub async fn handle_connection<IO>(
    io: IO,
    peer: SocketAddr,
    tls: SecureChannelFactory,
    ctx: HandlerContext,
) -> Termination
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tracing::debug!("Connection from {} ({:?})", peer, HandlerState::Handshaking);

    let handshake = tokio::select! {
        result = tls.accept(io, peer) => result,
        _ = ctx.shutdown.cancelled() => {
            tracing::debug!("Handshake with {} abandoned on shutdown", peer);
            return Termination::Shutdown;
        }
    };

    match handshake {
        Ok(stream) => serve(stream, peer, ctx).await,
        Err(e) => {
            log_connection_error(&e);
            Termination::HandshakeFailed(e)
        }
    }
}

/// Run an established secure channel until it ends
///
/// Registers the client, relays every read to the broker, and on exit
/// deregisters and releases the channel exactly once.
pub async fn serve<S>(stream: S, peer: SocketAddr, ctx: HandlerContext) -> Termination
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let cancel = ctx.shutdown.child_token();
    let (client, outbound_rx) =
        ClientConnection::with_queue(peer, ctx.limits.outbound_queue_len, cancel.clone());
    let client = Arc::new(client);
    let id = client.id;

    let membership = match ctx.registry.join(client) {
        Ok(m) => m,
        Err(e) => {
            tracing::debug!("Rejecting connection from {}", peer);
            log_connection_error(&e);
            return Termination::Rejected(e);
        }
    };

    let (mut reader, writer) = tokio::io::split(stream);

    tracing::debug!("Client {} is {:?}", id, HandlerState::Active);

    let write_timeout = ctx.limits.write_timeout;
    let writer_task = tokio::spawn(write_loop(
        writer,
        outbound_rx,
        id,
        write_timeout,
        cancel.clone(),
    ));

    let termination = read_loop(&mut reader, id, &ctx, &cancel).await;

    tracing::debug!("Client {} is {:?}: {:?}", id, HandlerState::Draining, termination);

    // Leaving the registry drops the last sender of the outbound queue, so the
    // writer flushes what is already queued and then stops.
    drop(membership);
    if !matches!(termination, Termination::EndOfStream | Termination::ReadError(_)) {
        cancel.cancel();
    }

    let drain_limit = write_timeout + Duration::from_millis(100);
    match tokio::time::timeout(drain_limit, writer_task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("Writer task for client {} failed: {}", id, e),
        Err(_) => {
            tracing::warn!("Writer for client {} did not finish draining", id);
            cancel.cancel();
        }
    }

    tracing::info!("Client {} is {:?} ({:?})", id, HandlerState::Closed, termination);
    termination
}

async fn read_loop<R>(
    reader: &mut R,
    id: ClientId,
    ctx: &HandlerContext,
    cancel: &CancellationToken,
) -> Termination
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; ctx.limits.max_frame_size.max(1)];

    loop {
        let read = tokio::select! {
            result = reader.read(&mut buf) => result,
            _ = cancel.cancelled() => {
                return if ctx.shutdown.is_cancelled() {
                    Termination::Shutdown
                } else {
                    Termination::Evicted
                };
            }
        };

        match read {
            Ok(0) => return Termination::EndOfStream,
            Ok(n) => {
                let message = Message::new(id, Bytes::copy_from_slice(&buf[..n]));
                if ctx.broker.publish(message).await.is_err() {
                    tracing::warn!("Broker unavailable, closing client {}", id);
                    return Termination::Shutdown;
                }
            }
            Err(e) => {
                let err = RelayError::ChannelRead {
                    client: id,
                    source: e,
                };
                log_connection_error(&err);
                return Termination::ReadError(err);
            }
        }
    }
}

fn log_connection_error(err: &RelayError) {
    if err.is_connection_scoped() {
        tracing::warn!("{}", err);
    } else {
        tracing::error!("{}", err);
    }
}

/// Dedicated writer: the only task that writes to the channel
async fn write_loop<W>(
    mut writer: W,
    mut outbound: mpsc::Receiver<Bytes>,
    id: ClientId,
    write_timeout: Duration,
    cancel: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let payload = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            payload = outbound.recv() => match payload {
                Some(p) => p,
                None => break,
            },
        };

        let write = async {
            writer.write_all(&payload).await?;
            writer.flush().await
        };

        match tokio::time::timeout(write_timeout, write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                log_connection_error(&RelayError::ChannelWrite {
                    client: id,
                    reason: e.to_string(),
                });
                cancel.cancel();
                break;
            }
            Err(_) => {
                tracing::warn!(
                    "Write to client {} timed out after {:?}, evicting",
                    id,
                    write_timeout
                );
                cancel.cancel();
                break;
            }
        }
    }

    // Best-effort close_notify; the peer may already be gone
    let _ = tokio::time::timeout(write_timeout, writer.shutdown()).await;
}
