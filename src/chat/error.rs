// Error taxonomy for the relay

use crate::chat::client::ClientId;
use std::net::SocketAddr;
use thiserror::Error;

/// Errors raised by the relay core
#[derive(Debug, Error)]
pub enum RelayError {
    /// TLS negotiation with a freshly accepted connection did not complete
    #[error("TLS handshake with {peer} failed: {reason}")]
    Handshake { peer: SocketAddr, reason: String },

    /// The registry already holds `capacity` clients
    #[error("client registry is full ({capacity} clients)")]
    RegistryFull { capacity: usize },

    #[error("client {0} is already registered")]
    DuplicateClient(ClientId),

    #[error("read from client {client} failed: {source}")]
    ChannelRead {
        client: ClientId,
        #[source]
        source: std::io::Error,
    },

    /// Delivery to one client failed; the broadcast pass carries on without it
    #[error("write to client {client} failed: {reason}")]
    ChannelWrite { client: ClientId, reason: String },

    #[error("message broker is not running")]
    BrokerUnavailable,

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// Errors that only concern a single connection and never take the server down
    pub fn is_connection_scoped(&self) -> bool {
        matches!(
            self,
            RelayError::Handshake { .. }
                | RelayError::RegistryFull { .. }
                | RelayError::DuplicateClient(_)
                | RelayError::ChannelRead { .. }
                | RelayError::ChannelWrite { .. }
        )
    }
}

pub type RelayResult<T> = Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_scoped_errors() {
        let full = RelayError::RegistryFull { capacity: 2 };
        assert!(full.is_connection_scoped());
        assert_eq!(full.to_string(), "client registry is full (2 clients)");

        let write = RelayError::ChannelWrite {
            client: ClientId::new(),
            reason: "outbound queue full".to_string(),
        };
        assert!(write.is_connection_scoped());

        let bind = RelayError::Bind {
            addr: "0.0.0.0:8080".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use"),
        };
        assert!(!bind.is_connection_scoped());
        assert!(!RelayError::BrokerUnavailable.is_connection_scoped());
    }
}
