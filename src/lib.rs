//! securechat - TLS-secured broadcast chat relay
//!
//! Clients connect over TLS and every message one of them sends is recorded
//! in an in-process log and relayed to all connected clients, the sender
//! included.

pub mod chat;

pub use chat::{RelayConfig, RelayError, RelayServer, SecureChannelFactory};
