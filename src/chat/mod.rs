// Relay module for TLS-secured broadcast chat
//
// Every client connects over TLS; each read from a client becomes a message
// that is appended to an in-process log and broadcast to every connected
// client, the sender included.

pub mod error;
pub mod message;
pub mod client;
pub mod dispatcher;
pub mod broker;
pub mod tls;
pub mod handler;
pub mod server;
pub mod config;
pub mod cli;
pub mod commands;

pub use error::{RelayError, RelayResult};
pub use message::{LogRetention, LoggedMessage, Message, MessageLog};
pub use client::{ClientConnection, ClientId, ClientRegistry, Membership};
pub use dispatcher::{BroadcastReport, Dispatcher};
pub use broker::{BrokerCommand, BrokerHandle, MessageBroker};
pub use tls::{generate_self_signed, SecureChannelFactory, SelfSignedCert};
pub use handler::{ConnectionLimits, HandlerContext, HandlerState, Termination};
pub use server::{RelayServer, ShutdownSummary};
pub use config::RelayConfig;
pub use cli::{ChatCli, ChatCommand, ConfigArgs};
pub use commands::execute_command;
