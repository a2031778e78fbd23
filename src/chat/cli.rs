// CLI commands for the relay

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Relay CLI
#[derive(Debug, Parser)]
#[command(name = "securechat")]
#[command(about = "TLS-secured broadcast chat relay")]
pub struct ChatCli {
    #[command(subcommand)]
    pub command: ChatCommand,
}

/// Relay subcommands
#[derive(Debug, Subcommand)]
pub enum ChatCommand {
    /// Run the relay until Ctrl+C
    Serve {
        #[command(flatten)]
        config: ConfigArgs,
    },

    /// Generate a self-signed certificate and key for development
    GenCert {
        /// Directory to write server.crt and server.key into
        #[arg(short, long, default_value = ".")]
        out_dir: PathBuf,

        /// Hostname the certificate is valid for (repeatable)
        #[arg(long = "hostname", default_value = "localhost")]
        hostnames: Vec<String>,

        /// Overwrite existing files
        #[arg(long)]
        force: bool,
    },

    /// Validate the configuration and TLS material without serving
    CheckConfig {
        #[command(flatten)]
        config: ConfigArgs,
    },
}

/// Configuration file plus command-line overrides
#[derive(Debug, Clone, Default, Args)]
pub struct ConfigArgs {
    /// TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind
    #[arg(short, long)]
    pub bind: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Maximum concurrent clients
    #[arg(short = 'm', long)]
    pub max_clients: Option<usize>,

    /// PEM certificate chain
    #[arg(long)]
    pub cert: Option<PathBuf>,

    /// PEM private key
    #[arg(long)]
    pub key: Option<PathBuf>,
}

impl ChatCli {
    /// Parse from command-line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
