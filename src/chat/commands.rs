// Command handlers for the relay CLI

use crate::chat::*;
use anyhow::{Context, Result};
use std::path::Path;

/// Execute a relay command
pub async fn execute_command(command: ChatCommand) -> Result<()> {
    match command {
        ChatCommand::Serve { config } => handle_serve(config).await,
        ChatCommand::GenCert {
            out_dir,
            hostnames,
            force,
        } => handle_gen_cert(&out_dir, &hostnames, force),
        ChatCommand::CheckConfig { config } => handle_check_config(config),
    }
}

/// Load the configuration file (if any) and apply command-line overrides
pub fn resolve_config(args: &ConfigArgs) -> Result<RelayConfig> {
    let mut config = match &args.config {
        Some(path) => RelayConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {:?}", path))?,
        None => RelayConfig::default(),
    };

    if let Some(bind) = &args.bind {
        config.server.bind_address = bind.clone();
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(max_clients) = args.max_clients {
        config.server.max_clients = max_clients;
    }
    if let Some(cert) = &args.cert {
        config.tls.certificate = cert.clone();
    }
    if let Some(key) = &args.key {
        config.tls.private_key = key.clone();
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn load_tls(config: &RelayConfig) -> Result<SecureChannelFactory> {
    SecureChannelFactory::from_pem_files(
        &config.tls.certificate,
        &config.tls.private_key,
        config.server.handshake_timeout(),
    )
    .context("Failed to load TLS certificate and key")
}

async fn handle_serve(args: ConfigArgs) -> Result<()> {
    let config = resolve_config(&args)?;
    let tls = load_tls(&config)?;

    let server = RelayServer::start(config, tls)
        .await
        .context("Failed to start relay")?;

    println!("✓ Relay listening on {}", server.local_addr());
    println!("  Max clients: {}", server.config().server.max_clients);
    println!("  Max message size: {} bytes", server.config().server.max_frame_size);

    // Keep the server running
    println!("\nPress Ctrl+C to stop the relay");
    tokio::signal::ctrl_c().await?;

    println!("\nStopping relay...");
    let summary = server.shutdown().await?;
    println!(
        "✓ Closed {} clients, archived {} messages",
        summary.clients_closed, summary.archived
    );

    Ok(())
}

fn handle_gen_cert(out_dir: &Path, hostnames: &[String], force: bool) -> Result<()> {
    let cert_path = out_dir.join("server.crt");
    let key_path = out_dir.join("server.key");

    if !force {
        for path in [&cert_path, &key_path] {
            if path.exists() {
                anyhow::bail!("{:?} already exists (use --force to overwrite)", path);
            }
        }
    }

    std::fs::create_dir_all(out_dir).context("Failed to create output directory")?;

    let cert = generate_self_signed(hostnames)?;
    std::fs::write(&cert_path, &cert.certificate_pem)
        .with_context(|| format!("Failed to write {:?}", cert_path))?;
    write_private_key(&key_path, &cert.private_key_pem)
        .with_context(|| format!("Failed to write {:?}", key_path))?;

    tracing::info!("Generated self-signed certificate for {:?}", hostnames);
    println!("✓ Certificate: {:?}", cert_path);
    println!("✓ Private key: {:?}", key_path);
    println!("  Valid for: {}", hostnames.join(", "));

    Ok(())
}

#[cfg(unix)]
fn write_private_key(path: &Path, pem: &str) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(pem.as_bytes())
}

#[cfg(not(unix))]
fn write_private_key(path: &Path, pem: &str) -> std::io::Result<()> {
    std::fs::write(path, pem)
}

fn handle_check_config(args: ConfigArgs) -> Result<()> {
    let config = resolve_config(&args)?;
    let tls = load_tls(&config)?;

    println!("✓ Configuration is valid");
    println!("  Listen: {}", config.listen_addr());
    println!("  Max clients: {}", config.server.max_clients);
    println!("  Certificate: {:?}", config.tls.certificate);
    println!("  Fingerprint: {}", tls.fingerprint());
    println!("  Log retention: {} entries", config.log.max_entries);
    if let Some(age) = config.log.max_age_secs {
        println!("  Log max age: {}s", age);
    }
    if let Some(path) = &config.log.archive_path {
        println!("  Archive: {:?}", path);
    }

    Ok(())
}
