//! # keyex
//!
//! Federation key-exchange server. Subcommands:
//! - `serve`: publish this server's signed keys over WebSocket (default)
//! - `gen-key`: write a fresh Ed25519 signing key file
//! - `fetch-keys`: fetch, log and verify a remote server's keys

mod client;
mod transport;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use clap::{Parser, Subcommand};
use keyex_federation::{FederationService, KeyId, KeyManager, KeySigner, key_manager};

#[derive(Debug, Parser)]
#[command(name = "keyex", version, about = "Federation key exchange server")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the federation endpoint.
    Serve,

    /// Generate a new signing key file, replacing any existing one.
    GenKey {
        /// Key file to write; defaults to `federation.key_path`.
        #[arg(long)]
        path: Option<String>,

        /// Key ID to file the key under, e.g. `ed25519:1`.
        #[arg(long)]
        key_id: Option<String>,
    },

    /// Fetch and verify the keys of a remote server.
    FetchKeys {
        /// WebSocket URL of the remote federation endpoint.
        #[arg(long)]
        url: String,

        /// Give up after this many seconds.
        #[arg(long, default_value_t = 10)]
        timeout_secs: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = keyex_common::config::init()?;

    // Initialize tracing (structured logging)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "keyex=debug,keyex_federation=debug,keyex_server=debug".into()),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve().await,
        Command::GenKey { path, key_id } => {
            let path = path.unwrap_or_else(|| config.federation.key_path.clone());
            let key_id = key_id.map(KeyId::parse).transpose()?;
            let kp = KeyManager::new(&path).generate(key_id).await?;
            println!("{} {}", kp.key_id(), kp.public_key_base64());
            tracing::info!("🔑 Wrote signing key to {}", path);
            Ok(())
        }
        Command::FetchKeys { url, timeout_secs } => {
            let fetched = client::fetch_keys(&url, Duration::from_secs(timeout_secs)).await?;
            tracing::info!(
                "✅ {} published {} verified responses",
                fetched.server_name,
                fetched.responses.len()
            );
            Ok(())
        }
    }
}

async fn serve() -> anyhow::Result<()> {
    let config = keyex_common::config::get();
    tracing::info!("🚀 Starting keyex v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("   Server name: {}", config.server.name);

    // === Federation signing key ===
    // Load the key file, or generate + persist a new one on first run.
    let federation_key = KeyManager::new(&config.federation.key_path).load_or_generate().await?;
    tracing::info!("🔑 Federation signing key ready: {}", federation_key.key_id());

    let ring = key_manager::key_ring(&config.server.name, &config.federation, federation_key)?;
    if !ring.retired_keys().is_empty() {
        tracing::info!("   Publishing {} retired keys", ring.retired_keys().len());
    }

    let service = FederationService::new(ring)
        .with_flow_window(config.federation.flow_window_bytes)
        .with_request_timeout(Duration::from_secs(config.federation.request_timeout_secs));
    let router = transport::build_router(Arc::new(service));

    let addr = SocketAddr::new(config.server.host.parse()?, config.server.port);
    tracing::info!("🔌 Federation listening on ws://{addr}{}", transport::FEDERATION_PATH);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}
