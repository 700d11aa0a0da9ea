//! Command line interface for operating the relay. Supports initialization,
//! ingesting events, serving HTTP/WebSocket endpoints and signature
//! verification.

mod bus;
mod config;
mod db;
mod error;
mod event;
mod filter;
mod message;
mod relay;
mod schema;
mod server;
mod session;
mod sql;
mod storage;
mod validation;
mod ws;

use std::{fs, net::SocketAddr, path::Path, sync::Arc};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use config::Settings;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{bus::LocalBus, event::Event, relay::Relay, storage::Store};

/// Command line interface entry point.
#[derive(Parser)]
#[command(
    name = "strand",
    author,
    version,
    about = "SQLite-backed Nostr relay",
    short_flag = 'v',
    long_flag = "version"
)]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Create the database schema at `DB_PATH`.
    Init,
    /// Validate and store one or more event files.
    Ingest {
        /// Paths to JSON event files to ingest.
        #[arg(required = true)]
        files: Vec<String>,
    },
    /// Launch HTTP and WebSocket services.
    Serve,
    /// Verify a random sample of stored events.
    Verify {
        #[arg(long, default_value_t = 1000)]
        sample: u64,
    },
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    ensure_env_file(&cli.env)?;
    let cfg = Settings::from_env(&cli.env)?;
    if let Some(parent) = cfg.db_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let store = Store::open(&cfg.db_path, cfg.db_readers, cfg.query_limit_max)
        .with_context(|| format!("opening {}", cfg.db_path.display()))?
        .with_max_filters(cfg.max_filters);
    match cli.command {
        Commands::Init => {
            info!(db = %cfg.db_path.display(), "database ready");
        }
        Commands::Ingest { files } => {
            let relay = relay(&cfg, store);
            let mut rejected = 0;
            for f in &files {
                let data = fs::read_to_string(f).with_context(|| format!("reading {f}"))?;
                let ev: Event =
                    serde_json::from_str(&data).with_context(|| format!("parsing {f}"))?;
                match relay.submit(ev).await {
                    Ok(outcome) => info!(file = %f, ?outcome, "ingested"),
                    Err(e) => {
                        warn!(file = %f, error = %e, "rejected");
                        rejected += 1;
                    }
                }
            }
            if rejected > 0 {
                bail!("{rejected} of {} events rejected", files.len());
            }
        }
        Commands::Serve => {
            let http_addr: SocketAddr = cfg.bind_http.as_str().parse()?;
            let ws_addr: SocketAddr = cfg.bind_ws.as_str().parse()?;
            let bus = Arc::new(LocalBus::new(cfg.broadcast_capacity));
            let relay = Arc::new(Relay::new(
                store.clone(),
                bus.clone(),
                cfg.policy(),
                cfg.outbound_buffer,
            ));
            let shutdown = CancellationToken::new();
            let trigger = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("shutting down");
                    trigger.cancel();
                }
            });
            let result = tokio::try_join!(
                server::serve_http(http_addr, store, shutdown.clone().cancelled_owned()),
                ws::serve_ws(ws_addr, relay, shutdown.clone().cancelled_owned())
            );
            info!(
                listeners = bus.subscriber_count(crate::bus::EVENTS_TOPIC),
                "closing bus"
            );
            bus.close();
            result?;
        }
        Commands::Verify { sample } => {
            let checked = store.verify_sample(sample).await?;
            info!(checked, "stored events verified");
        }
    }
    Ok(())
}

fn relay(cfg: &Settings, store: Store) -> Relay {
    Relay::new(
        store,
        Arc::new(LocalBus::new(cfg.broadcast_capacity)),
        cfg.policy(),
        cfg.outbound_buffer,
    )
}

/// Create a default `.env` file if one is not already present at `path`.
fn ensure_env_file(path: &str) -> anyhow::Result<()> {
    let env_path = Path::new(path);
    if env_path.exists() {
        return Ok(());
    }
    let base_dir = match env_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            fs::create_dir_all(parent)?;
            parent.to_path_buf()
        }
        _ => std::env::current_dir()?,
    };
    let mut content = String::new();
    content.push_str(&format!(
        "DB_PATH={}\n",
        base_dir.join("strand.db").to_string_lossy()
    ));
    content.push_str("BIND_HTTP=127.0.0.1:7777\n");
    content.push_str("BIND_WS=127.0.0.1:7778\n");
    content.push_str("MAX_EVENT_AGE=604800\n");
    content.push_str("MAX_FUTURE_SKEW=0\n");
    content.push_str("DB_READERS=4\n");
    content.push_str("BROADCAST_CAPACITY=1024\n");
    content.push_str("OUTBOUND_BUFFER=256\n");
    content.push_str("QUERY_LIMIT_MAX=500\n");
    content.push_str("MAX_FILTERS=100\n");
    fs::write(env_path, content)?;
    Ok(())
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let cli = Cli::parse();
    run(cli).await
}
