//! Live Sync server.
//!
//! ```text
//!  client socket ──▶ /ws upgrade ──▶ path frame ──▶ route match ──▶ middleware
//!                                                                      │
//!  JSON frames  ◀──────────── SubscriptionSink ◀──── route handler ◀───┘
//! ```
//!
//! Demo routes:
//! - `/ticks{/:interval}`: a counter every `interval` ms (default 1000)
//! - `/echo/:message`: the message once, then holds the subscription open

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde_json::json;
use tokio::net::TcpListener;

use live_sync::config::{load_config, LiveSyncConfig};
use live_sync::lifecycle::{signals, Shutdown};
use live_sync::observability::{init_logging, init_metrics};
use live_sync::server::{stream, SubscriptionServer, SubscriptionSink};
use live_sync::TraceMiddleware;

#[derive(Parser)]
#[command(name = "live-sync")]
#[command(about = "Live subscription server", long_about = None)]
struct Args {
    /// TOML config file; defaults are used when absent.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => LiveSyncConfig::default(),
    };

    init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "live-sync starting");
    tracing::info!(
        bind_address = %config.listener.bind_address,
        max_connections = config.listener.max_connections,
        endpoint = %config.socket.endpoint,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => init_metrics(addr)?,
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    let server = SubscriptionServer::builder(config)
        .middleware(TraceMiddleware)
        .route("/ticks{/:interval}", stream(ticks))?
        .route("/echo/:message", stream(echo))?
        .build();

    let shutdown = Shutdown::new();
    signals::install(&shutdown);
    server.run(listener, shutdown.subscribe()).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn ticks(sink: SubscriptionSink) {
    let interval_ms = sink.param::<u64>("interval").unwrap_or(1000).max(10);
    let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
    let mut count: u64 = 0;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                count += 1;
                if sink.send(&json!({ "tick": count })).is_err() {
                    break;
                }
            }
            _ = sink.closed() => break,
        }
    }
}

async fn echo(sink: SubscriptionSink) {
    let message = sink
        .route()
        .params
        .get("message")
        .cloned()
        .unwrap_or_default();
    if sink.send(&json!({ "message": message })).is_ok() {
        sink.closed().await;
    }
}
