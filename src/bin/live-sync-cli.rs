use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

use live_sync::client::{Payload, QueryClient};
use live_sync::config::ObservabilityConfig;
use live_sync::lifecycle::wait_for_signal;
use live_sync::observability::init_logging;
use live_sync::routing::Params;

#[derive(Parser)]
#[command(name = "live-sync-cli")]
#[command(about = "Subscribe to a live-sync server from the terminal", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "ws://127.0.0.1:8080/ws")]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print every update of a route until Ctrl+C
    Subscribe {
        /// Route pattern, e.g. /rooms/:id
        route: String,
        /// Route parameter as key=value
        #[arg(short = 'p', long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,
    },
    /// Print the current value of a route and exit
    Get {
        route: String,
        #[arg(short = 'p', long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,
    },
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected key=value, got {raw:?}"))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(&ObservabilityConfig {
        log_level: "warn".to_string(),
        ..Default::default()
    });
    let client = QueryClient::builder().url(cli.url).build();

    match cli.command {
        Commands::Subscribe { route, params } => {
            let params: Params = params.into_iter().collect();
            let path = client.preload_subscription(&route, &params)?;

            let (tx, mut rx) = mpsc::unbounded_channel();
            let _subscription = client.subscribe(&path, move |payload: &Payload| {
                let _ = tx.send(payload.clone());
            })?;

            let stop = wait_for_signal();
            tokio::pin!(stop);
            loop {
                tokio::select! {
                    Some(payload) = rx.recv() => print_payload(&payload),
                    _ = &mut stop => break,
                }
            }
        }
        Commands::Get { route, params } => {
            let params: Params = params.into_iter().collect();
            let path = client.preload_subscription(&route, &params)?;
            let value = client.resolve(&path).await?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
    }

    Ok(())
}

fn print_payload(payload: &Payload) {
    match payload {
        Payload::Data(value) => println!("{value}"),
        Payload::Error(detail) => eprintln!("error: {detail}"),
    }
}
