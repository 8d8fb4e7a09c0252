use std::error::Error;
use std::net::SocketAddr;

use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use sinker_core::{Config, Sinker, start_metrics_server};

mod setup_tracing;

#[derive(Parser, Debug)]
#[command(about = "Moves records from partitioned streams into a columnar store in batches")]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(short, long)]
    config: String,

    /// Override the bind address of the `/metrics` endpoint.
    #[arg(long)]
    http_addr: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    setup_tracing::register();

    if let Err(e) = run(Args::parse()).await {
        error!("{e:?}");
        return Err(e);
    }
    info!("Exiting...");

    Ok(())
}

async fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let config = Config::from_file(&args.config)?;

    let metrics_addr: SocketAddr = args
        .http_addr
        .as_deref()
        .unwrap_or(&config.metrics.http_addr)
        .parse()
        .map_err(|e| format!("Invalid metrics address: {e}"))?;

    let cln_token = CancellationToken::new();
    let shutdown_token = cln_token.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown_token.cancel();
    });

    let mut sinker = Sinker::new(config, cln_token);

    // The endpoint lives for the whole process; its handle is intentionally
    // not joined.
    let metrics = sinker.metrics();
    tokio::spawn(async move {
        if let Err(e) = start_metrics_server(metrics_addr, metrics).await {
            error!("Metrics server error: {e:?}");
        }
    });

    sinker.init().await?;
    sinker.run().await?;
    sinker.close().await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        info!("Received Ctrl+C signal");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
        info!("Received terminate signal");
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
