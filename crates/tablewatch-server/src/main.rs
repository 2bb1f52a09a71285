//! TableWatch Server
//!
//! Binary entry point for the snapshot endpoint and realtime gateway.

use clap::{Parser, ValueEnum};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tablewatch_common::TableWatchConfig;
use tablewatch_server::TableWatchServer;

#[derive(Parser, Debug)]
#[command(name = "tablewatch")]
#[command(about = "Adaptive table polling with realtime fan-out", long_about = None)]
struct Args {
    /// Path to configuration file (TOML, or JSON by extension)
    #[arg(short, long, env = "TABLEWATCH_CONFIG", default_value = "tablewatch.toml")]
    config: PathBuf,

    /// Override `server.host`
    #[arg(long, env = "TABLEWATCH_HOST")]
    host: Option<String>,

    /// Override `server.port`
    #[arg(short, long, env = "TABLEWATCH_PORT")]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "TABLEWATCH_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log output format
    #[arg(long, env = "TABLEWATCH_LOG_FORMAT", value_enum, default_value_t = LogFormat::Fmt)]
    log_format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Fmt,
    Json,
}

fn init_logging(args: &Args) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    let registry = tracing_subscriber::registry().with(filter);
    match args.log_format {
        LogFormat::Fmt => registry.with(fmt::layer()).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args);

    info!("TableWatch v{}", env!("CARGO_PKG_VERSION"));

    let mut config = if args.config.exists() {
        TableWatchConfig::load(&args.config).await?
    } else {
        info!(path = %args.config.display(), "Config file not found, using defaults");
        TableWatchConfig::default()
    };
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    config.validate()?;

    let mut server = TableWatchServer::new(config)?;
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => server = server.with_metrics(handle),
        Err(e) => warn!(error = %e, "Metrics recorder not installed"),
    }

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal");
    };

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                tracing::error!("Server error: {}", e);
            }
        }
        () = shutdown => {
            server.shutdown().await?;
        }
    }

    Ok(())
}
