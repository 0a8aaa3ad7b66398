//! fastwire demo server.
//!
//! Answers every request with a short plain-text echo of what it received.
//! Shuts down gracefully on Ctrl-C or SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use fastwire::config::{load_config, FastwireConfig};
use fastwire::lifecycle::{signals, Shutdown};
use fastwire::net::TcpAcceptor;
use fastwire::observability::{logging, metrics};
use fastwire::server::{handler_fn, RequestCtx, Server};

/// How long in-flight connections may finish after shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Parser)]
#[command(name = "fastwire", version, about = "High-concurrency HTTP/1.x server")]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overriding the configuration.
    #[arg(short, long)]
    bind: Option<String>,
}

fn echo(ctx: &mut RequestCtx) {
    let body = format!(
        "{} {} from {}\nrequest #{} on {}\n",
        ctx.request.method,
        ctx.request.target,
        ctx.remote_addr().map(|addr| addr.to_string()).unwrap_or_else(|| "unknown".to_string()),
        ctx.conn_request_num(),
        ctx.conn_id(),
    );
    ctx.success("text/plain; charset=utf-8", body);
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => FastwireConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config.listener.bind_address = bind;
    }

    logging::init_logging(&config.observability.log_level);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "fastwire starting");
    tracing::info!(
        bind_address = %config.listener.bind_address,
        concurrency = config.server.concurrency(),
        max_conns_per_ip = config.server.max_conns_per_ip,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(err) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %err,
                "Failed to parse metrics address"
            ),
        }
    }

    let listener = TcpAcceptor::bind(&config.listener.bind_address).await?;
    let server = Server::new(config.server.clone(), handler_fn(echo));

    let shutdown = Arc::new(Shutdown::new());
    {
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move { signals::trigger_on_signal(&shutdown).await });
    }

    server.serve_with_shutdown(&listener, shutdown.signaled()).await?;

    if tokio::time::timeout(DRAIN_TIMEOUT, server.wait_idle()).await.is_err() {
        tracing::warn!(open = server.concurrency(), "Connections still open after drain timeout");
    }
    tracing::info!("Shutdown complete");
    Ok(())
}
