//! grpc-tapd — the grpc-tap proxy daemon.
//!
//! Sits between an RPC client and its upstream server, forwarding traffic
//! byte-for-byte while publishing captured-call events to UI subscribers
//! over a gRPC endpoint and, optionally, a web endpoint.

use std::sync::Arc;

use anyhow::Context as _;
use clap::{CommandFactory, Parser};
use tokio::sync::watch;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tap_observe::{EventBus, DEFAULT_BUS_CAPACITY};
use tap_proxy::{ReplayHandler, ReverseProxy};
use tap_server::{web, TapServer};

#[derive(Parser, Debug)]
#[command(name = "grpc-tapd", version, about = "gRPC proxy daemon for grpc-tap")]
struct Cli {
    /// Client listen address, e.g. 127.0.0.1:8080 (required)
    #[arg(long)]
    listen: Option<String>,

    /// Upstream gRPC server origin, e.g. http://localhost:9090 (required)
    #[arg(long)]
    upstream: Option<String>,

    /// gRPC server address for UI clients
    #[arg(long, default_value = ":9090")]
    grpc: String,

    /// HTTP server address for the web UI (disabled when absent)
    #[arg(long)]
    http: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let (Some(listen), Some(upstream)) = (cli.listen.clone(), cli.upstream.clone()) else {
        Cli::command().print_help()?;
        std::process::exit(1);
    };

    init_logging(&cli.log_level)?;
    run(listen, upstream, cli.grpc, cli.http).await
}

async fn run(
    listen: String,
    upstream: String,
    grpc_addr: String,
    http_addr: Option<String>,
) -> anyhow::Result<()> {
    let bus = EventBus::new(DEFAULT_BUS_CAPACITY);
    let proxy = Arc::new(ReverseProxy::new(listen.clone(), &upstream)?);
    let replay: Arc<dyn ReplayHandler> = Arc::clone(&proxy) as Arc<dyn ReplayHandler>;

    // Captured events flow from the proxy's channel into the bus; the task
    // ends when the proxy winds down and the channel closes.
    let mut events = proxy
        .take_events()
        .context("proxy event receiver already taken")?;
    let forwarder_bus = bus.clone();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            forwarder_bus.publish(&event);
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let grpc_listener = tokio::net::TcpListener::bind(normalize_addr(&grpc_addr))
        .await
        .with_context(|| format!("listen grpc {grpc_addr}"))?;
    tracing::info!(addr = %grpc_addr, "gRPC server listening");
    let tap_server = Arc::new(TapServer::new(bus.clone(), Arc::clone(&replay)));
    let grpc_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        if let Err(error) = tap_server.serve(grpc_listener, grpc_shutdown).await {
            tracing::warn!(%error, "grpc serve failed");
        }
    });

    if let Some(http_addr) = http_addr {
        let http_listener = tokio::net::TcpListener::bind(normalize_addr(&http_addr))
            .await
            .with_context(|| format!("listen http {http_addr}"))?;
        tracing::info!(addr = %http_addr, "HTTP server listening");
        let app = web::router(bus.clone(), Arc::clone(&replay));
        let mut web_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let serving = axum::serve(http_listener, app).with_graceful_shutdown(async move {
                let _ = web_shutdown.changed().await;
            });
            if let Err(error) = serving.await {
                tracing::warn!(%error, "http serve failed");
            }
        });
    }

    let proxy_listener = proxy.bind().await?;
    tracing::info!(%listen, %upstream, "proxying");
    proxy
        .run_with_listener(proxy_listener, shutdown_rx)
        .await
        .context("proxy serve")?;
    Ok(())
}

fn init_logging(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_new(level)
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|error| anyhow::anyhow!("invalid log level: {error}"))?;
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
    Ok(())
}

/// Accepts Go-style listen addresses like ":9090".
fn normalize_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                tracing::warn!(%error, "installing SIGTERM handler failed");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
