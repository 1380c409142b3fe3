use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use keylock_core::{LockService, Metrics, Server, ServerConfig};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

mod status;

/// Key lock coordinator speaking a line protocol over TCP or a unix socket
#[derive(Parser, Debug)]
#[command(name = "keylockd", version)]
#[command(about = "Key lock coordinator", long_about = None)]
struct Args {
    /// TCP port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Unix socket path (disables TCP)
    #[arg(short, long)]
    socket: Option<String>,

    /// Access mask for the unix socket, in octal
    #[arg(short, long)]
    access: Option<String>,

    /// Interface to listen on
    #[arg(short, long)]
    listen: Option<String>,

    /// Maximum simultaneous connections
    #[arg(short = 'c', long)]
    max_connections: Option<usize>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Args {
    fn apply(&self, config: &mut ServerConfig) {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(socket) = &self.socket {
            config.socket_path = Some(socket.clone());
        }
        if let Some(access) = &self.access {
            config.socket_access = access.clone();
        }
        if let Some(listen) = &self.listen {
            config.host = listen.clone();
        }
        if let Some(max_connections) = self.max_connections {
            config.max_connections = max_connections;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut config = ServerConfig::load().context("failed to load configuration")?;
    args.apply(&mut config);
    config.validate().context("invalid configuration")?;
    init_tracing(&config, args.verbose);
    info!("service config:\n{:?}", config);

    let service = Arc::new(LockService::new(&config, Metrics::new()));
    status::spawn_status_server(&config, service.clone())
        .context("failed to start status server")?;

    let server = Server::bind(&config, service)
        .await
        .context("failed to bind listener")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx.send(true);
    });

    server
        .serve(shutdown_rx)
        .await
        .context("lock server terminated unexpectedly")?;

    info!("server shutdown complete");
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(%err, "failed to listen for CTRL+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(%err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received SIGINT, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("received SIGTERM, initiating graceful shutdown");
        }
    }
}

fn default_filter(verbose: u8) -> EnvFilter {
    match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    }
}

fn init_tracing(config: &ServerConfig, verbose: u8) {
    let filter = default_filter(verbose);

    if config.log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .with_file(true)
            .with_line_number(true)
            .with_span_events(FmtSpan::CLOSE)
            .init();
    } else {
        tracing_subscriber::fmt()
            .compact()
            .with_env_filter(filter)
            .with_target(false)
            .with_file(true)
            .with_line_number(true)
            .with_span_events(FmtSpan::CLOSE)
            .init();
    }
}
