//! Lint Daemon - Rust Implementation
//!
//! Serves a code analysis engine to editor clients over JSON-RPC.

use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use lint_daemon::config::{Args, Config, LogFormat, Transport as TransportKind};
use lint_daemon::daemon::ConnectedDaemon;
use lint_daemon::engine::ConnectedEngineFactory;
use lint_daemon::error::{Error, Result};
use lint_daemon::http::HttpTransport;
use lint_daemon::metrics::Metrics;
use lint_daemon::rpc::{RpcServer, TcpTransport, Transport};
use lint_daemon::VERSION;

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();
    let args = Args::parse();
    let config: Config = args.into();

    init_logging(&config)?;

    info!("Lint Daemon v{}", VERSION);
    info!("Storage home: {:?}", config.home);
    info!("Default languages: {:?}", config.languages);

    let daemon = Arc::new(ConnectedDaemon::new(
        Arc::new(ConnectedEngineFactory),
        config.registration_defaults(),
        Metrics::new(),
    ));
    let shutdown = daemon.shutdown_token();
    let server = Arc::new(RpcServer::new(Arc::clone(&daemon)));

    let transport: Box<dyn Transport> = match config.transport {
        TransportKind::Tcp => Box::new(TcpTransport::bind(config.listen_addr()).await?),
        TransportKind::Http => Box::new(HttpTransport::bind(config.listen_addr()).await?),
    };
    let addr = transport.local_addr()?;

    // Clients wait for this line before connecting.
    println!("Server started, listening on {}", addr);
    info!("Listening on {} ({:?})", addr, config.transport);

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupted, shutting down");
                signal_token.cancel();
            }
            Err(e) => warn!("Failed to listen for interrupt: {}", e),
        }
    });

    let served = transport.serve(server, shutdown).await;
    daemon.teardown().await;
    served
}

fn init_logging(config: &Config) -> Result<()> {
    let default_level = if config.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let result = match config.log_format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    result.map_err(|e| Error::Config(format!("Failed to set tracing subscriber: {}", e)))
}
