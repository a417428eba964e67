//! forward-proxy binary.
//!
//! Binds the listener, wires the relays to the stats registry, and runs
//! until interrupted. On shutdown the accept loop stops, the configured
//! export (if any) is written, and the process exits without draining
//! in-flight tunnels.

use clap::Parser;
use std::path::PathBuf;

use forward_proxy::config::{load_config, ProxyConfig};
use forward_proxy::lifecycle::{shutdown::wait_for_signal, Shutdown};
use forward_proxy::net::Listener;
use forward_proxy::observability::init_logging;
use forward_proxy::server::ProxyServer;

#[derive(Parser, Debug)]
#[command(name = "forward-proxy", about = "Traffic-recording forward proxy for sandboxed VMs")]
struct Args {
    /// Path to a TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Bind address, overriding the config (e.g. 0.0.0.0:7890).
    #[arg(long)]
    bind: Option<String>,

    /// Append logs to this file as well as stdout.
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Write the {stats, logs} JSON export here on shutdown.
    #[arg(long)]
    export_file: Option<PathBuf>,

    /// Log at debug level.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => ProxyConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.listener.bind_address = bind;
    }
    if let Some(path) = args.log_file {
        config.observability.log_file = Some(path);
    }
    if let Some(path) = args.export_file {
        config.export.path = Some(path);
    }
    if args.verbose {
        config.observability.log_level = "debug".to_string();
    }

    // Keep the appender guard alive for the process lifetime.
    let _log_guard = init_logging(
        &config.observability.log_level,
        config.observability.log_file.as_deref(),
    )?;

    tracing::info!(
        bind_address = %config.listener.bind_address,
        max_connections = config.listener.max_connections,
        request_timeout_secs = config.timeouts.request_secs,
        "Configuration loaded"
    );

    // Cannot bind: fatal. Everything after this point is contained
    // per-connection.
    let listener = Listener::bind(&config.listener).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(address = %local_addr, "Proxy server listening");
    tracing::info!("Configure the sandbox VM to use: http://{local_addr}");
    if let Some(path) = &config.observability.log_file {
        tracing::info!(path = %path.display(), "Logging to file");
    }

    let shutdown = Shutdown::new();
    let server = ProxyServer::new(config.clone());
    let stats = server.stats();

    let server_shutdown = shutdown.subscribe();
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("Shutdown signal received");
        shutdown.trigger();
    });

    server.run(listener, server_shutdown).await?;

    if let Some(path) = &config.export.path {
        if let Err(e) = stats.export(path) {
            tracing::error!(error = %e, "Final export failed");
        }
    }

    tracing::info!("Proxy server stopped");
    Ok(())
}
