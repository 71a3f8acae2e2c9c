//! Observing proxy (v1)
//!
//! Sits between a client and a single upstream, forwards every exchange
//! unmodified, and writes what it sees to the log.
//!
//! # Architecture Overview
//!
//! ```text
//!                    ┌──────────────────────────────────────────────┐
//!                    │               OBSERVING PROXY                 │
//!   Client request   │  ┌─────────┐    ┌─────────┐    ┌──────────┐  │
//!   ─────────────────┼─▶│   net   │───▶│  http   │───▶│ upstream │──┼──▶ Upstream
//!                    │  │listener │    │ server  │    │  client  │  │
//!                    │  └─────────┘    └────┬────┘    └──────────┘  │
//!                    │                      │ upgrade               │
//!                    │                      ▼                       │
//!                    │                ┌───────────┐                 │
//!                    │                │ websocket │◀────────────────┼──▶ Upstream
//!                    │                │   relay   │                 │
//!                    │                └─────┬─────┘                 │
//!                    │   capture/protocol   │                       │
//!                    │                      ▼                       │
//!                    │              ┌──────────────┐                │
//!                    │              │   observer   │──▶ log lines   │
//!                    │              └──────────────┘                │
//!                    └──────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

use observing_proxy::config::{load_config, validate_config, ProxyConfig};
use observing_proxy::lifecycle::{signals, Shutdown};
use observing_proxy::net;
use observing_proxy::observability::logging;
use observing_proxy::HttpServer;

#[derive(Parser, Debug)]
#[command(name = "observing-proxy")]
#[command(about = "Transparent proxy that logs every exchange it forwards", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on (keeps the configured bind host)
    #[arg(short, long)]
    port: Option<u16>,

    /// Upstream host
    #[arg(long)]
    upstream_host: Option<String>,

    /// Upstream port
    #[arg(long)]
    upstream_port: Option<u16>,

    /// Bytes captured per body or frame before truncation
    #[arg(long)]
    max_capture_bytes: Option<usize>,

    /// Forward without observing bodies, headers or frames
    #[arg(long)]
    no_capture: bool,
}

impl Cli {
    /// Layer command-line overrides on top of the file configuration.
    fn apply(&self, config: &mut ProxyConfig) {
        if let Some(port) = self.port {
            config.listener.bind_address = match config.listener.bind_address.parse::<SocketAddr>() {
                Ok(mut addr) => {
                    addr.set_port(port);
                    addr.to_string()
                }
                Err(_) => format!("0.0.0.0:{}", port),
            };
        }
        if let Some(host) = &self.upstream_host {
            config.upstream.host = host.clone();
        }
        if let Some(port) = self.upstream_port {
            config.upstream.port = port;
        }
        if let Some(max) = self.max_capture_bytes {
            config.capture.max_bytes = max;
        }
        if self.no_capture {
            config.capture.enabled = false;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ProxyConfig::default(),
    };
    cli.apply(&mut config);

    if let Err(errors) = validate_config(&config) {
        for error in &errors {
            eprintln!("invalid configuration: {}", error);
        }
        std::process::exit(2);
    }

    logging::init(&config.observability);

    tracing::info!(
        bind_address = %config.listener.bind_address,
        upstream = %config.upstream.authority(),
        capture = config.capture.enabled,
        max_capture_bytes = config.capture.max_bytes,
        "observing-proxy v{} starting",
        env!("CARGO_PKG_VERSION")
    );

    let listener = net::bind(&config.listener).await?;

    let shutdown = Shutdown::new();
    let server_shutdown = shutdown.subscribe();
    signals::spawn_handler(shutdown);

    let server = HttpServer::new(config);
    server.run(listener, server_shutdown).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
