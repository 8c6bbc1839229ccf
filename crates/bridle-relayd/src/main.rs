//! # bridle-relayd
//!
//! Relay daemon binary — loads configuration, wires the server to a
//! debugger backend, and runs until interrupted.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use bridle_relay::config::RelayConfig;
use bridle_relay::metrics;
use bridle_relay::runtime::SharedDebuggerFactory;
use bridle_relay::server::RelayServer;
use bridle_router::fake::FakeDebugger;
use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Bridle relay daemon.
#[derive(Parser, Debug)]
#[command(name = "bridle-relayd", about = "Session-multiplexed CDP relay")]
struct Cli {
    /// Host to bind.
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Path to a JSON configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Maximum concurrent websocket clients (overrides config).
    #[arg(long)]
    max_connections: Option<usize>,

    /// Tabs the stub debugger backend starts with.
    #[arg(long, value_delimiter = ',', default_value = "1")]
    stub_tabs: Vec<i64>,
}

fn load_config(args: &Cli) -> Result<RelayConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("invalid config file {}", path.display()))?
        }
        None => RelayConfig::default(),
    };
    if let Some(host) = &args.host {
        config.host.clone_from(host);
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(max) = args.max_connections {
        config.max_connections = max;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = load_config(&args)?;
    let metrics_handle = metrics::install_recorder();

    // The host-platform debugger integration plugs in through the factory
    // seam; the daemon ships with the scriptable stub backend.
    let fake = Arc::new(FakeDebugger::with_tabs(&args.stub_tabs));
    let factory = Arc::new(SharedDebuggerFactory::new(fake));

    let server = RelayServer::new(config, factory).with_metrics(metrics_handle);
    let handle = server.serve().await.context("failed to bind relay")?;
    tracing::info!(addr = %handle.addr, "relay running, ctrl-c to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown signal received, draining");
    handle.shutdown().await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_leave_config_untouched() {
        let args = Cli::parse_from(["bridle-relayd"]);
        let config = load_config(&args).unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.max_connections, 50);
        assert_eq!(args.stub_tabs, vec![1]);
    }

    #[test]
    fn cli_overrides_win() {
        let args = Cli::parse_from([
            "bridle-relayd",
            "--host",
            "0.0.0.0",
            "--port",
            "9900",
            "--max-connections",
            "5",
            "--stub-tabs",
            "7,8,9",
        ]);
        let config = load_config(&args).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9900);
        assert_eq!(config.max_connections, 5);
        assert_eq!(args.stub_tabs, vec![7, 8, 9]);
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let args = Cli::parse_from(["bridle-relayd", "--config", "/nonexistent/relay.json"]);
        assert!(load_config(&args).is_err());
    }
}
