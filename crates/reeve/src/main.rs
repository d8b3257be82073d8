//! Reeve - DNS-over-TCP forwarding proxy.
//!
//! The TCP dataplane of a DNS load balancer: accepts plain-TCP and TLS
//! client connections, applies policy, and relays queries to downstream
//! servers over pooled connections.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reeve_config::Config;
use reeve_metrics::tracing_setup::{init_tracing, LogConfig};
use reeve_proxy::ProxyServer;
use std::path::PathBuf;
use tokio::signal;
use tracing::{error, info, warn};

/// Reeve - DNS-over-TCP forwarding proxy
#[derive(Parser, Debug)]
#[command(name = "reeve")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, global = true, value_name = "LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the proxy (default)
    Run,

    /// Validate the configuration file
    Validate,

    /// Show version information
    Version,
}

/// Looks for a configuration file in the usual places.
fn find_config_file(explicit: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path);
    }

    let search_paths = [
        PathBuf::from("./reeve.yaml"),
        PathBuf::from("./reeve.yml"),
        PathBuf::from("/etc/reeve/reeve.yaml"),
        PathBuf::from("/etc/reeve/config.yaml"),
    ];

    search_paths.into_iter().find(|path| path.exists())
}

fn init_logging(cli: &Cli, config: &Config) {
    let level = cli
        .log_level
        .as_deref()
        .unwrap_or(&config.logging.level);
    init_tracing(&LogConfig::from_strings(level, &config.logging.format));
}

async fn run(config: Config) -> Result<()> {
    config.validate().context("invalid configuration")?;

    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install TLS crypto provider"))?;

    let server = ProxyServer::forwarding(&config)
        .await
        .context("failed to start proxy")?;

    info!(version = env!("CARGO_PKG_VERSION"), "reeve started");

    tokio::select! {
        result = server.run() => {
            result.context("proxy terminated")?;
        }
        _ = signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            server.shutdown();
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = find_config_file(cli.config.clone());
    let config = match &config_path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => Config::default(),
    };

    init_logging(&cli, &config);
    match &config_path {
        Some(path) => info!(config = %path.display(), "configuration loaded"),
        None => warn!("no configuration file found, using defaults"),
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            if let Err(e) = run(config).await {
                error!(error = %e, "fatal error");
                return Err(e);
            }
        }
        Commands::Validate => match config.validate() {
            Ok(()) => println!("configuration OK"),
            Err(e) => {
                println!("configuration invalid: {e}");
                std::process::exit(1);
            }
        },
        Commands::Version => {
            println!("reeve {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
