//! Tunsocks CLI
//!
//! Runs the protected SOCKS5 relay standalone and manages its
//! configuration file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tunsocks_engine::{
    Config, EndpointContext, LocalRelay, NoopProtector, ProxyEndpoint, SessionStats,
};

/// Tunsocks - route a virtual interface through a SOCKS5 proxy
#[derive(Parser)]
#[command(name = "tunsocks")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "tunsocks.toml")]
    config: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the local relay in front of the configured upstream proxy
    Relay,

    /// Validate the configuration file
    CheckConfig,

    /// Generate a sample configuration file
    GenConfig {
        /// Output path for the configuration file
        #[arg(short, long, default_value = "tunsocks.toml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level);

    match cli.command {
        Commands::Relay => run_relay(&cli.config).await,
        Commands::CheckConfig => check_config(&cli.config),
        Commands::GenConfig { output } => generate_config(&output),
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run_relay(config_path: &Path) -> Result<()> {
    info!("Starting tunsocks relay...");

    let config = load_config(config_path)?;
    info!("Configuration loaded from {:?}", config_path);

    let stats = Arc::new(SessionStats::new());
    let relay = LocalRelay::new(config.session.relay_listen);
    let context = EndpointContext {
        protector: Arc::new(NoopProtector),
        stats: stats.clone(),
    };

    let addr = relay
        .start(&config.proxy, context)
        .await
        .context("Failed to start relay")?;
    println!("Relay listening on {}", addr);

    wait_for_shutdown().await;

    info!("Shutting down relay...");
    relay.stop().await.context("Failed to stop relay")?;

    let snapshot = stats.snapshot();
    info!(
        "Relayed {} connections ({} refused by protection)",
        snapshot.connections, snapshot.protect_failures
    );

    Ok(())
}

fn check_config(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;

    println!("Configuration {:?} is valid", config_path);
    println!("  upstream: {}:{}", config.proxy.address, config.proxy.port);
    println!(
        "  auth: {}",
        if config.proxy.credentials().is_some() {
            "username/password"
        } else {
            "none"
        }
    );
    println!("  relay listen: {}", config.session.relay_listen);

    Ok(())
}

fn load_config(path: &Path) -> Result<Config> {
    Config::load(path)
        .with_context(|| format!("Failed to load configuration from {:?}", path))
}

fn generate_config(output: &Path) -> Result<()> {
    let sample = Config::sample();

    std::fs::write(output, sample)
        .with_context(|| format!("Failed to write configuration to {:?}", output))?;

    info!("Generated sample configuration at {:?}", output);
    println!("Sample configuration written to {:?}", output);
    println!("\nEdit the configuration file and set your upstream proxy before running.");

    Ok(())
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to register SIGTERM handler");
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .expect("Failed to register SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(windows)]
    {
        signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C");
    }
}
