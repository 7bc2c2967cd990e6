//! Command-line front end for Ferry
//!
//! Pairs two terminals through a rendezvous channel. SYNQ and ACK messages
//! travel as single JSON lines on stdout/stdin so operators can carry them by
//! copy-paste; once the channel opens, stdin lines are sent and received
//! messages are printed. Logs go to stderr.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ferry_core::FerryConfig;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "ferry")]
#[command(about = "Ferry - rendezvous channels for peers that cannot reach each other", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file path (TOML or JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Listener port, overriding the config file and environment
    #[arg(short, long, global = true)]
    port: Option<u16>,

    /// Address to advertise instead of asking the echo service
    #[arg(long, global = true)]
    public_address: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a rendezvous: print a SYNQ, then read the peer's ACK from stdin
    Request,

    /// Read a SYNQ from stdin and print the ACK to hand back
    Respond,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(&cli)?;
    let service = commands::start_service(config, cli.public_address.clone()).await?;

    match cli.command {
        Commands::Request => commands::request::run(service).await,
        Commands::Respond => commands::respond::run(service).await,
    }
}

/// Defaults, then the config file, then `FERRY_*` variables, then flags
fn load_config(cli: &Cli) -> Result<FerryConfig> {
    let mut config = match &cli.config {
        Some(path) => FerryConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => FerryConfig::default(),
    };
    config.merge_with_env()?;
    if let Some(port) = cli.port {
        config.port = port;
    }
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "ferry",
            "respond",
            "--port",
            "0",
            "--public-address",
            "203.0.113.7",
            "-v",
        ])
        .unwrap();

        assert!(matches!(cli.command, Commands::Respond));
        assert!(cli.verbose);
        assert_eq!(cli.port, Some(0));
        assert_eq!(cli.public_address.as_deref(), Some("203.0.113.7"));
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_port_flag_overrides_defaults() {
        let cli = Cli::try_parse_from(["ferry", "request", "--port", "9100"]).unwrap();
        let config = load_config(&cli).unwrap();
        assert_eq!(config.port, 9100);
        assert_eq!(config.key_length, FerryConfig::default().key_length);
    }
}
