//! Subcommand implementations

pub mod relay;
pub mod request;
pub mod respond;

use anyhow::{Context, Result};
use ferry_core::FerryConfig;
use ferry_rendezvous::{HttpAddressEcho, RendezvousService, StaticAddressEcho};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::io::{BufReader, Lines, Stdin};
use tracing::info;

/// Line-oriented stdin shared by the handshake and the relay
pub type StdinLines = Lines<BufReader<Stdin>>;

/// Start the process-wide rendezvous service
pub async fn start_service(
    config: FerryConfig,
    public_address: Option<String>,
) -> Result<Arc<RendezvousService>> {
    let service = match public_address {
        Some(address) => {
            info!(public_address = %address, "Using configured public address");
            RendezvousService::init_global(config, Arc::new(StaticAddressEcho(address))).await?
        }
        None => {
            let echo =
                HttpAddressEcho::with_timeout(&config.address_echo_url, config.dial_timeout())?;
            RendezvousService::init_global(config, Arc::new(echo)).await?
        }
    };

    info!(local_addr = %service.local_addr(), "Rendezvous listener ready");
    Ok(service)
}

/// Open stdin for line reading
pub fn stdin_lines() -> StdinLines {
    use tokio::io::AsyncBufReadExt;
    BufReader::new(tokio::io::stdin()).lines()
}

/// Read the next non-blank stdin line as a JSON `what`
pub async fn read_json_line<T: DeserializeOwned>(input: &mut StdinLines, what: &str) -> Result<T> {
    loop {
        let line = input
            .next_line()
            .await?
            .with_context(|| format!("stdin closed before the {what} arrived"))?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        return serde_json::from_str(line).with_context(|| format!("Invalid {what} JSON"));
    }
}

/// Print one message as a single JSON line on stdout
pub fn print_json_line<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}
