//! `ferry respond`: the side that answers a SYNQ

use super::{print_json_line, read_json_line, relay, stdin_lines};
use anyhow::Result;
use ferry_core::Synq;
use ferry_rendezvous::{Channel, RendezvousService};
use std::sync::Arc;
use tracing::info;

/// Read a SYNQ from stdin, print the ACK, then relay
pub async fn run(service: Arc<RendezvousService>) -> Result<()> {
    let channel = Channel::new(service);
    let events = relay::attach(&channel);

    let mut input = stdin_lines();
    info!("Paste the peer's SYNQ");
    let synq: Synq = read_json_line(&mut input, "SYNQ").await?;

    let ack = channel.respond(&synq).await?;
    print_json_line(&ack)?;
    info!(role = ?channel.role(), "Hand the ACK above back to your peer");

    relay::run(channel, events, input).await
}
