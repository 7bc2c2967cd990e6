//! `ferry request`: the side that starts the rendezvous

use super::{print_json_line, read_json_line, relay, stdin_lines};
use anyhow::Result;
use ferry_core::Ack;
use ferry_rendezvous::{Channel, RendezvousService};
use std::sync::Arc;
use tracing::info;

/// Print a SYNQ, wait for the ACK on stdin, open, then relay
pub async fn run(service: Arc<RendezvousService>) -> Result<()> {
    let channel = Channel::new(service);
    let events = relay::attach(&channel);

    let synq = channel.request().await?;
    print_json_line(&synq)?;
    info!(key = %channel.key(), "Hand the SYNQ above to your peer, then paste its ACK");

    let mut input = stdin_lines();
    let ack: Ack = read_json_line(&mut input, "ACK").await?;
    info!(protocol = %ack.protocol, author = %ack.author, "ACK received; opening channel");
    channel.open(&ack).await?;

    relay::run(channel, events, input).await
}
