//! Terminal relay for an open channel
//!
//! Received messages are printed one per line on stdout; each stdin line is
//! sent as one message. Stdin EOF closes the channel.

use super::StdinLines;
use anyhow::{anyhow, Result};
use ferry_rendezvous::{Channel, CloseReason};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Channel events forwarded from the hooks
#[derive(Debug)]
pub enum RelayEvent {
    /// `on_open` fired
    Opened,
    /// One application message
    Received(String),
    /// `on_close` fired
    Closed,
}

/// Install hooks that forward into a queue. Must run before the handshake
/// starts so `on_open` cannot be missed.
pub fn attach(channel: &Channel) -> mpsc::UnboundedReceiver<RelayEvent> {
    let (tx, rx) = mpsc::unbounded_channel();

    let open_tx = tx.clone();
    channel.set_on_open(move || {
        let _ = open_tx.send(RelayEvent::Opened);
    });
    let message_tx = tx.clone();
    channel.set_on_message(move |message| {
        let _ = message_tx.send(RelayEvent::Received(message));
    });
    channel.set_on_close(move || {
        let _ = tx.send(RelayEvent::Closed);
    });
    rx
}

/// Pump events and stdin until the channel closes
pub async fn run(
    channel: Channel,
    mut events: mpsc::UnboundedReceiver<RelayEvent>,
    mut input: StdinLines,
) -> Result<()> {
    let mut open = false;
    let mut input_done = false;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(RelayEvent::Opened) => {
                    open = true;
                    info!(key = %channel.key(), "Channel open; lines typed here are sent");
                }
                Some(RelayEvent::Received(message)) => println!("{message}"),
                Some(RelayEvent::Closed) | None => break,
            },
            line = input.next_line(), if open && !input_done => match line? {
                Some(line) => {
                    if let Err(e) = channel.send(line).await {
                        warn!(error = %e, "Send failed");
                    }
                }
                None => {
                    input_done = true;
                    channel.close();
                }
            },
        }
    }

    match channel.close_reason() {
        Some(CloseReason::Failed(e)) => Err(anyhow!(e).context("Channel failed")),
        reason => {
            info!(reason = ?reason, "Channel closed");
            Ok(())
        }
    }
}
