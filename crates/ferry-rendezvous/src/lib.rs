//! # Ferry Rendezvous
//!
//! Establishes a single bidirectional message channel between two peers that
//! cannot reach each other directly, brokered by a publicly reachable
//! WebSocket listener.
//!
//! ## Flow
//!
//! 1. A calls [`Channel::request`]: its key is registered with the listener
//!    and a [`Synq`] advertising `ws://<public>:<port>/<key>` comes back.
//! 2. The application carries the SYNQ to B, which calls
//!    [`Channel::respond`]. B dials A's URL and answers with an [`Ack`].
//! 3. The application carries the ACK back; A calls [`Channel::open`], sends
//!    the control token over the bound transport and both sides are open.
//!
//! ## Modules
//!
//! - [`channel`]: Per-channel handshake state machine
//! - [`service`]: Rendezvous listener that dispatches inbound connections
//! - [`registry`]: One-time key → activation map
//! - [`dialer`]: Outbound connections with the same-host loopback rewrite
//! - [`resolver`]: Cached public address lookup

#![forbid(unsafe_code)]

// =============================================================================
// MODULES
// =============================================================================

/// Channel handshake state machine
pub mod channel;

/// Connect-side dialer
pub mod dialer;

/// Pending-connection registry
pub mod registry;

/// Public address resolution
pub mod resolver;

/// Rendezvous listener service
pub mod service;

// =============================================================================
// RE-EXPORTS
// =============================================================================

pub use ferry_core::{Ack, FerryConfig, FerryError, Protocol, Result, Synq, CONTROL_TOKEN};

pub use channel::{Channel, ChannelState, CloseReason, HookKind};
pub use dialer::Dialer;
pub use registry::PendingConnections;
pub use resolver::{AddressEcho, HttpAddressEcho, PublicAddress, StaticAddressEcho};
pub use service::RendezvousService;

/// WebSocket transport as seen by both the listener and the dialer
pub type WsStream = tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>;
