//! # Ferry Core - Shared Types
//!
//! Foundation types for rendezvous channel establishment. Everything here is
//! plain data with no runtime: the runtime pieces live in `ferry-rendezvous`.
//!
//! ## Modules
//!
//! - [`errors`]: Unified error type (`FerryError`) and `Result` alias
//! - [`config`]: Listener and channel configuration with file/env loading
//! - [`messages`]: SYNQ/ACK negotiation messages and protocol roles

#![forbid(unsafe_code)]

// =============================================================================
// MODULES
// =============================================================================

/// Unified error handling
pub mod errors;

/// Configuration surface (port, key length, timeouts, address echo)
pub mod config;

/// Negotiation messages exchanged out-of-band between peers
pub mod messages;

// =============================================================================
// RE-EXPORTS
// =============================================================================

pub use config::FerryConfig;
pub use errors::{FerryError, Result};
pub use messages::{Ack, Protocol, Synq, AUTHOR, CONTROL_TOKEN};
