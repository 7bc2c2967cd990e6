//! Negotiation Messages
//!
//! The two messages peers exchange out-of-band to agree on roles before any
//! transport exists. A requester sends a [`Synq`] listing every role it can
//! play; the responder picks one and answers with an [`Ack`].

use crate::errors::{FerryError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Author tag stamped on every message produced by this layer
pub const AUTHOR: &str = "physical-node";

/// Reserved first message on a finalized transport ("ready for transmission")
pub const CONTROL_TOKEN: &str = "RFT";

// =============================================================================
// Protocol Roles
// =============================================================================

/// Role a channel plays once negotiation settles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    /// Opens a pending connection and advertises a dial-able URL
    Provider,
    /// Dials the Provider's URL
    Consumer,
}

impl Protocol {
    /// Wire name of the role
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Provider => "Provider",
            Protocol::Consumer => "Consumer",
        }
    }

    /// Parse a wire name; unknown names yield `None`
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "Provider" => Some(Protocol::Provider),
            "Consumer" => Some(Protocol::Consumer),
            _ => None,
        }
    }

    /// The role the other side plays
    pub fn counterpart(&self) -> Self {
        match self {
            Protocol::Provider => Protocol::Consumer,
            Protocol::Consumer => Protocol::Provider,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// SYNQ
// =============================================================================

/// Opening negotiation message
///
/// `body` is index-aligned with `supported`: `body[i]` carries the payload the
/// requester attaches to `supported[i]` (the rendezvous URL for `Provider`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Synq {
    /// Who produced the message
    pub author: String,
    /// Offered protocol names, most preferred first
    pub supported: Vec<String>,
    /// Per-protocol payloads aligned with `supported`
    pub body: Vec<String>,
}

impl Synq {
    /// Build a SYNQ from `(role, payload)` pairs in preference order
    pub fn offer(entries: impl IntoIterator<Item = (Protocol, String)>) -> Self {
        let (supported, body): (Vec<String>, Vec<String>) = entries
            .into_iter()
            .map(|(protocol, payload)| (protocol.as_str().to_string(), payload))
            .unzip();
        Self {
            author: AUTHOR.to_string(),
            supported,
            body,
        }
    }

    /// Whether the requester offers `protocol`
    pub fn offers(&self, protocol: Protocol) -> bool {
        self.position(protocol).is_some()
    }

    /// Payload attached to `protocol`
    pub fn body_for(&self, protocol: Protocol) -> Result<&str> {
        let index = self.position(protocol).ok_or_else(|| {
            FerryError::malformed(format!("{protocol} is not offered"))
        })?;
        self.body.get(index).map(String::as_str).ok_or_else(|| {
            FerryError::malformed(format!(
                "no body entry at index {index} for {protocol} ({} supported, {} body)",
                self.supported.len(),
                self.body.len()
            ))
        })
    }

    fn position(&self, protocol: Protocol) -> Option<usize> {
        self.supported.iter().position(|name| name == protocol.as_str())
    }
}

// =============================================================================
// ACK
// =============================================================================

/// Answer to a [`Synq`] naming the role the responder took
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// Who produced the message
    pub author: String,
    /// Role the responder chose, drawn from the SYNQ's `supported`
    pub protocol: String,
    /// Payload for the chosen protocol
    pub body: Vec<String>,
}

impl Ack {
    /// Build an ACK for the role this side took
    pub fn new(protocol: Protocol, body: Vec<String>) -> Self {
        Self {
            author: AUTHOR.to_string(),
            protocol: protocol.as_str().to_string(),
            body,
        }
    }

    /// Parsed role, if recognized
    pub fn protocol(&self) -> Option<Protocol> {
        Protocol::from_name(&self.protocol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_keeps_alignment() {
        let synq = Synq::offer([
            (Protocol::Provider, "ws://198.51.100.4:9010/ab".to_string()),
            (Protocol::Consumer, String::new()),
        ]);
        assert_eq!(synq.author, AUTHOR);
        assert_eq!(synq.supported, vec!["Provider", "Consumer"]);
        assert_eq!(
            synq.body_for(Protocol::Provider).unwrap(),
            "ws://198.51.100.4:9010/ab"
        );
        assert_eq!(synq.body_for(Protocol::Consumer).unwrap(), "");
    }

    #[test]
    fn test_body_for_missing_entry() {
        let synq = Synq {
            author: "peer".into(),
            supported: vec!["Consumer".into(), "Provider".into()],
            body: vec![String::new()],
        };
        assert!(synq.offers(Protocol::Provider));
        assert!(matches!(
            synq.body_for(Protocol::Provider),
            Err(FerryError::MalformedMessage { .. })
        ));
    }

    #[test]
    fn test_unknown_names_ignored() {
        let synq = Synq {
            author: "peer".into(),
            supported: vec!["WebRTC-Offer".into()],
            body: vec!["sdp".into()],
        };
        assert!(!synq.offers(Protocol::Provider));
        assert!(!synq.offers(Protocol::Consumer));
        assert_eq!(Protocol::from_name("WebRTC-Offer"), None);
    }

    #[test]
    fn test_wire_shape() {
        let ack = Ack::new(Protocol::Consumer, vec![String::new()]);
        let json = serde_json::to_value(&ack).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"author": "physical-node", "protocol": "Consumer", "body": [""]})
        );
        assert_eq!(ack.protocol(), Some(Protocol::Consumer));
        assert_eq!(Protocol::Consumer.counterpart(), Protocol::Provider);
    }
}
