//! Connect-Side Dialer
//!
//! Dials a peer-advertised rendezvous URL. When the URL names this process's
//! own public address the host is swapped for loopback first, so two channels
//! behind the same public address (or in the same process) meet without
//! routing through the outside world.

use crate::resolver::PublicAddress;
use crate::WsStream;
use ferry_core::{FerryError, Result};
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::client_async;
use url::{Host, Url};

/// Opens outbound rendezvous connections
#[derive(Debug, Clone)]
pub struct Dialer {
    public_address: PublicAddress,
    dial_timeout: Duration,
}

impl Dialer {
    /// Create a dialer sharing the service's public address cache
    pub fn new(public_address: PublicAddress, dial_timeout: Duration) -> Self {
        Self {
            public_address,
            dial_timeout,
        }
    }

    /// Rewrite `url` to loopback if its host is our own public address.
    ///
    /// A failed address lookup leaves the URL untouched: the peer may well
    /// be somewhere else.
    pub async fn resolve_target(&self, url: &str) -> Result<Url> {
        let mut target = Url::parse(url)?;

        match self.public_address.resolve().await {
            Ok(own) => {
                if rewrite_to_loopback(&mut target, &own)? {
                    tracing::debug!(url = %url, rewritten = %target, "Dialing own public address via loopback");
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "Public address unknown; dialing URL as advertised");
            }
        }

        Ok(target)
    }

    /// Resolve the target and complete the WebSocket handshake
    pub async fn dial(&self, url: &str) -> Result<WsStream> {
        let target = self.resolve_target(url).await?;
        let host = match target.host() {
            Some(Host::Ipv6(ip)) => ip.to_string(),
            Some(host) => host.to_string(),
            None => return Err(FerryError::malformed(format!("rendezvous URL has no host: {url}"))),
        };
        let port = target
            .port_or_known_default()
            .ok_or_else(|| FerryError::malformed(format!("rendezvous URL has no port: {url}")))?;

        let (ws_stream, response) = timeout(self.dial_timeout, async {
            let stream = TcpStream::connect((host.as_str(), port)).await?;
            stream.set_nodelay(true)?;
            client_async(target.as_str(), stream)
                .await
                .map_err(FerryError::from)
        })
        .await
        .map_err(|_| FerryError::timeout(format!("WebSocket connect to {target} timed out")))??;

        tracing::debug!(
            target = %target,
            status = %response.status(),
            "Rendezvous connection established"
        );
        Ok(ws_stream)
    }
}

/// Swap the host of `url` for `127.0.0.1` when it equals `own_address`.
/// Returns whether a rewrite happened.
pub fn rewrite_to_loopback(url: &mut Url, own_address: &str) -> Result<bool> {
    let own = own_address.trim_start_matches('[').trim_end_matches(']');
    let host = url
        .host_str()
        .map(|h| h.trim_start_matches('[').trim_end_matches(']'));

    if host != Some(own) {
        return Ok(false);
    }

    url.set_ip_host(Ipv4Addr::LOCALHOST.into())
        .map_err(|_| FerryError::malformed(format!("cannot set host on {url}")))?;
    Ok(true)
}
