//! Rendezvous Service
//!
//! The publicly reachable half of the system: one WebSocket listener per
//! process, the pending-connection registry it dispatches into, and the
//! public address shared by every channel. Channels hold an
//! `Arc<RendezvousService>`; tests start as many isolated instances as they
//! like, while applications normally go through [`RendezvousService::init_global`].

use crate::dialer::Dialer;
use crate::registry::PendingConnections;
use crate::resolver::{AddressEcho, HttpAddressEcho, PublicAddress};
use crate::WsStream;
use ferry_core::{FerryConfig, FerryError, Result};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::fmt;
use std::net::{Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;

static GLOBAL: OnceCell<Arc<RendezvousService>> = OnceCell::new();
static GLOBAL_INITIALIZING: AtomicBool = AtomicBool::new(false);

// =============================================================================
// Rendezvous Service
// =============================================================================

/// Listener, registry and address cache shared by every channel
pub struct RendezvousService {
    /// Service configuration
    config: FerryConfig,
    /// Address the listener actually bound (resolves port 0)
    local_addr: SocketAddr,
    /// Cached externally visible address
    public_address: PublicAddress,
    /// Outbound connection helper sharing the address cache
    dialer: Dialer,
    /// Keys awaiting an inbound transport
    pending: PendingConnections<WsStream>,
    /// Accept loop, aborted on drop
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for RendezvousService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RendezvousService")
            .field("local_addr", &self.local_addr)
            .field("public_address", &self.public_address)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl RendezvousService {
    /// Bind the listener and start accepting connections.
    ///
    /// The public address is looked up lazily through `echo` the first time a
    /// channel needs its URL.
    pub async fn start(config: FerryConfig, echo: Arc<dyn AddressEcho>) -> Result<Arc<Self>> {
        config.validate()?;

        let bind_addr = SocketAddr::new(config.bind_address, config.port);
        let listener = TcpListener::bind(bind_addr).await.map_err(|e| {
            FerryError::configuration(format!("Failed to bind rendezvous listener on {bind_addr}: {e}"))
        })?;
        let local_addr = listener.local_addr()?;

        let public_address = PublicAddress::new(echo);
        let dialer = Dialer::new(public_address.clone(), config.dial_timeout());

        let service = Arc::new(Self {
            config,
            local_addr,
            public_address,
            dialer,
            pending: PendingConnections::new(),
            accept_task: Mutex::new(None),
        });

        let accept_task = tokio::spawn(Self::accept_loop(Arc::downgrade(&service), listener));
        *service.accept_task.lock() = Some(accept_task);

        tracing::info!(local_addr = %local_addr, "Rendezvous listener started");
        Ok(service)
    }

    /// Start with the HTTP address echo named in the configuration
    pub async fn start_with_config(config: FerryConfig) -> Result<Arc<Self>> {
        let echo = HttpAddressEcho::with_timeout(&config.address_echo_url, config.dial_timeout())?;
        Self::start(config, Arc::new(echo)).await
    }

    /// Start the process-wide instance. A second call fails with
    /// `AlreadyInitialized`, even if the first one failed.
    pub async fn init_global(config: FerryConfig, echo: Arc<dyn AddressEcho>) -> Result<Arc<Self>> {
        if GLOBAL_INITIALIZING.swap(true, Ordering::SeqCst) {
            return Err(FerryError::AlreadyInitialized);
        }

        let service = Self::start(config, echo).await?;
        GLOBAL
            .set(service.clone())
            .map_err(|_| FerryError::AlreadyInitialized)?;
        Ok(service)
    }

    /// The process-wide instance, if [`init_global`](Self::init_global) succeeded
    pub fn global() -> Option<Arc<Self>> {
        GLOBAL.get().cloned()
    }

    /// Get the service configuration
    pub fn config(&self) -> &FerryConfig {
        &self.config
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Port advertised in rendezvous URLs
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Shared public address cache
    pub fn public_address(&self) -> &PublicAddress {
        &self.public_address
    }

    /// Dialer sharing this service's address cache
    pub fn dialer(&self) -> &Dialer {
        &self.dialer
    }

    /// Pending-connection registry
    pub fn pending(&self) -> &PendingConnections<WsStream> {
        &self.pending
    }

    /// Rendezvous URL for `key`: `ws://<public-address>:<port>/<key>`
    pub async fn rendezvous_url(&self, key: &str) -> Result<String> {
        let host = self.public_address.resolve().await?;
        let host = if host.parse::<Ipv6Addr>().is_ok() {
            format!("[{host}]")
        } else {
            host
        };
        Ok(format!("ws://{}:{}/{}", host, self.port(), key))
    }

    /// Stop accepting connections. Pending entries stay registered but can
    /// no longer be reached.
    pub fn shutdown(&self) {
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
            tracing::info!(local_addr = %self.local_addr, "Rendezvous listener stopped");
        }
    }

    // =========================================================================
    // Connection Dispatch
    // =========================================================================

    async fn accept_loop(service: Weak<Self>, listener: TcpListener) {
        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(error = %e, "Rendezvous accept failed");
                    continue;
                }
            };

            let Some(service) = service.upgrade() else {
                break;
            };
            tokio::spawn(async move {
                service.dispatch(stream, peer_addr).await;
            });
        }
    }

    /// Upgrade one inbound connection and hand it to the channel waiting on
    /// its key. Unknown keys are refused during the upgrade.
    async fn dispatch(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let _ = stream.set_nodelay(true);

        let mut requested_key: Option<String> = None;
        let pending = &self.pending;
        let callback = |request: &Request, response: Response| {
            let key = request.uri().path().trim_start_matches('/');
            if key.is_empty() || !pending.contains(key) {
                return Err(reject(StatusCode::NOT_FOUND, "unknown rendezvous key"));
            }
            requested_key = Some(key.to_string());
            Ok(response)
        };

        let upgraded = timeout(self.config.dial_timeout(), accept_hdr_async(stream, callback)).await;
        let mut ws_stream = match upgraded {
            Ok(Ok(ws_stream)) => ws_stream,
            Ok(Err(e)) => {
                tracing::debug!(peer = %peer_addr, error = %e, "Rejected rendezvous connection");
                return;
            }
            Err(_) => {
                tracing::debug!(peer = %peer_addr, "Rendezvous upgrade timed out");
                return;
            }
        };

        let Some(key) = requested_key else {
            return;
        };

        // The key may have been consumed or expired while the upgrade ran
        match self.pending.take(&key) {
            Some(activation) => {
                tracing::debug!(peer = %peer_addr, key = %key, "Dispatching rendezvous connection");
                activation(ws_stream).await;
            }
            None => {
                tracing::debug!(peer = %peer_addr, key = %key, "Rendezvous key consumed during upgrade");
                let _ = ws_stream.close(None).await;
            }
        }
    }
}

impl Drop for RendezvousService {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.get_mut().take() {
            task.abort();
        }
    }
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}
