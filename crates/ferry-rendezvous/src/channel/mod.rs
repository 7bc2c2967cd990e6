//! Channel State Machine
//!
//! One endpoint of a to-be-established point-to-point message channel.
//!
//! ```text
//! EMPTY ──request──▶ INITIATED ──open──▶ FINALIZING ──token──▶ OPEN ──▶ CLOSED
//!   └────respond───▶ RESPONDED ─────────────────────token──────▶ OPEN
//! ```
//!
//! The listening side (Provider) waits for the peer to dial its rendezvous
//! URL and, once it also holds the peer's ACK, writes the control token as
//! the first message. The dialing side (Consumer) treats the first inbound
//! message as that token and opens on it. Failures on background paths close
//! the channel and fire `on_close`; [`Channel::close_reason`] says why.

mod hooks;
mod state;

pub use hooks::{CloseHook, HookKind, MessageHook, OpenHook};
pub use state::ChannelState;

use crate::registry::Activation;
use crate::service::RendezvousService;
use crate::WsStream;
use ferry_core::{Ack, FerryError, Protocol, Result, Synq, CONTROL_TOKEN};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{FutureExt, SinkExt, StreamExt};
use hooks::{HookEvent, HookQueue, Hooks};
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Why a channel reached CLOSED
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()` was called
    Local,
    /// The peer closed the transport
    PeerClosed,
    /// A dial, delivery, handshake or timeout failure
    Failed(FerryError),
}

// =============================================================================
// Internal State
// =============================================================================

struct ChannelCore {
    state: ChannelState,
    role: Option<Protocol>,
    /// Set once; a channel never binds a second transport
    transport_bound: bool,
    /// Inbound half of a transport that arrived before the handshake finished
    idle_source: Option<WsSource>,
    close_reason: Option<CloseReason>,
    reader: Option<JoinHandle<()>>,
    expiry: Option<JoinHandle<()>>,
    dial: Option<JoinHandle<()>>,
}

impl ChannelCore {
    fn new() -> Self {
        Self {
            state: ChannelState::Empty,
            role: None,
            transport_bound: false,
            idle_source: None,
            close_reason: None,
            reader: None,
            expiry: None,
            dial: None,
        }
    }

    fn advance(&mut self, next: ChannelState) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        tracing::trace!(from = ?self.state, to = ?next, "Channel state transition");
        self.state = next;
        true
    }
}

struct ChannelShared {
    key: String,
    service: Arc<RendezvousService>,
    core: Mutex<ChannelCore>,
    hooks: Mutex<Hooks>,
    /// Serializes hook invocations without blocking the caller
    hook_queue: HookQueue,
    writer: tokio::sync::Mutex<Option<WsSink>>,
}

/// What an arriving transport should trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Arrival {
    /// Channel is closed or already bound
    Rejected,
    /// Bind and wait for `open`
    Wait,
    /// Bind and send the control token now
    Finalize,
}

// =============================================================================
// Channel
// =============================================================================

/// Handle to one rendezvous channel; clones share the same channel
#[derive(Clone)]
pub struct Channel {
    shared: Arc<ChannelShared>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.shared.core.lock();
        f.debug_struct("Channel")
            .field("key", &self.shared.key)
            .field("state", &core.state)
            .field("role", &core.role)
            .field("transport_bound", &core.transport_bound)
            .finish()
    }
}

impl Channel {
    /// Create an EMPTY channel with a fresh random key
    pub fn new(service: Arc<RendezvousService>) -> Self {
        let key = generate_key(service.config().key_length);
        Self {
            shared: Arc::new(ChannelShared {
                key,
                service,
                core: Mutex::new(ChannelCore::new()),
                hooks: Mutex::new(Hooks::default()),
                hook_queue: HookQueue::default(),
                writer: tokio::sync::Mutex::new(None),
            }),
        }
    }

    /// Hex key; the path of this channel's rendezvous URL
    pub fn key(&self) -> &str {
        &self.shared.key
    }

    /// Current lifecycle state
    pub fn state(&self) -> ChannelState {
        self.shared.core.lock().state
    }

    /// Role this channel plays, once negotiation has decided it
    pub fn role(&self) -> Option<Protocol> {
        self.shared.core.lock().role
    }

    /// Why the channel closed, if it has
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.core.lock().close_reason.clone()
    }

    /// Whether a transport (inbound or dialed) has been bound
    pub fn has_transport(&self) -> bool {
        self.shared.core.lock().transport_bound
    }

    /// Whether a hook is installed in the given slot
    pub fn has_hook(&self, kind: HookKind) -> bool {
        self.shared.hooks.lock().is_set(kind)
    }

    /// This channel's rendezvous URL
    pub async fn rendezvous_url(&self) -> Result<String> {
        self.shared.service.rendezvous_url(&self.shared.key).await
    }

    // =========================================================================
    // Hook Installers
    // =========================================================================

    /// Replace the `on_open` hook
    pub fn set_on_open(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.shared.hooks.lock().on_open = Some(Arc::new(hook));
    }

    /// Replace the `on_message` hook
    pub fn set_on_message(&self, hook: impl Fn(String) + Send + Sync + 'static) {
        self.shared.hooks.lock().on_message = Some(Arc::new(hook));
    }

    /// Replace the `on_close` hook
    pub fn set_on_close(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.shared.hooks.lock().on_close = Some(Arc::new(hook));
    }

    // =========================================================================
    // Handshake
    // =========================================================================

    /// Start a rendezvous as the requesting side.
    ///
    /// Registers this channel's key with the listener (no timeout: the SYNQ
    /// still has to travel to the peer) and returns a SYNQ offering both
    /// roles, with this channel's URL attached to `Provider`.
    pub async fn request(&self) -> Result<Synq> {
        {
            let mut core = self.shared.core.lock();
            if core.state != ChannelState::Empty {
                return Err(core.state.reject("request"));
            }
            self.build_connection_handler(&mut core, None, false)?;
            core.advance(ChannelState::Initiated);
        }

        let url = self.own_url().await?;
        tracing::debug!(key = %self.shared.key, url = %url, "Rendezvous requested");

        Ok(Synq::offer([
            (Protocol::Provider, url),
            (Protocol::Consumer, String::new()),
        ]))
    }

    /// Answer a peer's SYNQ.
    ///
    /// Prefers dialing the peer (`Consumer`) when it offers to listen. The
    /// dial runs in the background: the returned ACK commits to the role
    /// before the connection exists, and a failed dial later closes the
    /// channel.
    pub async fn respond(&self, synq: &Synq) -> Result<Ack> {
        let role = {
            let mut core = self.shared.core.lock();
            if core.state != ChannelState::Empty {
                return Err(core.state.reject("respond"));
            }

            let role = negotiate(synq)?;
            match role {
                Protocol::Consumer => {
                    let url = synq.body_for(Protocol::Provider)?;
                    Url::parse(url)?;
                    core.advance(ChannelState::Responded);
                    core.role = Some(Protocol::Consumer);
                    self.start_dial(&mut core, url.to_string());
                }
                Protocol::Provider => {
                    self.build_connection_handler(&mut core, None, false)?;
                    core.advance(ChannelState::Responded);
                    core.role = Some(Protocol::Provider);
                }
            }
            role
        };

        tracing::debug!(
            key = %self.shared.key,
            role = %role,
            author = %synq.author,
            "Responded to rendezvous request"
        );

        match role {
            Protocol::Consumer => Ok(Ack::new(Protocol::Consumer, vec![String::new()])),
            Protocol::Provider => {
                let url = self.own_url().await?;
                Ok(Ack::new(Protocol::Provider, vec![url]))
            }
        }
    }

    /// Finish the handshake on the requesting side once the peer's ACK is in.
    ///
    /// If the peer already dialed in, the control token goes out now;
    /// otherwise the channel waits up to the pending-connection timeout and
    /// closes if nobody arrives. An ACK in which the peer took `Provider`
    /// makes this side dial the URL it carries instead.
    pub async fn open(&self, ack: &Ack) -> Result<()> {
        let finalize_now = {
            let mut core = self.shared.core.lock();
            if core.state != ChannelState::Initiated {
                return Err(core.state.reject("open"));
            }

            let peer_role = ack
                .protocol()
                .ok_or_else(|| FerryError::unsupported_protocol(std::slice::from_ref(&ack.protocol)))?;

            let provider_url = match (peer_role, core.transport_bound) {
                (Protocol::Provider, false) => {
                    let url = ack
                        .body
                        .first()
                        .filter(|url| !url.is_empty())
                        .ok_or_else(|| FerryError::malformed("Provider ACK carries no URL"))?;
                    Url::parse(url)?;
                    Some(url.clone())
                }
                _ => None,
            };

            core.advance(ChannelState::Finalizing);
            match provider_url {
                Some(url) => {
                    // Peer listens; nobody will dial our own key
                    core.role = Some(Protocol::Consumer);
                    self.shared.service.pending().remove(&self.shared.key);
                    self.start_dial(&mut core, url);
                    false
                }
                None => {
                    core.role = Some(Protocol::Provider);
                    if core.transport_bound {
                        true
                    } else {
                        let timeout = self.shared.service.config().pending_connection_timeout();
                        self.build_connection_handler(&mut core, Some(timeout), true)?;
                        false
                    }
                }
            }
        };

        if finalize_now {
            self.finalize_handshake().await?;
        }
        Ok(())
    }

    // =========================================================================
    // Messaging
    // =========================================================================

    /// Send one application message. Only valid while OPEN; a transport
    /// failure closes the channel.
    pub async fn send(&self, message: impl Into<String>) -> Result<()> {
        {
            let core = self.shared.core.lock();
            if core.state != ChannelState::Open {
                return Err(core.state.reject("send"));
            }
        }

        if let Err(e) = self.write(message.into()).await {
            tracing::warn!(key = %self.shared.key, error = %e, "Send failed; closing channel");
            self.shutdown(CloseReason::Failed(e.clone()));
            return Err(e);
        }
        Ok(())
    }

    /// Close the channel. Idempotent: only the first call fires `on_close`.
    pub fn close(&self) {
        self.shutdown(CloseReason::Local);
    }

    // =========================================================================
    // Pending Connections
    // =========================================================================

    /// Register this channel's key with the listener. With a timeout, the
    /// channel closes if no transport has arrived when it elapses.
    fn build_connection_handler(
        &self,
        core: &mut ChannelCore,
        timeout: Option<Duration>,
        replace: bool,
    ) -> Result<()> {
        let weak = Arc::downgrade(&self.shared);
        let activation: Activation<WsStream> = Box::new(move |ws_stream: WsStream| {
            async move {
                match weak.upgrade() {
                    Some(shared) => Channel { shared }.accept_transport(ws_stream).await,
                    None => {
                        let mut ws_stream = ws_stream;
                        let _ = ws_stream.close(None).await;
                    }
                }
            }
            .boxed()
        });

        let generation =
            self.shared
                .service
                .pending()
                .register(&self.shared.key, activation, replace)?;

        if let Some(expiry) = core.expiry.take() {
            expiry.abort();
        }

        if let Some(timeout) = timeout.filter(|timeout| !timeout.is_zero()) {
            let weak = Arc::downgrade(&self.shared);
            core.expiry = Some(tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                let expired = shared
                    .service
                    .pending()
                    .take_if_current(&shared.key, generation)
                    .is_some();
                if expired {
                    Channel { shared }.expire(timeout);
                }
            }));
        }
        Ok(())
    }

    fn expire(&self, waited: Duration) {
        let waiting = {
            let core = self.shared.core.lock();
            core.state == ChannelState::Finalizing && !core.transport_bound
        };
        if waiting {
            tracing::warn!(
                key = %self.shared.key,
                waited_ms = waited.as_millis() as u64,
                "No peer connected before the pending-connection timeout"
            );
            self.shutdown(CloseReason::Failed(FerryError::timeout(format!(
                "no peer connected within {waited:?}"
            ))));
        }
    }

    /// Listening side: bind a transport handed over by the listener
    async fn accept_transport(&self, ws_stream: WsStream) {
        let (sink, source) = ws_stream.split();
        let mut source = Some(source);
        let mut writer = self.shared.writer.lock().await;

        let arrival = {
            let mut core = self.shared.core.lock();
            if core.transport_bound || core.state.is_terminal() {
                Arrival::Rejected
            } else {
                core.transport_bound = true;
                core.idle_source = source.take();
                if let Some(expiry) = core.expiry.take() {
                    expiry.abort();
                }
                match (core.state, core.role) {
                    (ChannelState::Finalizing, _) => Arrival::Finalize,
                    (ChannelState::Responded, Some(Protocol::Provider)) => Arrival::Finalize,
                    (ChannelState::Initiated, _) => Arrival::Wait,
                    (state, _) => {
                        tracing::error!(key = %self.shared.key, state = ?state, "Peer connected in unexpected state");
                        Arrival::Wait
                    }
                }
            }
        };

        if arrival == Arrival::Rejected {
            drop(writer);
            tracing::debug!(key = %self.shared.key, "Transport arrived for a closed or bound channel; dropping it");
            let mut sink = sink;
            let _ = sink.close().await;
            return;
        }

        *writer = Some(sink);
        drop(writer);
        self.shared.service.pending().remove(&self.shared.key);
        tracing::debug!(key = %self.shared.key, arrival = ?arrival, "Peer connected");

        if arrival == Arrival::Finalize {
            // Failures already closed the channel
            let _ = self.finalize_handshake().await;
        }
    }

    /// Listening side: write the control token, open, then start delivering
    async fn finalize_handshake(&self) -> Result<()> {
        {
            let core = self.shared.core.lock();
            let ready = matches!(
                (core.state, core.role),
                (ChannelState::Finalizing, _) | (ChannelState::Responded, Some(Protocol::Provider))
            );
            if !ready || !core.transport_bound {
                return Ok(());
            }
        }

        if let Err(e) = self.write(CONTROL_TOKEN.to_string()).await {
            tracing::warn!(key = %self.shared.key, error = %e, "Failed to send control token");
            self.shutdown(CloseReason::Failed(e.clone()));
            return Err(e);
        }

        let source = {
            let mut core = self.shared.core.lock();
            if !core.advance(ChannelState::Open) {
                return Ok(());
            }
            core.idle_source.take()
        };

        tracing::info!(key = %self.shared.key, role = "Provider", "Channel open");
        self.fire_open();
        if let Some(source) = source {
            self.spawn_reader(source, false);
        }
        Ok(())
    }

    // =========================================================================
    // Dialing
    // =========================================================================

    fn start_dial(&self, core: &mut ChannelCore, url: String) {
        let channel = self.clone();
        core.dial = Some(tokio::spawn(async move {
            match channel.shared.service.dialer().dial(&url).await {
                Ok(ws_stream) => channel.bind_dialed(ws_stream).await,
                Err(e) => {
                    tracing::warn!(key = %channel.shared.key, url = %url, error = %e, "Dial failed");
                    channel.shutdown(CloseReason::Failed(e));
                }
            }
        }));
    }

    /// Dialing side: bind the fresh transport and wait for the control token
    async fn bind_dialed(&self, ws_stream: WsStream) {
        let (sink, source) = ws_stream.split();
        let mut writer = self.shared.writer.lock().await;

        let accepted = {
            let mut core = self.shared.core.lock();
            let accepted = !core.transport_bound && !core.state.is_terminal();
            if accepted {
                core.transport_bound = true;
            }
            accepted
        };

        if !accepted {
            drop(writer);
            let mut sink = sink;
            let _ = sink.close().await;
            return;
        }

        *writer = Some(sink);
        drop(writer);
        tracing::debug!(key = %self.shared.key, "Connected to provider; awaiting control token");
        self.spawn_reader(source, true);
    }

    // =========================================================================
    // Delivery
    // =========================================================================

    fn spawn_reader(&self, source: WsSource, awaiting_token: bool) {
        let channel = self.clone();
        let task = tokio::spawn(async move {
            channel.read_loop(source, awaiting_token).await;
        });

        let mut core = self.shared.core.lock();
        if core.state.is_terminal() {
            task.abort();
        } else {
            core.reader = Some(task);
        }
    }

    async fn read_loop(&self, mut source: WsSource, mut awaiting_token: bool) {
        while let Some(frame) = source.next().await {
            let text = match frame {
                Ok(Message::Text(text)) => text,
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(_) => {
                        tracing::warn!(key = %self.shared.key, "Dropping non UTF-8 binary frame");
                        continue;
                    }
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    tracing::debug!(key = %self.shared.key, error = %e, "Transport read failed");
                    self.shutdown(CloseReason::Failed(FerryError::from(e)));
                    return;
                }
            };

            if awaiting_token {
                if text != CONTROL_TOKEN {
                    tracing::error!(
                        key = %self.shared.key,
                        message = %text,
                        "Peer failed to honor the handshake"
                    );
                    self.shutdown(CloseReason::Failed(FerryError::protocol_violation(format!(
                        "expected control token, got {text:?}"
                    ))));
                    return;
                }
                awaiting_token = false;
                self.mark_open();
            } else {
                self.fire_message(text);
            }

            // A hook may have closed the channel
            if self.state().is_terminal() {
                return;
            }
        }

        tracing::debug!(key = %self.shared.key, "Transport closed by peer");
        self.shutdown(CloseReason::PeerClosed);
    }

    /// Dialing side: control token received
    fn mark_open(&self) {
        let opened = self.shared.core.lock().advance(ChannelState::Open);
        if opened {
            tracing::info!(key = %self.shared.key, role = "Consumer", "Channel open");
            self.fire_open();
        }
    }

    async fn write(&self, text: String) -> Result<()> {
        let mut writer = self.shared.writer.lock().await;
        let sink = writer
            .as_mut()
            .ok_or_else(|| FerryError::transport("no transport bound"))?;
        sink.send(Message::Text(text)).await?;
        Ok(())
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    fn shutdown(&self, reason: CloseReason) {
        let (tasks, idle_source) = {
            let mut core = self.shared.core.lock();
            if core.state.is_terminal() {
                return;
            }
            core.advance(ChannelState::Closed);
            core.close_reason = Some(reason.clone());
            (
                [core.expiry.take(), core.dial.take(), core.reader.take()],
                core.idle_source.take(),
            )
        };

        self.shared.service.pending().remove(&self.shared.key);
        for task in tasks.into_iter().flatten() {
            task.abort();
        }
        drop(idle_source);
        self.release_transport();

        match &reason {
            CloseReason::Failed(e) => {
                tracing::warn!(key = %self.shared.key, error = %e, "Channel closed on failure")
            }
            other => tracing::debug!(key = %self.shared.key, reason = ?other, "Channel closed"),
        }
        self.fire_close();
    }

    fn release_transport(&self) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let shared = self.shared.clone();
                handle.spawn(async move {
                    let sink = shared.writer.lock().await.take();
                    if let Some(mut sink) = sink {
                        let _ = sink.close().await;
                    }
                });
            }
            Err(_) => {
                if let Ok(mut writer) = self.shared.writer.try_lock() {
                    writer.take();
                }
            }
        }
    }

    async fn own_url(&self) -> Result<String> {
        match self.rendezvous_url().await {
            Ok(url) => Ok(url),
            Err(e) => {
                self.shutdown(CloseReason::Failed(e.clone()));
                Err(e)
            }
        }
    }

    // =========================================================================
    // Hook Dispatch
    // =========================================================================

    // Hooks may run on whichever thread is already dispatching for this
    // channel, so a `close()` from a hook returns before `on_close` runs.

    fn fire_open(&self) {
        self.fire(HookEvent::Open);
    }

    fn fire_message(&self, message: String) {
        self.fire(HookEvent::Message(message));
    }

    fn fire_close(&self) {
        self.fire(HookEvent::Close);
    }

    fn fire(&self, event: HookEvent) {
        self.shared
            .hook_queue
            .push(event, |event| self.deliver(event));
    }

    fn deliver(&self, event: HookEvent) {
        let hooks = self.shared.hooks.lock().clone();
        let key = &self.shared.key;
        match event {
            HookEvent::Open => match hooks.on_open {
                Some(hook) => hook(),
                None => tracing::warn!(key = %key, "on_open not set"),
            },
            HookEvent::Message(message) => match hooks.on_message {
                Some(hook) => hook(message),
                None => tracing::warn!(key = %key, "on_message not set"),
            },
            HookEvent::Close => match hooks.on_close {
                Some(hook) => hook(),
                None => tracing::warn!(key = %key, "on_close not set"),
            },
        }
    }
}

/// Pick this side's role: dial when the peer offers to listen, else listen
/// when the peer offers to dial.
fn negotiate(synq: &Synq) -> Result<Protocol> {
    [Protocol::Provider, Protocol::Consumer]
        .into_iter()
        .find(|offered| synq.offers(*offered))
        .map(|offered| offered.counterpart())
        .ok_or_else(|| FerryError::unsupported_protocol(&synq.supported))
}

fn generate_key(length: usize) -> String {
    let mut bytes = vec![0u8; length];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synq(supported: &[&str], body: &[&str]) -> Synq {
        Synq {
            author: "peer".into(),
            supported: supported.iter().map(|s| s.to_string()).collect(),
            body: body.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_negotiate_prefers_dialing() {
        assert_eq!(
            negotiate(&synq(&["Consumer", "Provider"], &["", "ws://x:1/k"])).unwrap(),
            Protocol::Consumer
        );
        assert_eq!(
            negotiate(&synq(&["Consumer"], &[""])).unwrap(),
            Protocol::Provider
        );
    }

    #[test]
    fn test_negotiate_no_overlap() {
        assert!(matches!(
            negotiate(&synq(&[], &[])),
            Err(FerryError::UnsupportedProtocol { .. })
        ));
        assert!(matches!(
            negotiate(&synq(&["WebRTC"], &["sdp"])),
            Err(FerryError::UnsupportedProtocol { offered }) if offered == vec!["WebRTC".to_string()]
        ));
    }

    #[test]
    fn test_key_length() {
        let key = generate_key(16);
        assert_eq!(key.len(), 32);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(generate_key(16), key);
    }
}
