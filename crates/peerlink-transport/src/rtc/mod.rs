//! WebRTC transport on the `webrtc` crate.
//!
//! Each connection is one `RTCPeerConnection` carrying two data channels,
//! both created by the dialer:
//!
//! | Channel      | Label          | Ordered | Retransmits                  |
//! |--------------|----------------|---------|------------------------------|
//! | default      | `default`      | no      | 0                            |
//! | guaranteed   | caller's label | yes     | `ChannelConfig::max_retransmits` |
//!
//! Offers, answers and trickled ICE candidates travel over a [`Signaler`].
//! ICE itself (STUN, candidate pairing, consent) is left to the WebRTC
//! stack; its state changes surface as
//! [`ConnectionEvent::IceStateChanged`] like every other callback.

mod signal;

pub use signal::{HubSignaler, Signal, SignalBody, SignalHub, Signaler};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use bytes::Bytes;
use rand::Rng;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::{
    ChannelConfig, ChannelKind, ConnectionEvent, ConnectionId, Direction, IceConnectionState,
    PeerConnection, PeerTransport, TransportError,
};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Label of the unordered, no-retransmit channel.
pub const DEFAULT_CHANNEL_LABEL: &str = "default";

/// Candidates for sessions whose offer has not arrived yet are held back,
/// up to this many sessions.
const MAX_EARLY_SESSIONS: usize = 64;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn negotiation_error(e: webrtc::Error) -> TransportError {
    TransportError::Negotiation(e.to_string())
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Settings for [`WebRtcTransport`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    /// STUN/TURN server URLs handed to the ICE agent. Empty means host
    /// candidates only.
    pub ice_servers: Vec<String>,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun.cloudflare.com:3478".to_string(),
            ],
        }
    }
}

fn channel_init(config: &ChannelConfig) -> RTCDataChannelInit {
    RTCDataChannelInit {
        ordered: Some(config.ordered),
        max_retransmits: config.max_retransmits,
        ..Default::default()
    }
}

fn channel_for_label(label: &str) -> ChannelKind {
    if label == DEFAULT_CHANNEL_LABEL {
        ChannelKind::Default
    } else {
        ChannelKind::Guaranteed
    }
}

fn ice_state(state: RTCIceConnectionState) -> Option<IceConnectionState> {
    match state {
        RTCIceConnectionState::New => Some(IceConnectionState::New),
        RTCIceConnectionState::Checking => Some(IceConnectionState::Checking),
        RTCIceConnectionState::Connected => Some(IceConnectionState::Connected),
        RTCIceConnectionState::Completed => Some(IceConnectionState::Completed),
        RTCIceConnectionState::Disconnected => Some(IceConnectionState::Disconnected),
        RTCIceConnectionState::Failed => Some(IceConnectionState::Failed),
        RTCIceConnectionState::Closed => Some(IceConnectionState::Closed),
        _ => None,
    }
}

fn new_session_id() -> String {
    format!("{:016x}", rand::rng().random::<u64>())
}

async fn new_peer_connection(config: &WebRtcConfig) -> Result<RTCPeerConnection, TransportError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(negotiation_error)?;
    let registry =
        register_default_interceptors(Registry::new(), &mut media_engine).map_err(negotiation_error)?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let ice_servers = if config.ice_servers.is_empty() {
        Vec::new()
    } else {
        vec![RTCIceServer {
            urls: config.ice_servers.clone(),
            ..Default::default()
        }]
    };

    api.new_peer_connection(RTCConfiguration {
        ice_servers,
        ..Default::default()
    })
    .await
    .map_err(negotiation_error)
}

// ---------------------------------------------------------------------------
// Negotiation: SDP and candidate bookkeeping for one peer connection
// ---------------------------------------------------------------------------

struct Negotiation {
    pc: Arc<RTCPeerConnection>,
    /// Candidates that arrived before the remote description.
    queued: tokio::sync::Mutex<Vec<RTCIceCandidateInit>>,
}

impl Negotiation {
    async fn add_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), TransportError> {
        if self.pc.remote_description().await.is_some() {
            self.pc
                .add_ice_candidate(candidate)
                .await
                .map_err(negotiation_error)
        } else {
            self.queued.lock().await.push(candidate);
            Ok(())
        }
    }

    async fn set_remote(&self, description: RTCSessionDescription) -> Result<(), TransportError> {
        self.pc
            .set_remote_description(description)
            .await
            .map_err(negotiation_error)?;
        let queued: Vec<_> = self.queued.lock().await.drain(..).collect();
        for candidate in queued {
            self.pc
                .add_ice_candidate(candidate)
                .await
                .map_err(negotiation_error)?;
        }
        Ok(())
    }
}

/// `(remote peer id, session)`.
type Route = (String, String);

struct RtcShared<S: Signaler> {
    signaler: S,
    config: WebRtcConfig,
    routes: Mutex<HashMap<Route, Weak<Negotiation>>>,
}

impl<S: Signaler> RtcShared<S> {
    fn local_id(&self) -> &str {
        self.signaler.local_id()
    }

    fn register(&self, route: Route, negotiation: &Arc<Negotiation>) {
        let mut routes = lock(&self.routes);
        routes.retain(|_, weak| weak.strong_count() > 0);
        routes.insert(route, Arc::downgrade(negotiation));
    }

    fn route(&self, route: &Route) -> Option<Arc<Negotiation>> {
        lock(&self.routes).get(route).and_then(Weak::upgrade)
    }

    async fn signal(&self, to: &str, session: &str, body: SignalBody) -> Result<(), TransportError> {
        let signal = Signal {
            from: self.local_id().to_string(),
            session: session.to_string(),
            body,
        };
        self.signaler.send(to, signal).await
    }
}

// ---------------------------------------------------------------------------
// WebRtcTransport
// ---------------------------------------------------------------------------

/// A [`PeerTransport`] over WebRTC data channels.
///
/// The local id is the signaler's. A background task answers inbound
/// offers and routes answers and candidates to pending connections; it is
/// stopped when the transport is dropped.
pub struct WebRtcTransport<S: Signaler> {
    shared: Arc<RtcShared<S>>,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<WebRtcConnection>>,
    pump: JoinHandle<()>,
}

impl<S: Signaler> WebRtcTransport<S> {
    /// Starts listening for offers on `signaler`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(signaler: S, config: WebRtcConfig) -> Self {
        let shared = Arc::new(RtcShared {
            signaler,
            config,
            routes: Mutex::new(HashMap::new()),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let pump = tokio::spawn(pump_signals(Arc::clone(&shared), tx));

        tracing::debug!(local_id = %shared.local_id(), "webrtc transport started");
        Self {
            shared,
            incoming: tokio::sync::Mutex::new(rx),
            pump,
        }
    }
}

impl<S: Signaler> Drop for WebRtcTransport<S> {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

impl<S: Signaler> PeerTransport for WebRtcTransport<S> {
    type Connection = WebRtcConnection;

    fn local_id(&self) -> &str {
        self.shared.local_id()
    }

    async fn connect(
        &self,
        remote_id: &str,
        guaranteed: &ChannelConfig,
    ) -> Result<WebRtcConnection, TransportError> {
        let session = new_session_id();
        let conn = open_connection(&self.shared, remote_id, &session, Direction::Outbound).await?;
        let pc = &conn.negotiation.pc;

        let default = pc
            .create_data_channel(
                DEFAULT_CHANNEL_LABEL,
                Some(channel_init(&ChannelConfig::best_effort())),
            )
            .await
            .map_err(negotiation_error)?;
        conn.wire(&default, ChannelKind::Default);

        let reliable = pc
            .create_data_channel(&guaranteed.label, Some(channel_init(guaranteed)))
            .await
            .map_err(negotiation_error)?;
        conn.wire(&reliable, ChannelKind::Guaranteed);

        let offer = pc.create_offer(None).await.map_err(negotiation_error)?;
        pc.set_local_description(offer.clone())
            .await
            .map_err(negotiation_error)?;
        self.shared
            .signal(remote_id, &session, SignalBody::Offer { sdp: offer.sdp })
            .await?;

        tracing::debug!(
            local_id = %self.local_id(),
            %remote_id,
            %session,
            conn_id = %conn.id,
            "webrtc offer sent"
        );
        Ok(conn)
    }

    async fn accept(&self) -> Option<WebRtcConnection> {
        self.incoming.lock().await.recv().await
    }
}

/// Creates a peer connection for `remote_id`, registers it for signaling
/// and hooks its callbacks up to a fresh event stream.
async fn open_connection<S: Signaler>(
    shared: &Arc<RtcShared<S>>,
    remote_id: &str,
    session: &str,
    direction: Direction,
) -> Result<WebRtcConnection, TransportError> {
    let pc = Arc::new(new_peer_connection(&shared.config).await?);
    let negotiation = Arc::new(Negotiation {
        pc: Arc::clone(&pc),
        queued: tokio::sync::Mutex::new(Vec::new()),
    });
    shared.register((remote_id.to_string(), session.to_string()), &negotiation);

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let channels = Arc::new(Mutex::new(Channels::default()));

    let tx = events_tx.clone();
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        let tx = tx.clone();
        Box::pin(async move {
            if let Some(state) = ice_state(state) {
                let _ = tx.send(ConnectionEvent::IceStateChanged(state));
            }
        })
    }));

    let signaling = Arc::downgrade(shared);
    let (remote, sess) = (remote_id.to_string(), session.to_string());
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let signaling = signaling.clone();
        let (remote, sess) = (remote.clone(), sess.clone());
        Box::pin(async move {
            // `None` marks the end of gathering.
            let (Some(candidate), Some(shared)) = (candidate, signaling.upgrade()) else {
                return;
            };
            let init = match candidate.to_json() {
                Ok(init) => init,
                Err(e) => {
                    tracing::debug!(error = %e, "unserializable ice candidate");
                    return;
                }
            };
            let body = SignalBody::Candidate {
                candidate: init.candidate,
                sdp_mid: init.sdp_mid,
                sdp_mline_index: init.sdp_mline_index,
            };
            if let Err(e) = shared.signal(&remote, &sess, body).await {
                tracing::debug!(remote_id = %remote, error = %e, "candidate not delivered");
            }
        })
    }));

    let (tx, slots) = (events_tx.clone(), Arc::clone(&channels));
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        let (tx, slots) = (tx.clone(), Arc::clone(&slots));
        Box::pin(async move {
            let kind = channel_for_label(dc.label());
            wire_channel(&dc, kind, &slots, &tx);
        })
    }));

    Ok(WebRtcConnection {
        id: ConnectionId::new(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)),
        remote_id: remote_id.to_string(),
        direction,
        negotiation,
        channels,
        events_tx,
        events: tokio::sync::Mutex::new(events_rx),
        closed: AtomicBool::new(false),
    })
}

async fn pump_signals<S: Signaler>(
    shared: Arc<RtcShared<S>>,
    incoming: mpsc::UnboundedSender<WebRtcConnection>,
) {
    let mut early: HashMap<Route, Vec<RTCIceCandidateInit>> = HashMap::new();

    while let Some(signal) = shared.signaler.recv().await {
        let (from, session, kind) = (
            signal.from.clone(),
            signal.session.clone(),
            signal.body.kind(),
        );
        if let Err(e) = handle_signal(&shared, &incoming, &mut early, signal).await {
            tracing::warn!(remote_id = %from, %session, kind, error = %e, "signal handling failed");
        }
    }
    tracing::debug!(local_id = %shared.local_id(), "signaling closed");
}

async fn handle_signal<S: Signaler>(
    shared: &Arc<RtcShared<S>>,
    incoming: &mpsc::UnboundedSender<WebRtcConnection>,
    early: &mut HashMap<Route, Vec<RTCIceCandidateInit>>,
    signal: Signal,
) -> Result<(), TransportError> {
    let route: Route = (signal.from, signal.session);

    match signal.body {
        SignalBody::Offer { sdp } => {
            let conn = open_connection(shared, &route.0, &route.1, Direction::Inbound).await?;
            let negotiation = Arc::clone(&conn.negotiation);
            for candidate in early.remove(&route).unwrap_or_default() {
                negotiation.add_candidate(candidate).await?;
            }
            negotiation
                .set_remote(RTCSessionDescription::offer(sdp).map_err(negotiation_error)?)
                .await?;

            let answer = negotiation
                .pc
                .create_answer(None)
                .await
                .map_err(negotiation_error)?;
            negotiation
                .pc
                .set_local_description(answer.clone())
                .await
                .map_err(negotiation_error)?;
            shared
                .signal(&route.0, &route.1, SignalBody::Answer { sdp: answer.sdp })
                .await?;

            tracing::debug!(remote_id = %route.0, session = %route.1, conn_id = %conn.id, "webrtc offer answered");
            if incoming.send(conn).is_err() {
                tracing::debug!("transport dropped, inbound connection discarded");
            }
        }
        SignalBody::Answer { sdp } => {
            let Some(negotiation) = shared.route(&route) else {
                tracing::debug!(remote_id = %route.0, session = %route.1, "answer for unknown session");
                return Ok(());
            };
            negotiation
                .set_remote(RTCSessionDescription::answer(sdp).map_err(negotiation_error)?)
                .await?;
        }
        SignalBody::Candidate {
            candidate,
            sdp_mid,
            sdp_mline_index,
        } => {
            let init = RTCIceCandidateInit {
                candidate,
                sdp_mid,
                sdp_mline_index,
                ..Default::default()
            };
            match shared.route(&route) {
                Some(negotiation) => negotiation.add_candidate(init).await?,
                None => {
                    if !early.contains_key(&route) && early.len() >= MAX_EARLY_SESSIONS {
                        early.clear();
                    }
                    early.entry(route).or_default().push(init);
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// WebRtcConnection
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Channels {
    default: Option<Arc<RTCDataChannel>>,
    guaranteed: Option<Arc<RTCDataChannel>>,
}

impl Channels {
    fn slot(&mut self, kind: ChannelKind) -> &mut Option<Arc<RTCDataChannel>> {
        match kind {
            ChannelKind::Default => &mut self.default,
            ChannelKind::Guaranteed => &mut self.guaranteed,
        }
    }

    fn open(&mut self, kind: ChannelKind) -> Option<Arc<RTCDataChannel>> {
        self.slot(kind)
            .as_ref()
            .filter(|dc| dc.ready_state() == RTCDataChannelState::Open)
            .cloned()
    }
}

/// Stores `dc` as the `kind` channel and forwards its callbacks as
/// connection events.
fn wire_channel(
    dc: &Arc<RTCDataChannel>,
    kind: ChannelKind,
    channels: &Arc<Mutex<Channels>>,
    events: &mpsc::UnboundedSender<ConnectionEvent>,
) {
    *lock(channels).slot(kind) = Some(Arc::clone(dc));

    let tx = events.clone();
    dc.on_open(Box::new(move || {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(ConnectionEvent::ChannelOpen(kind));
        })
    }));

    let tx = events.clone();
    dc.on_close(Box::new(move || {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(ConnectionEvent::ChannelClosed(kind));
        })
    }));

    let tx = events.clone();
    dc.on_error(Box::new(move |e: webrtc::Error| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(ConnectionEvent::ChannelError(kind, e.to_string()));
        })
    }));

    let tx = events.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(ConnectionEvent::Message {
                channel: kind,
                data: msg.data.to_vec(),
            });
        })
    }));

    // A remote-created channel can already be open when it is handed over.
    // Opening twice is harmless to consumers.
    if dc.ready_state() == RTCDataChannelState::Open {
        let _ = events.send(ConnectionEvent::ChannelOpen(kind));
    }
}

/// One WebRTC peer connection with its two data channels.
pub struct WebRtcConnection {
    id: ConnectionId,
    remote_id: String,
    direction: Direction,
    negotiation: Arc<Negotiation>,
    channels: Arc<Mutex<Channels>>,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<ConnectionEvent>>,
    closed: AtomicBool,
}

impl WebRtcConnection {
    fn wire(&self, dc: &Arc<RTCDataChannel>, kind: ChannelKind) {
        wire_channel(dc, kind, &self.channels, &self.events_tx);
    }
}

impl PeerConnection for WebRtcConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn remote_id(&self) -> &str {
        &self.remote_id
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn is_open(&self, channel: ChannelKind) -> bool {
        !self.closed.load(Ordering::Acquire) && lock(&self.channels).open(channel).is_some()
    }

    async fn send(&self, channel: ChannelKind, data: &[u8]) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::ChannelClosed(channel));
        }
        let dc = lock(&self.channels)
            .open(channel)
            .ok_or(TransportError::ChannelClosed(channel))?;
        dc.send(&Bytes::copy_from_slice(data))
            .await
            .map(|_| ())
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn next_event(&self) -> Option<ConnectionEvent> {
        self.events.lock().await.recv().await
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.negotiation.pc.close().await {
            tracing::debug!(conn_id = %self.id, error = %e, "peer connection close failed");
        }
        // The stack may not report `closed` for a connection that never
        // got past checking.
        let _ = self
            .events_tx
            .send(ConnectionEvent::IceStateChanged(IceConnectionState::Closed));
        tracing::debug!(conn_id = %self.id, remote_id = %self.remote_id, "webrtc connection closed");
    }
}

impl Drop for WebRtcConnection {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let pc = Arc::clone(&self.negotiation.pc);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                let _ = pc.close().await;
            });
        }
    }
}
