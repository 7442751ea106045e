//! Session lifecycle and track routing
//!
//! A [`Session`] owns one transport, its capture source and its sink. Transport
//! callbacks only enqueue [`SessionEvent`]s; a single task per session applies
//! them in order, so state changes are seen in the order the transport reports
//! them and teardown can be triggered from inside a callback without
//! re-entering the transport.

use super::registry::SessionRegistry;
use crate::media::{
    accepts_capture_codec, preferred_video_codec, CaptureSource, MediaSink, OfferedMedia,
    RelaySubscription, TrackKind, TrackRelay,
};
use crate::transport::{ConnectionState, InboundTrack, PeerTransport};
use crate::{Error, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};

/// Unique session identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a new random session ID
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Signaling state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Resources attached and registered, no offer yet
    Created,
    /// Remote offer being applied and answered
    Negotiating,
    /// Answer returned; reacting to tracks and state changes
    Connected,
    /// Teardown in progress
    Closing,
    /// Released after an orderly close
    Closed,
    /// Released after a negotiation or transport failure
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Created => "created",
            SessionState::Negotiating => "negotiating",
            SessionState::Connected => "connected",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Where an inbound track was routed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteTarget {
    /// Sent back to the remote peer (capture substitute for audio)
    Loopback,
    /// Attached to the session's sink
    Sink,
}

/// One routing decision taken for an inbound track
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Route {
    pub kind: TrackKind,
    pub target: RouteTarget,
    pub track_key: String,
}

/// Event raised by the transport or a relayed track
pub enum SessionEvent {
    StateChanged(ConnectionState),
    Track(Arc<dyn InboundTrack>),
    TrackEnded(String),
}

impl fmt::Debug for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEvent::StateChanged(state) => write!(f, "StateChanged({})", state),
            SessionEvent::Track(track) => write!(f, "Track({} {})", track.kind(), track.key()),
            SessionEvent::TrackEnded(key) => write!(f, "TrackEnded({})", key),
        }
    }
}

/// Resources a session takes ownership of
pub struct SessionParts {
    pub transport: Arc<dyn PeerTransport>,
    /// `None` when the capture source is unavailable; audio loopback is skipped
    pub capture: Option<Arc<dyn CaptureSource>>,
    pub sink: Arc<dyn MediaSink>,
    pub relay: TrackRelay,
    pub registry: SessionRegistry,
}

/// Outbound tracks prepared from the offer before answering
#[derive(Default)]
struct Loopback {
    video: VecDeque<Arc<TrackLocalStaticRTP>>,
    audio: bool,
}

/// One client connection
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    id: SessionId,
    transport: Arc<dyn PeerTransport>,
    capture: Mutex<Option<Arc<dyn CaptureSource>>>,
    sink: Arc<dyn MediaSink>,
    relay: TrackRelay,
    registry: SessionRegistry,
    state: Mutex<SessionState>,
    connection_state: Mutex<ConnectionState>,
    routes: Mutex<Vec<Route>>,
    loopback: Mutex<Loopback>,
    events: mpsc::UnboundedSender<SessionEvent>,
    cancel: CancellationToken,
    teardown: OnceCell<()>,
}

impl Session {
    /// Build a session, wire its transport callbacks and register it.
    ///
    /// Fails with [`Error::ShuttingDown`] when the registry no longer accepts
    /// sessions; the parts are released before returning.
    pub async fn create(id: SessionId, parts: SessionParts) -> Result<Self> {
        let (events, rx) = mpsc::unbounded_channel();

        let inner = Arc::new(SessionInner {
            id,
            transport: parts.transport,
            capture: Mutex::new(parts.capture),
            sink: parts.sink,
            relay: parts.relay,
            registry: parts.registry,
            state: Mutex::new(SessionState::Created),
            connection_state: Mutex::new(ConnectionState::New),
            routes: Mutex::new(Vec::new()),
            loopback: Mutex::new(Loopback::default()),
            events,
            cancel: CancellationToken::new(),
            teardown: OnceCell::new(),
        });

        let tx = inner.events.clone();
        inner.transport.on_state_change(Box::new(move |state| {
            let _ = tx.send(SessionEvent::StateChanged(state));
        }));
        let tx = inner.events.clone();
        inner.transport.on_track(Box::new(move |track| {
            let _ = tx.send(SessionEvent::Track(track));
        }));

        tokio::spawn(run_events(Arc::clone(&inner), rx));

        let session = Session { inner };
        if let Err(e) = session.inner.registry.register(session.clone()) {
            session.inner.teardown(SessionState::Closed).await;
            return Err(e);
        }

        info!(
            "[{}] Session created (capture: {}, recording: {})",
            session.id(),
            session.inner.capture.lock().is_some(),
            session.is_recording()
        );
        Ok(session)
    }

    pub fn id(&self) -> &SessionId {
        &self.inner.id
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.lock()
    }

    /// Last state reported by the transport
    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.connection_state.lock()
    }

    /// Routing decisions taken so far
    pub fn routes(&self) -> Vec<Route> {
        self.inner.routes.lock().clone()
    }

    /// Whether inbound media is persisted
    pub fn is_recording(&self) -> bool {
        self.inner.sink.is_persistent()
    }

    /// Apply the remote offer and produce the local answer.
    ///
    /// Any failure tears the session down; a failed session cannot be reused.
    pub async fn accept_offer(&self, offer: RTCSessionDescription) -> Result<RTCSessionDescription> {
        {
            let mut state = self.inner.state.lock();
            if *state != SessionState::Created {
                return Err(Error::Negotiation(format!(
                    "session {} cannot accept an offer while {}",
                    self.inner.id, *state
                )));
            }
            *state = SessionState::Negotiating;
        }
        debug!("[{}] Negotiating", self.inner.id);

        let result = tokio::select! {
            biased;
            _ = self.inner.cancel.cancelled() => Err(self.inner.interrupted()),
            result = self.inner.negotiate(offer) => result,
        };

        match result {
            Ok(answer) => {
                let mut state = self.inner.state.lock();
                if *state != SessionState::Negotiating {
                    let current = *state;
                    drop(state);
                    debug!("[{}] Answer discarded, session is {}", self.inner.id, current);
                    return Err(self.inner.interrupted());
                }
                *state = SessionState::Connected;
                drop(state);

                info!("[{}] Answer ready, session connected", self.inner.id);
                Ok(answer)
            }
            Err(e) => {
                warn!("[{}] Negotiation failed: {}", self.inner.id, e);
                self.inner.teardown(SessionState::Failed).await;
                Err(e)
            }
        }
    }

    /// Close the session and release everything it owns.
    ///
    /// Safe to call any number of times from any task; every caller returns
    /// once the release has completed.
    pub async fn close(&self) {
        self.inner.teardown(SessionState::Closed).await;
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("connection_state", &self.connection_state())
            .finish()
    }
}

async fn run_events(inner: Arc<SessionInner>, mut rx: mpsc::UnboundedReceiver<SessionEvent>) {
    loop {
        let event = tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        debug!("[{}] Event {:?}", inner.id, event);
        inner.handle_event(event).await;
    }
    debug!("[{}] Event loop finished", inner.id);
}

impl SessionInner {
    /// Error for a negotiation cut short by teardown
    fn interrupted(&self) -> Error {
        if self.registry.is_closing() {
            Error::ShuttingDown
        } else {
            Error::Negotiation(format!("session {} closed during negotiation", self.id))
        }
    }

    async fn negotiate(&self, offer: RTCSessionDescription) -> Result<RTCSessionDescription> {
        let media = OfferedMedia::parse(&offer)?;
        if !media.has_media() {
            return Err(Error::Negotiation(
                "offer contains no audio or video".to_string(),
            ));
        }

        self.prepare_loopback(&media).await?;
        self.transport.accept_remote(offer).await?;
        self.transport.create_local_answer().await
    }

    /// Add the outbound tracks inbound media will be looped back on
    async fn prepare_loopback(&self, media: &OfferedMedia) -> Result<()> {
        let capture = self.capture.lock().clone();
        let mut video = VecDeque::new();
        let mut audio = false;

        for section in media.sections() {
            match section.kind {
                Some(TrackKind::Video) => {
                    let Some(codec) = preferred_video_codec(section) else {
                        warn!(
                            "[{}] No loopback codec among {:?}",
                            self.id, section.codecs
                        );
                        continue;
                    };
                    let track = Arc::new(TrackLocalStaticRTP::new(
                        codec,
                        format!("video-loopback-{}", video.len()),
                        format!("mirrorcast-{}", self.id),
                    ));
                    self.transport
                        .add_outbound_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
                        .await?;
                    video.push_back(track);
                }
                Some(TrackKind::Audio) if !audio => match &capture {
                    Some(capture) if accepts_capture_codec(section) => {
                        self.transport.add_outbound_track(capture.track()).await?;
                        audio = true;
                    }
                    Some(_) => {
                        info!(
                            "[{}] Offer has no PCMU, audio loopback disabled",
                            self.id
                        );
                    }
                    None => {
                        info!("[{}] No capture source, audio loopback disabled", self.id);
                    }
                },
                _ => {}
            }
        }

        debug!(
            "[{}] Prepared {} video loopback track(s), audio loopback: {}",
            self.id,
            video.len(),
            audio
        );

        let mut loopback = self.loopback.lock();
        loopback.video = video;
        loopback.audio = audio;
        Ok(())
    }

    async fn handle_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::StateChanged(state) => {
                *self.connection_state.lock() = state;
                info!("[{}] Connection state is {}", self.id, state);
                match state {
                    ConnectionState::Failed => self.teardown(SessionState::Failed).await,
                    ConnectionState::Closed => self.teardown(SessionState::Closed).await,
                    ConnectionState::Disconnected => {
                        warn!("[{}] Connection interrupted", self.id);
                    }
                    _ => {}
                }
            }
            SessionEvent::Track(track) => self.route_track(track).await,
            SessionEvent::TrackEnded(key) => {
                info!("[{}] Track {} ended", self.id, key);
                self.sink.stop().await;
            }
        }
    }

    async fn route_track(&self, track: Arc<dyn InboundTrack>) {
        if self.cancel.is_cancelled() {
            return;
        }

        let kind = track.kind();
        let key = track.key();
        info!("[{}] Track {} received ({})", self.id, kind, key);

        match kind {
            TrackKind::Audio => {
                let capture = if self.loopback.lock().audio {
                    self.capture.lock().clone()
                } else {
                    None
                };
                if let Some(capture) = capture {
                    match capture.start().await {
                        Ok(()) => self.record_route(kind, RouteTarget::Loopback, &key),
                        Err(e) => warn!("[{}] Audio loopback unavailable: {}", self.id, e),
                    }
                }

                let subscription = self.relay.subscribe(Arc::clone(&track));
                let ended = subscription.end_signal();
                if self.attach_to_sink(kind, &track, subscription).await {
                    self.watch_track_end(ended, key);
                }
            }
            TrackKind::Video => {
                let outbound = self.loopback.lock().video.pop_front();
                let mut watched = false;
                match outbound {
                    Some(outbound) => {
                        let subscription = self.relay.subscribe(Arc::clone(&track));
                        self.watch_track_end(subscription.end_signal(), key.clone());
                        watched = true;
                        self.spawn_forward(subscription, outbound);
                        self.record_route(kind, RouteTarget::Loopback, &key);
                    }
                    None => warn!("[{}] No loopback track left for {}", self.id, key),
                }

                if self.sink.is_persistent() {
                    let subscription = self.relay.subscribe(Arc::clone(&track));
                    let ended = subscription.end_signal();
                    if self.attach_to_sink(kind, &track, subscription).await && !watched {
                        self.watch_track_end(ended, key);
                    }
                }
            }
        }
    }

    /// Hand a subscription to the sink. A rejected track is logged and
    /// dropped; the session and the sink's other tracks carry on.
    async fn attach_to_sink(
        &self,
        kind: TrackKind,
        track: &Arc<dyn InboundTrack>,
        subscription: RelaySubscription,
    ) -> bool {
        let key = subscription.key().to_string();
        match self.sink.add_track(kind, track.codec(), subscription).await {
            Ok(()) => {
                self.record_route(kind, RouteTarget::Sink, &key);
                true
            }
            Err(e) => {
                warn!("[{}] Not recording {} track {}: {}", self.id, kind, key, e);
                false
            }
        }
    }

    fn record_route(&self, kind: TrackKind, target: RouteTarget, key: &str) {
        debug!("[{}] Routed {} track {} to {:?}", self.id, kind, key, target);
        self.routes.lock().push(Route {
            kind,
            target,
            track_key: key.to_string(),
        });
    }

    /// Raise `TrackEnded` once the relayed upstream reaches end of stream
    fn watch_track_end(&self, ended: CancellationToken, key: String) {
        let cancel = self.cancel.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = ended.cancelled() => {
                    let _ = events.send(SessionEvent::TrackEnded(key));
                }
            }
        });
    }

    /// Copy relayed frames onto an outbound loopback track
    fn spawn_forward(&self, mut subscription: RelaySubscription, outbound: Arc<TrackLocalStaticRTP>) {
        let cancel = self.cancel.clone();
        let id = self.id.clone();
        tokio::spawn(async move {
            let mut forwarded: u64 = 0;
            loop {
                let frame = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    frame = subscription.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                };
                if let Err(e) = outbound.write_rtp(&frame).await {
                    debug!("[{}] Loopback write failed: {}", id, e);
                    break;
                }
                forwarded += 1;
            }
            debug!(
                "[{}] Loopback for {} finished after {} frames ({} dropped)",
                id,
                subscription.key(),
                forwarded,
                subscription.dropped_frames()
            );
        });
    }

    async fn teardown(&self, final_state: SessionState) {
        self.teardown
            .get_or_init(|| self.release(final_state))
            .await;
    }

    /// Runs exactly once per session.
    ///
    /// The session stays registered until everything is released so
    /// `close_all` also waits for sessions already tearing themselves down.
    async fn release(&self, final_state: SessionState) {
        let previous = std::mem::replace(&mut *self.state.lock(), SessionState::Closing);
        info!(
            "[{}] Tearing down ({} -> {})",
            self.id, previous, final_state
        );

        self.cancel.cancel();

        if let Err(e) = self.transport.close().await {
            error!("[{}] Failed to close transport: {}", self.id, e);
        }
        self.sink.stop().await;

        let capture = self.capture.lock().take();
        if let Some(capture) = capture {
            capture.stop().await;
        }

        let mut loopback = self.loopback.lock();
        loopback.video.clear();
        loopback.audio = false;
        drop(loopback);

        self.registry.unregister(&self.id);
        *self.state.lock() = final_state;
        info!("[{}] Session released ({})", self.id, final_state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_is_unique() {
        let a = SessionId::new();
        let b = SessionId::new();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
    }

    #[test]
    fn test_terminal_states() {
        assert!(SessionState::Closed.is_terminal());
        assert!(SessionState::Failed.is_terminal());
        assert!(!SessionState::Closing.is_terminal());
        assert!(!SessionState::Connected.is_terminal());
        assert_eq!(SessionState::Negotiating.to_string(), "negotiating");
    }
}
