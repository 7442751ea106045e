//! Test harness for session, registry and signaling tests
//!
//! Sessions are driven through a scripted transport: tests decide when the
//! offer is rejected, when tracks arrive and which connection states are
//! reported. Sinks and capture sources count how often they are started and
//! released.

#![allow(dead_code)]

pub mod media;

use async_trait::async_trait;
use mirrorcast_webrtc::config::ServerConfig;
use mirrorcast_webrtc::media::{CaptureProvider, CaptureSource, MediaSink, RelaySubscription};
use mirrorcast_webrtc::session::{Session, SessionId, SessionParts, SessionRegistry};
use mirrorcast_webrtc::signaling::SignalingService;
use mirrorcast_webrtc::transport::{
    ConnectionState, InboundTrack, PeerTransport, StateChangeHandler, TrackHandler,
    TransportFactory,
};
use mirrorcast_webrtc::{Error, Result, TrackKind, TrackRelay};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_PCMU, MIME_TYPE_VP8};
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Initialize tracing for tests (call once per test)
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,webrtc=warn")
        .try_init();
}

// =============================================================================
// SDP fixtures
// =============================================================================

pub const VIDEO_ONLY_OFFER: &str = "v=0\r\n\
    o=- 4215775240449105457 2 IN IP4 127.0.0.1\r\n\
    s=-\r\n\
    t=0 0\r\n\
    m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
    c=IN IP4 0.0.0.0\r\n\
    a=mid:0\r\n\
    a=rtpmap:96 VP8/90000\r\n\
    a=sendrecv\r\n";

pub const AUDIO_VIDEO_OFFER: &str = "v=0\r\n\
    o=- 4215775240449105457 2 IN IP4 127.0.0.1\r\n\
    s=-\r\n\
    t=0 0\r\n\
    m=audio 9 UDP/TLS/RTP/SAVPF 111 0\r\n\
    c=IN IP4 0.0.0.0\r\n\
    a=mid:0\r\n\
    a=rtpmap:111 opus/48000/2\r\n\
    a=rtpmap:0 PCMU/8000\r\n\
    a=sendrecv\r\n\
    m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
    c=IN IP4 0.0.0.0\r\n\
    a=mid:1\r\n\
    a=rtpmap:96 VP8/90000\r\n\
    a=sendrecv\r\n";

pub const DATA_ONLY_OFFER: &str = "v=0\r\n\
    o=- 4215775240449105457 2 IN IP4 127.0.0.1\r\n\
    s=-\r\n\
    t=0 0\r\n\
    m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n\
    c=IN IP4 0.0.0.0\r\n\
    a=mid:0\r\n\
    a=sctp-port:5000\r\n";

const SCRIPTED_ANSWER: &str = "v=0\r\n\
    o=- 1 1 IN IP4 127.0.0.1\r\n\
    s=-\r\n\
    t=0 0\r\n";

pub fn offer(sdp: &str) -> RTCSessionDescription {
    RTCSessionDescription::offer(sdp.to_string()).expect("valid offer")
}

// =============================================================================
// Scripted transport
// =============================================================================

/// Transport whose events are fired by the test
#[derive(Default)]
pub struct ScriptedTransport {
    state_handler: Mutex<Option<StateChangeHandler>>,
    track_handler: Mutex<Option<TrackHandler>>,
    outbound: Mutex<Vec<String>>,
    close_calls: AtomicUsize,
    reject_offer: AtomicBool,
    stall_offer: AtomicBool,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A transport that refuses every offer
    pub fn rejecting() -> Arc<Self> {
        let transport = Self::default();
        transport.reject_offer.store(true, Ordering::SeqCst);
        Arc::new(transport)
    }

    /// A transport that never finishes applying an offer
    pub fn stalling() -> Arc<Self> {
        let transport = Self::default();
        transport.stall_offer.store(true, Ordering::SeqCst);
        Arc::new(transport)
    }

    pub fn fire_state(&self, state: ConnectionState) {
        if let Some(handler) = self.state_handler.lock().as_ref() {
            handler(state);
        }
    }

    pub fn fire_track(&self, track: Arc<dyn InboundTrack>) {
        if let Some(handler) = self.track_handler.lock().as_ref() {
            handler(track);
        }
    }

    /// IDs of the outbound tracks added so far
    pub fn outbound_tracks(&self) -> Vec<String> {
        self.outbound.lock().clone()
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerTransport for ScriptedTransport {
    async fn accept_remote(&self, _offer: RTCSessionDescription) -> Result<()> {
        if self.stall_offer.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.reject_offer.load(Ordering::SeqCst) {
            return Err(Error::Negotiation("offer rejected by transport".to_string()));
        }
        Ok(())
    }

    async fn create_local_answer(&self) -> Result<RTCSessionDescription> {
        RTCSessionDescription::answer(SCRIPTED_ANSWER.to_string()).map_err(Error::from)
    }

    fn on_state_change(&self, handler: StateChangeHandler) {
        *self.state_handler.lock() = Some(handler);
    }

    fn on_track(&self, handler: TrackHandler) {
        *self.track_handler.lock() = Some(handler);
    }

    async fn add_outbound_track(&self, track: Arc<dyn TrackLocal + Send + Sync>) -> Result<()> {
        self.outbound.lock().push(track.id().to_string());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        // A real peer connection reports `closed` from inside close()
        self.fire_state(ConnectionState::Closed);
        Ok(())
    }
}

/// Factory handing out scripted transports and remembering them
#[derive(Default)]
pub struct ScriptedFactory {
    transports: Mutex<Vec<Arc<ScriptedTransport>>>,
    reject_offers: bool,
}

impl ScriptedFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn rejecting() -> Arc<Self> {
        Arc::new(Self {
            reject_offers: true,
            ..Default::default()
        })
    }

    pub fn transports(&self) -> Vec<Arc<ScriptedTransport>> {
        self.transports.lock().clone()
    }
}

#[async_trait]
impl TransportFactory for ScriptedFactory {
    async fn create_connection(&self) -> Result<Arc<dyn PeerTransport>> {
        let transport = if self.reject_offers {
            ScriptedTransport::rejecting()
        } else {
            ScriptedTransport::new()
        };
        self.transports.lock().push(Arc::clone(&transport));
        Ok(transport)
    }
}

// =============================================================================
// Inbound tracks
// =============================================================================

/// Inbound track fed from a channel; dropping the sender ends the track
pub struct ChannelTrack {
    key: String,
    kind: TrackKind,
    codec: RTCRtpCodecCapability,
    rx: tokio::sync::Mutex<mpsc::Receiver<Packet>>,
}

#[async_trait]
impl InboundTrack for ChannelTrack {
    fn key(&self) -> String {
        self.key.clone()
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn codec(&self) -> RTCRtpCodecCapability {
        self.codec.clone()
    }

    async fn read_frame(&self) -> Result<Packet> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| Error::TransportFailure("track ended".to_string()))
    }
}

pub fn channel_track(key: &str, kind: TrackKind) -> (Arc<dyn InboundTrack>, mpsc::Sender<Packet>) {
    match kind {
        TrackKind::Audio => channel_track_with_codec(key, kind, MIME_TYPE_OPUS, 48_000),
        TrackKind::Video => channel_track_with_codec(key, kind, MIME_TYPE_VP8, 90_000),
    }
}

/// Channel-fed track negotiated with a specific codec
pub fn channel_track_with_codec(
    key: &str,
    kind: TrackKind,
    mime_type: &str,
    clock_rate: u32,
) -> (Arc<dyn InboundTrack>, mpsc::Sender<Packet>) {
    let codec = RTCRtpCodecCapability {
        mime_type: mime_type.to_string(),
        clock_rate,
        ..Default::default()
    };
    let (tx, rx) = mpsc::channel(64);
    let track = ChannelTrack {
        key: key.to_string(),
        kind,
        codec,
        rx: tokio::sync::Mutex::new(rx),
    };
    (Arc::new(track), tx)
}

// =============================================================================
// Counting sink and capture
// =============================================================================

/// Sink that keeps its subscriptions and counts calls
#[derive(Default)]
pub struct CountingSink {
    persistent: bool,
    rejected: Option<TrackKind>,
    pub start_calls: AtomicUsize,
    pub stop_calls: AtomicUsize,
    attached: Mutex<Vec<(TrackKind, RelaySubscription)>>,
}

impl CountingSink {
    pub fn recording() -> Arc<Self> {
        Arc::new(Self {
            persistent: true,
            ..Default::default()
        })
    }

    pub fn discarding() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Recording sink that cannot record tracks of `kind`
    pub fn rejecting(kind: TrackKind) -> Arc<Self> {
        Arc::new(Self {
            persistent: true,
            rejected: Some(kind),
            ..Default::default()
        })
    }

    pub fn stops(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    /// Number of attached tracks of a kind
    pub fn attached(&self, kind: TrackKind) -> usize {
        self.attached.lock().iter().filter(|(k, _)| *k == kind).count()
    }
}

#[async_trait]
impl MediaSink for CountingSink {
    async fn start(&self) -> Result<()> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn add_track(
        &self,
        kind: TrackKind,
        _codec: RTCRtpCodecCapability,
        subscription: RelaySubscription,
    ) -> Result<()> {
        if self.rejected == Some(kind) {
            return Err(Error::Sink(format!("cannot record {} tracks", kind)));
        }
        self.attached.lock().push((kind, subscription));
        Ok(())
    }

    async fn stop(&self) {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.attached.lock().clear();
    }

    fn is_persistent(&self) -> bool {
        self.persistent
    }
}

/// Capture source that only counts calls
pub struct CountingCapture {
    track: Arc<TrackLocalStaticSample>,
    pub start_calls: AtomicUsize,
    pub stop_calls: AtomicUsize,
}

impl CountingCapture {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            track: Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_PCMU.to_string(),
                    clock_rate: 8_000,
                    ..Default::default()
                },
                "audio-capture".to_string(),
                "test".to_string(),
            )),
            start_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
        })
    }

    pub fn starts(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CaptureSource for CountingCapture {
    fn track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        Arc::clone(&self.track) as Arc<dyn TrackLocal + Send + Sync>
    }

    async fn start(&self) -> Result<()> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// Provider handing out counting captures, or none at all
#[derive(Default)]
pub struct CountingCaptureProvider {
    unavailable: bool,
    opened: Mutex<Vec<Arc<CountingCapture>>>,
}

impl CountingCaptureProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn unavailable() -> Arc<Self> {
        Arc::new(Self {
            unavailable: true,
            ..Default::default()
        })
    }

    pub fn opened(&self) -> Vec<Arc<CountingCapture>> {
        self.opened.lock().clone()
    }
}

impl CaptureProvider for CountingCaptureProvider {
    fn open(&self, _label: &str) -> Result<Arc<dyn CaptureSource>> {
        if self.unavailable {
            return Err(Error::CaptureUnavailable("no test capture".to_string()));
        }
        let capture = CountingCapture::new();
        self.opened.lock().push(Arc::clone(&capture));
        Ok(capture)
    }
}

// =============================================================================
// Session fixtures
// =============================================================================

/// A session wired to scripted collaborators
pub struct SessionFixture {
    pub session: Session,
    pub transport: Arc<ScriptedTransport>,
    pub capture: Arc<CountingCapture>,
    pub sink: Arc<CountingSink>,
    pub relay: TrackRelay,
}

impl SessionFixture {
    pub async fn create(registry: &SessionRegistry, sink: Arc<CountingSink>) -> Result<Self> {
        Self::with_transport(registry, ScriptedTransport::new(), sink).await
    }

    pub async fn with_transport(
        registry: &SessionRegistry,
        transport: Arc<ScriptedTransport>,
        sink: Arc<CountingSink>,
    ) -> Result<Self> {
        let capture = CountingCapture::new();
        let relay = TrackRelay::new(Default::default());
        let session = Session::create(
            SessionId::new(),
            SessionParts {
                transport: Arc::clone(&transport) as Arc<dyn PeerTransport>,
                capture: Some(Arc::clone(&capture) as Arc<dyn CaptureSource>),
                sink: Arc::clone(&sink) as Arc<dyn MediaSink>,
                relay: relay.clone(),
                registry: registry.clone(),
            },
        )
        .await?;

        Ok(Self {
            session,
            transport,
            capture,
            sink,
            relay,
        })
    }

    /// Create a session and negotiate the given offer
    pub async fn connected(
        registry: &SessionRegistry,
        sink: Arc<CountingSink>,
        sdp: &str,
    ) -> Self {
        let fixture = Self::create(registry, sink).await.expect("session created");
        fixture
            .session
            .accept_offer(offer(sdp))
            .await
            .expect("offer accepted");
        fixture
    }
}

/// Signaling service over scripted collaborators
pub fn signaling_service(
    config: ServerConfig,
    factory: Arc<ScriptedFactory>,
    capture: Arc<CountingCaptureProvider>,
) -> Arc<SignalingService> {
    Arc::new(SignalingService::new(
        config,
        factory,
        capture,
        SessionRegistry::new(),
    ))
}

/// Poll `condition` until it holds or `timeout` expires
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Run `future` with a timeout, panicking when it expires
pub async fn within<T>(timeout: Duration, future: impl Future<Output = T>) -> T {
    tokio::time::timeout(timeout, future)
        .await
        .expect("operation timed out")
}
