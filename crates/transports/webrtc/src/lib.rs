//! WebRTC loopback sessions with HTTP signaling
//!
//! A browser posts an offer, the server answers it and then mirrors the
//! browser's media back: inbound video is relayed straight back to the sender,
//! inbound audio is answered with a local capture source, and both can be
//! recorded to disk.
//!
//! # Features
//!
//! - **Signaling**: single-shot offer/answer over POST /offer
//! - **Track relay**: one upstream read per inbound track, fanned out to
//!   bounded per-consumer queues
//! - **Recording**: Ogg/IVF/H.264 files per track, or a discard-only sink
//! - **Lifecycle**: per-session state machine with exactly-once teardown and
//!   bulk shutdown through the session registry
//!
//! # Usage
//!
//! ```ignore
//! use mirrorcast_webrtc::{
//!     router, ConfiguredCapture, ServerConfig, SessionRegistry, SignalingService,
//!     WebRtcTransportFactory,
//! };
//!
//! let config = ServerConfig::default();
//! let factory = Arc::new(WebRtcTransportFactory::new(&config)?);
//! let capture = Arc::new(ConfiguredCapture::new(config.capture.clone()));
//! let service = Arc::new(SignalingService::new(config, factory, capture, SessionRegistry::new()));
//!
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:8000").await?;
//! axum::serve(listener, router(Arc::clone(&service))).await?;
//! service.shutdown().await;
//! ```

pub mod config;
pub mod error;
pub mod media;
pub mod session;
pub mod signaling;
pub mod transport;

// Re-export main types
pub use config::{BackpressurePolicy, CaptureConfig, RelayConfig, ServerConfig};
pub use error::{Error, Result};
pub use media::{
    open_sink, Blackhole, CaptureProvider, CaptureSource, ConfiguredCapture, MediaSink, Recorder,
    RelaySubscription, TrackKind, TrackRelay,
};
pub use session::{Session, SessionId, SessionRegistry, SessionState};
pub use signaling::{router, SessionDescription, SignalingService};
pub use transport::{
    ConnectionState, InboundTrack, PeerTransport, TransportFactory, WebRtcTransportFactory,
};
