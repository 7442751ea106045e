//! Transport seam
//!
//! Sessions talk to the real-time engine only through these traits. The
//! production implementation in [`webrtc_peer`] wraps webrtc-rs peer connections;
//! tests drive sessions with a scripted transport instead.

pub mod webrtc_peer;

pub use webrtc_peer::{RemoteTrack, WebRtcPeer, WebRtcTransportFactory};

use crate::media::TrackKind;
use crate::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::TrackLocal;

/// Connection state reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// `Failed` and `Closed` end the connection for good
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::New => "new",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

impl From<RTCPeerConnectionState> for ConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => {
                ConnectionState::New
            }
            RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
            RTCPeerConnectionState::Connected => ConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => ConnectionState::Failed,
            RTCPeerConnectionState::Closed => ConnectionState::Closed,
        }
    }
}

/// Callback for connection state changes.
///
/// Invoked on the transport's own task; must not block.
pub type StateChangeHandler = Box<dyn Fn(ConnectionState) + Send + Sync>;

/// Callback for inbound tracks.
///
/// Invoked on the transport's own task; must not block.
pub type TrackHandler = Box<dyn Fn(Arc<dyn InboundTrack>) + Send + Sync>;

/// An inbound media stream owned by the transport
#[async_trait]
pub trait InboundTrack: Send + Sync {
    /// Identity of the upstream; two handles with the same key are the same stream
    fn key(&self) -> String;

    fn kind(&self) -> TrackKind;

    /// Negotiated codec of the stream
    fn codec(&self) -> RTCRtpCodecCapability;

    /// Read the next frame. An error means the stream has ended.
    async fn read_frame(&self) -> Result<Packet>;
}

/// One negotiated real-time connection
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Apply the remote offer
    async fn accept_remote(&self, offer: RTCSessionDescription) -> Result<()>;

    /// Produce and apply the local answer
    async fn create_local_answer(&self) -> Result<RTCSessionDescription>;

    fn on_state_change(&self, handler: StateChangeHandler);

    fn on_track(&self, handler: TrackHandler);

    async fn add_outbound_track(&self, track: Arc<dyn TrackLocal + Send + Sync>) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Creates transports, one per session
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create_connection(&self) -> Result<Arc<dyn PeerTransport>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_mapping() {
        assert_eq!(
            ConnectionState::from(RTCPeerConnectionState::Failed),
            ConnectionState::Failed
        );
        assert_eq!(
            ConnectionState::from(RTCPeerConnectionState::Unspecified),
            ConnectionState::New
        );
        assert!(ConnectionState::Failed.is_terminal());
        assert!(ConnectionState::Closed.is_terminal());
        assert!(!ConnectionState::Disconnected.is_terminal());
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
    }
}
