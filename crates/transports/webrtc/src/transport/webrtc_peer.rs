//! webrtc-rs backed transport
//!
//! One [`WebRtcTransportFactory`] holds the shared media engine and interceptor
//! registry; every session gets its own [`WebRtcPeer`].

use super::{
    ConnectionState, InboundTrack, PeerTransport, StateChangeHandler, TrackHandler,
    TransportFactory,
};
use crate::config::ServerConfig;
use crate::media::TrackKind;
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Interval between picture loss indications sent for inbound video.
///
/// Keeps keyframes flowing so the loopback and recordings can start decoding.
const PLI_INTERVAL: Duration = Duration::from_secs(3);

/// Builds webrtc-rs peer connections
pub struct WebRtcTransportFactory {
    api: API,
    rtc_config: RTCConfiguration,
    gathering_timeout: Duration,
}

impl WebRtcTransportFactory {
    /// Create the factory with default codecs and interceptors
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if config.stun_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: config.stun_servers.clone(),
                ..Default::default()
            }]
        };

        info!(
            stun_servers = config.stun_servers.len(),
            "WebRTC transport factory initialized"
        );

        Ok(Self {
            api,
            rtc_config: RTCConfiguration {
                ice_servers,
                ..Default::default()
            },
            gathering_timeout: config.ice_gathering_timeout(),
        })
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create_connection(&self) -> Result<Arc<dyn PeerTransport>> {
        let pc = self.api.new_peer_connection(self.rtc_config.clone()).await?;
        Ok(Arc::new(WebRtcPeer {
            pc: Arc::new(pc),
            gathering_timeout: self.gathering_timeout,
        }))
    }
}

/// A webrtc-rs peer connection
pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    gathering_timeout: Duration,
}

impl WebRtcPeer {
    /// Get the underlying peer connection
    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }
}

#[async_trait]
impl PeerTransport for WebRtcPeer {
    async fn accept_remote(&self, offer: RTCSessionDescription) -> Result<()> {
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| Error::Negotiation(format!("Failed to set remote description: {}", e)))
    }

    async fn create_local_answer(&self) -> Result<RTCSessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| Error::Negotiation(format!("Failed to create answer: {}", e)))?;

        // The answer goes back in a single HTTP response, so candidates must be
        // gathered before it is read back
        let mut gathering_complete = self.pc.gathering_complete_promise().await;

        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| Error::Negotiation(format!("Failed to set local description: {}", e)))?;

        if tokio::time::timeout(self.gathering_timeout, gathering_complete.recv())
            .await
            .is_err()
        {
            warn!(
                "ICE gathering did not complete within {:?}, answering with partial candidates",
                self.gathering_timeout
            );
        }

        self.pc
            .local_description()
            .await
            .ok_or_else(|| Error::Internal("Local description missing after answer".to_string()))
    }

    fn on_state_change(&self, handler: StateChangeHandler) {
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                handler(ConnectionState::from(state));
                Box::pin(async {})
            }));
    }

    fn on_track(&self, handler: TrackHandler) {
        let pc = Arc::downgrade(&self.pc);
        self.pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let remote = RemoteTrack::new(track);
                if remote.kind() == TrackKind::Video {
                    spawn_pli_sender(pc.clone(), remote.ssrc());
                }
                handler(Arc::new(remote));
                Box::pin(async {})
            },
        ));
    }

    async fn add_outbound_track(&self, track: Arc<dyn TrackLocal + Send + Sync>) -> Result<()> {
        let track_id = track.id().to_string();
        let sender = self.pc.add_track(track).await?;

        // Drain RTCP so interceptors (NACK, reports) keep running
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while sender.read(&mut rtcp_buf).await.is_ok() {}
            debug!("RTCP reader for outbound track {} ended", track_id);
        });

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await?;
        Ok(())
    }
}

/// Periodically request keyframes for an inbound video stream until the
/// connection goes away
fn spawn_pli_sender(pc: std::sync::Weak<RTCPeerConnection>, media_ssrc: u32) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PLI_INTERVAL);
        loop {
            interval.tick().await;
            let Some(pc) = pc.upgrade() else {
                break;
            };
            let pli = PictureLossIndication {
                sender_ssrc: 0,
                media_ssrc,
            };
            if let Err(e) = pc.write_rtcp(&[Box::new(pli)]).await {
                debug!("PLI sender for ssrc {} stopped: {}", media_ssrc, e);
                break;
            }
        }
    });
}

/// Inbound webrtc-rs track
pub struct RemoteTrack {
    track: Arc<TrackRemote>,
    kind: TrackKind,
}

impl RemoteTrack {
    pub fn new(track: Arc<TrackRemote>) -> Self {
        let kind = TrackKind::from(track.kind());
        Self { track, kind }
    }

    pub fn ssrc(&self) -> u32 {
        self.track.ssrc()
    }
}

#[async_trait]
impl InboundTrack for RemoteTrack {
    fn key(&self) -> String {
        format!("{}-{}", self.track.id(), self.track.ssrc())
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn codec(&self) -> RTCRtpCodecCapability {
        self.track.codec().capability
    }

    async fn read_frame(&self) -> Result<Packet> {
        self.track
            .read_rtp()
            .await
            .map(|(packet, _attributes)| packet)
            .map_err(|e| Error::TransportFailure(format!("RTP read ended: {}", e)))
    }
}
