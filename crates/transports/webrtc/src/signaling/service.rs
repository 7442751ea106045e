//! Offer handling

use crate::config::ServerConfig;
use crate::media::{open_sink, CaptureProvider, TrackRelay};
use crate::session::{Session, SessionId, SessionParts, SessionRegistry};
use crate::transport::TransportFactory;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// Session description as exchanged with the browser
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Creates sessions from offers
pub struct SignalingService {
    config: ServerConfig,
    factory: Arc<dyn TransportFactory>,
    capture: Arc<dyn CaptureProvider>,
    relay: TrackRelay,
    registry: SessionRegistry,
}

impl SignalingService {
    pub fn new(
        config: ServerConfig,
        factory: Arc<dyn TransportFactory>,
        capture: Arc<dyn CaptureProvider>,
        registry: SessionRegistry,
    ) -> Self {
        let relay = TrackRelay::new(config.relay);
        Self {
            config,
            factory,
            capture,
            relay,
            registry,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn relay(&self) -> &TrackRelay {
        &self.relay
    }

    /// Negotiate a new session for a remote offer and return the answer
    pub async fn handle_offer(&self, offer: SessionDescription) -> Result<SessionDescription> {
        if !offer.kind.eq_ignore_ascii_case("offer") {
            return Err(Error::Negotiation(format!(
                "expected an offer, got '{}'",
                offer.kind
            )));
        }
        if self.registry.is_closing() {
            return Err(Error::ShuttingDown);
        }

        let remote = RTCSessionDescription::offer(offer.sdp)
            .map_err(|e| Error::Negotiation(format!("Malformed SDP: {}", e)))?;

        let id = SessionId::new();
        info!("[{}] Offer received", id);

        let transport = self.factory.create_connection().await?;

        let capture = match self.capture.open(id.as_str()) {
            Ok(capture) => Some(capture),
            Err(e) => {
                warn!("[{}] {}", id, e);
                None
            }
        };
        let sink = open_sink(self.config.record_to.as_deref(), id.as_str()).await;

        let session = Session::create(
            id,
            SessionParts {
                transport,
                capture,
                sink,
                relay: self.relay.clone(),
                registry: self.registry.clone(),
            },
        )
        .await?;

        // Negotiation runs on its own task so a client hanging up mid-request
        // cannot abandon a half-negotiated session
        let answer = tokio::spawn(async move { session.accept_offer(remote).await })
            .await
            .map_err(|e| Error::Internal(format!("negotiation task failed: {}", e)))??;

        Ok(SessionDescription {
            sdp: answer.sdp,
            kind: answer.sdp_type.to_string(),
        })
    }

    /// Close every live session
    pub async fn shutdown(&self) {
        self.registry.close_all().await;
    }
}
