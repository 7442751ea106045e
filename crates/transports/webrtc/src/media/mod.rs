//! Media tracks, offer inspection and the track fan-out
//!
//! Holds the pieces that move frames around: the [`relay::TrackRelay`] that
//! fans one inbound track out to many readers, the [`capture`] sources used for
//! audio loopback, and the [`sink`] implementations that record or discard.

pub mod capture;
pub mod relay;
pub mod sink;

pub use capture::{CaptureProvider, CaptureSource, ConfiguredCapture};
pub use relay::{Frame, RelaySubscription, TrackRelay};
pub use sink::{open_sink, Blackhole, MediaSink, Recorder};

use crate::{Error, Result};
use serde::Serialize;
use std::fmt;
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_PCMU, MIME_TYPE_VP8, MIME_TYPE_VP9};
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};

/// RTP clock rate shared by all video codecs
pub const VIDEO_CLOCK_RATE: u32 = 90_000;

/// Video codecs the loopback can mirror, in order of preference when the
/// offer lists several at the same position
const LOOPBACK_VIDEO_CODECS: [&str; 3] = [MIME_TYPE_VP8, MIME_TYPE_VP9, MIME_TYPE_H264];

/// Kind of a media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }

    /// Parse an SDP media type (`m=audio`, `m=video`)
    pub fn from_media_type(media: &str) -> Option<Self> {
        match media {
            "audio" => Some(TrackKind::Audio),
            "video" => Some(TrackKind::Video),
            _ => None,
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<RTPCodecType> for TrackKind {
    /// webrtc-rs only raises tracks for negotiated audio or video, anything
    /// that is not audio is treated as video
    fn from(codec_type: RTPCodecType) -> Self {
        match codec_type {
            RTPCodecType::Audio => TrackKind::Audio,
            _ => TrackKind::Video,
        }
    }
}

// =============================================================================
// Offer inspection
// =============================================================================

/// One `m=` section of a remote offer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSection {
    /// `a=mid` value, if present
    pub mid: Option<String>,
    /// Media kind; `None` for data channels and unknown media
    pub kind: Option<TrackKind>,
    /// Offered codecs as MIME types (`video/VP8`), in offer order
    pub codecs: Vec<String>,
}

impl MediaSection {
    /// Whether the section offers the given MIME type (case-insensitive)
    pub fn offers_codec(&self, mime_type: &str) -> bool {
        self.codecs.iter().any(|c| c.eq_ignore_ascii_case(mime_type))
    }
}

/// Media sections of a remote offer
#[derive(Debug, Clone, Default)]
pub struct OfferedMedia {
    sections: Vec<MediaSection>,
}

impl OfferedMedia {
    /// Parse the `m=` sections of an offer.
    ///
    /// Sections rejected with port 0 are skipped.
    pub fn parse(offer: &RTCSessionDescription) -> Result<Self> {
        let parsed = offer
            .unmarshal()
            .map_err(|e| Error::Negotiation(format!("Malformed SDP: {}", e)))?;

        let sections = parsed
            .media_descriptions
            .iter()
            .filter(|md| md.media_name.port.value != 0)
            .map(|md| {
                let media = md.media_name.media.as_str();
                let kind = TrackKind::from_media_type(media);
                let mut mid = None;
                let mut codecs = Vec::new();
                for attr in &md.attributes {
                    match (attr.key.as_str(), attr.value.as_deref()) {
                        ("mid", Some(value)) => mid = Some(value.to_string()),
                        ("rtpmap", Some(value)) => {
                            if let Some(name) = rtpmap_codec_name(value) {
                                codecs.push(format!("{}/{}", media, name));
                            }
                        }
                        _ => {}
                    }
                }
                MediaSection { mid, kind, codecs }
            })
            .collect();

        Ok(Self { sections })
    }

    pub fn sections(&self) -> &[MediaSection] {
        &self.sections
    }

    /// Number of sections of the given kind
    pub fn count(&self, kind: TrackKind) -> usize {
        self.sections
            .iter()
            .filter(|s| s.kind == Some(kind))
            .count()
    }

    /// Whether the offer carries any audio or video
    pub fn has_media(&self) -> bool {
        self.sections.iter().any(|s| s.kind.is_some())
    }
}

/// Extract the encoding name from an `a=rtpmap` value (`96 VP8/90000` → `VP8`)
fn rtpmap_codec_name(value: &str) -> Option<&str> {
    let (_payload_type, encoding) = value.split_once(' ')?;
    let name = encoding.split('/').next()?.trim();
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

/// Pick the codec for a video loopback track.
///
/// Follows the offer's order so the loopback uses what the browser prefers.
pub fn preferred_video_codec(section: &MediaSection) -> Option<RTCRtpCodecCapability> {
    section
        .codecs
        .iter()
        .find_map(|offered| {
            LOOPBACK_VIDEO_CODECS
                .iter()
                .find(|supported| offered.eq_ignore_ascii_case(supported))
        })
        .map(|mime| video_capability(mime))
}

/// Codec capability for a supported video MIME type
pub fn video_capability(mime_type: &str) -> RTCRtpCodecCapability {
    let sdp_fmtp_line = if mime_type == MIME_TYPE_VP9 {
        "profile-id=0".to_string()
    } else if mime_type == MIME_TYPE_H264 {
        "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f".to_string()
    } else {
        String::new()
    };

    RTCRtpCodecCapability {
        mime_type: mime_type.to_string(),
        clock_rate: VIDEO_CLOCK_RATE,
        channels: 0,
        sdp_fmtp_line,
        rtcp_feedback: vec![],
    }
}

/// Whether an audio section can carry the capture source's codec
pub fn accepts_capture_codec(section: &MediaSection) -> bool {
    section.offers_codec(MIME_TYPE_PCMU)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::relay::Frame;
    use super::TrackKind;
    use crate::transport::InboundTrack;
    use crate::{Error, Result};
    use async_trait::async_trait;
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use webrtc::rtp::header::Header;
    use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

    /// Inbound track fed from a channel; dropping the sender ends the track
    pub struct FedTrack {
        key: String,
        kind: TrackKind,
        rx: tokio::sync::Mutex<mpsc::Receiver<Frame>>,
    }

    #[async_trait]
    impl InboundTrack for FedTrack {
        fn key(&self) -> String {
            self.key.clone()
        }

        fn kind(&self) -> TrackKind {
            self.kind
        }

        fn codec(&self) -> RTCRtpCodecCapability {
            RTCRtpCodecCapability::default()
        }

        async fn read_frame(&self) -> Result<Frame> {
            self.rx
                .lock()
                .await
                .recv()
                .await
                .ok_or_else(|| Error::TransportFailure("ended".to_string()))
        }
    }

    pub fn fed_track(key: &str, kind: TrackKind) -> (Arc<dyn InboundTrack>, mpsc::Sender<Frame>) {
        let (tx, rx) = mpsc::channel(16);
        let track = FedTrack {
            key: key.to_string(),
            kind,
            rx: tokio::sync::Mutex::new(rx),
        };
        (Arc::new(track), tx)
    }

    pub fn frame(seq: u16) -> Frame {
        Frame {
            header: Header {
                sequence_number: seq,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}
