//! Capture sources for the audio loopback
//!
//! A capture source feeds an outbound PCMU track with 20 ms frames: either a
//! synthetic tone or a raw µ-law file played in a loop. Each session opens its
//! own source and stops it on teardown.

use crate::config::CaptureConfig;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::f32::consts::PI;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use webrtc::api::media_engine::MIME_TYPE_PCMU;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// G.711 sample rate
pub const CAPTURE_SAMPLE_RATE: u32 = 8_000;

/// Duration of one capture frame
pub const FRAME_DURATION: Duration = Duration::from_millis(20);

/// Samples (and µ-law bytes) per frame
pub const SAMPLES_PER_FRAME: usize = (CAPTURE_SAMPLE_RATE as usize / 1000) * 20;

/// Tone amplitude relative to full scale
const TONE_AMPLITUDE: f32 = 0.3;

/// Outbound media produced locally
#[async_trait]
pub trait CaptureSource: Send + Sync {
    /// The outbound track this source writes to
    fn track(&self) -> Arc<dyn TrackLocal + Send + Sync>;

    /// Begin producing frames. Idempotent.
    async fn start(&self) -> Result<()>;

    /// Stop producing frames. Idempotent; a stopped source cannot restart.
    async fn stop(&self);
}

/// Opens a capture source for a session
pub trait CaptureProvider: Send + Sync {
    fn open(&self, label: &str) -> Result<Arc<dyn CaptureSource>>;
}

/// Provider driven by [`CaptureConfig`]
pub struct ConfiguredCapture {
    config: CaptureConfig,
}

impl ConfiguredCapture {
    pub fn new(config: CaptureConfig) -> Self {
        Self { config }
    }
}

impl CaptureProvider for ConfiguredCapture {
    fn open(&self, label: &str) -> Result<Arc<dyn CaptureSource>> {
        let generator = match &self.config {
            CaptureConfig::Tone { frequency_hz } => FrameGenerator::tone(*frequency_hz),
            CaptureConfig::File { path } => FrameGenerator::looped_file(path)?,
            CaptureConfig::Disabled => {
                return Err(Error::CaptureUnavailable(
                    "capture source disabled".to_string(),
                ))
            }
        };
        Ok(Arc::new(PacedCapture::new(label, generator)))
    }
}

/// Produces successive 20 ms µ-law frames
#[derive(Debug)]
pub enum FrameGenerator {
    Tone { step: f32, index: u64 },
    Looped { data: Bytes, position: usize },
}

impl FrameGenerator {
    pub fn tone(frequency_hz: f32) -> Self {
        FrameGenerator::Tone {
            step: 2.0 * PI * frequency_hz / CAPTURE_SAMPLE_RATE as f32,
            index: 0,
        }
    }

    /// Loop over a raw µ-law file
    pub fn looped_file(path: &Path) -> Result<Self> {
        let data = std::fs::read(path).map_err(|e| {
            Error::CaptureUnavailable(format!("cannot read {}: {}", path.display(), e))
        })?;
        if data.is_empty() {
            return Err(Error::CaptureUnavailable(format!(
                "{} is empty",
                path.display()
            )));
        }
        Ok(FrameGenerator::Looped {
            data: Bytes::from(data),
            position: 0,
        })
    }

    pub fn next_frame(&mut self) -> Bytes {
        match self {
            FrameGenerator::Tone { step, index } => {
                let frame: Vec<u8> = (0..SAMPLES_PER_FRAME as u64)
                    .map(|i| {
                        let phase = *step * ((*index + i) % CAPTURE_SAMPLE_RATE as u64) as f32;
                        let sample = (phase.sin() * TONE_AMPLITUDE * i16::MAX as f32) as i16;
                        linear_to_ulaw(sample)
                    })
                    .collect();
                *index += SAMPLES_PER_FRAME as u64;
                Bytes::from(frame)
            }
            FrameGenerator::Looped { data, position } => {
                let mut frame = Vec::with_capacity(SAMPLES_PER_FRAME);
                while frame.len() < SAMPLES_PER_FRAME {
                    let take = (SAMPLES_PER_FRAME - frame.len()).min(data.len() - *position);
                    frame.extend_from_slice(&data[*position..*position + take]);
                    *position = (*position + take) % data.len();
                }
                Bytes::from(frame)
            }
        }
    }
}

/// Encode one 16-bit linear PCM sample as G.711 µ-law
pub fn linear_to_ulaw(sample: i16) -> u8 {
    const BIAS: i32 = 0x84;
    const CLIP: i32 = 32_635;

    let mut magnitude = sample as i32;
    let sign = if magnitude < 0 {
        magnitude = -magnitude;
        0x80
    } else {
        0
    };
    magnitude = magnitude.min(CLIP) + BIAS;

    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && magnitude & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (magnitude >> (exponent + 3)) & 0x0F;

    !(sign | (exponent << 4) | mantissa) as u8
}

/// Capture source that writes one frame every [`FRAME_DURATION`]
pub struct PacedCapture {
    label: String,
    track: Arc<TrackLocalStaticSample>,
    generator: Mutex<Option<FrameGenerator>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PacedCapture {
    pub fn new(label: &str, generator: FrameGenerator) -> Self {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_PCMU.to_string(),
                clock_rate: CAPTURE_SAMPLE_RATE,
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            format!("audio-capture-{}", label),
            format!("mirrorcast-{}", label),
        ));

        Self {
            label: label.to_string(),
            track,
            generator: Mutex::new(Some(generator)),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Whether the pacing task is running
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

#[async_trait]
impl CaptureSource for PacedCapture {
    fn track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        Arc::clone(&self.track) as Arc<dyn TrackLocal + Send + Sync>
    }

    async fn start(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::CaptureUnavailable(format!(
                "capture {} already stopped",
                self.label
            )));
        }
        let Some(mut generator) = self.generator.lock().take() else {
            return Ok(());
        };

        let track = Arc::clone(&self.track);
        let cancel = self.cancel.clone();
        let label = self.label.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(FRAME_DURATION);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut frames: u64 = 0;
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let sample = Sample {
                    data: generator.next_frame(),
                    duration: FRAME_DURATION,
                    ..Default::default()
                };
                if let Err(e) = track.write_sample(&sample).await {
                    debug!("Capture {} write failed: {}", label, e);
                }
                frames += 1;
            }
            debug!("Capture {} stopped after {} frames", label, frames);
        });
        *self.task.lock() = Some(handle);

        info!("Capture source started for {}", self.label);
        Ok(())
    }

    async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}
