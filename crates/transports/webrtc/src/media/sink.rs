//! Recording sinks
//!
//! A session owns exactly one sink. [`Recorder`] writes every attached track to
//! its own file under the recording directory; [`Blackhole`] reads and discards
//! so relayed tracks keep draining when nothing is recorded.

use super::relay::{Frame, RelaySubscription};
use super::TrackKind;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_OPUS, MIME_TYPE_VP8, MIME_TYPE_VP9};
use webrtc::media::io::h264_writer::H264Writer;
use webrtc::media::io::ivf_reader::IVFFileHeader;
use webrtc::media::io::ivf_writer::IVFWriter;
use webrtc::media::io::ogg_writer::OggWriter;
use webrtc::media::io::Writer;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

/// Consumer of inbound media for one session
#[async_trait]
pub trait MediaSink: Send + Sync {
    /// Prepare the destination
    async fn start(&self) -> Result<()>;

    /// Consume a relayed track until it ends or the sink stops
    async fn add_track(
        &self,
        kind: TrackKind,
        codec: RTCRtpCodecCapability,
        subscription: RelaySubscription,
    ) -> Result<()>;

    /// Stop consuming and flush. Idempotent.
    async fn stop(&self);

    /// Whether attached media ends up on disk
    fn is_persistent(&self) -> bool;
}

/// Open the sink for a session.
///
/// Without a recording directory, or when the directory cannot be prepared,
/// the session gets a [`Blackhole`].
pub async fn open_sink(record_to: Option<&Path>, label: &str) -> Arc<dyn MediaSink> {
    let Some(directory) = record_to else {
        return Arc::new(Blackhole::new(label));
    };

    let recorder = Recorder::new(directory, label);
    match recorder.start().await {
        Ok(()) => Arc::new(recorder),
        Err(e) => {
            warn!(
                "[{}] Recording disabled, discarding inbound media: {}",
                label, e
            );
            Arc::new(Blackhole::new(label))
        }
    }
}

/// Tasks consuming attached tracks, stopped together
struct Consumers {
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl Consumers {
    fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        }
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn push(&self, task: JoinHandle<()>) {
        self.tasks.lock().push(task);
    }

    /// Returns false when already stopped
    async fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        true
    }
}

// =============================================================================
// Blackhole
// =============================================================================

/// Sink that reads attached tracks and throws the frames away
pub struct Blackhole {
    label: String,
    frames: Arc<AtomicU64>,
    consumers: Consumers,
}

impl Blackhole {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            frames: Arc::new(AtomicU64::new(0)),
            consumers: Consumers::new(),
        }
    }

    /// Frames read and discarded so far
    pub fn frames_discarded(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MediaSink for Blackhole {
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn add_track(
        &self,
        kind: TrackKind,
        _codec: RTCRtpCodecCapability,
        mut subscription: RelaySubscription,
    ) -> Result<()> {
        if self.consumers.is_stopped() {
            return Ok(());
        }

        let frames = Arc::clone(&self.frames);
        let cancel = self.consumers.cancel.clone();
        self.consumers.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    frame = subscription.recv() => match frame {
                        Some(_) => {
                            frames.fetch_add(1, Ordering::Relaxed);
                        }
                        None => break,
                    },
                }
            }
        }));

        debug!("[{}] Discarding inbound {} track", self.label, kind);
        Ok(())
    }

    async fn stop(&self) {
        if self.consumers.stop().await {
            debug!(
                "[{}] Blackhole stopped after {} frames",
                self.label,
                self.frames_discarded()
            );
        }
    }

    fn is_persistent(&self) -> bool {
        false
    }
}

// =============================================================================
// Recorder
// =============================================================================

type RecordingWriter = Box<dyn Writer + Send>;

/// Frames buffered between a track's reader and its file writer
const WRITE_QUEUE: usize = 64;

/// File format used for a recorded codec
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Container {
    Ogg,
    Ivf { four_cc: [u8; 4] },
    AnnexB,
}

impl Container {
    fn for_codec(mime_type: &str) -> Option<Self> {
        if mime_type.eq_ignore_ascii_case(MIME_TYPE_OPUS) {
            Some(Container::Ogg)
        } else if mime_type.eq_ignore_ascii_case(MIME_TYPE_VP8) {
            Some(Container::Ivf { four_cc: *b"VP80" })
        } else if mime_type.eq_ignore_ascii_case(MIME_TYPE_VP9) {
            Some(Container::Ivf { four_cc: *b"VP90" })
        } else if mime_type.eq_ignore_ascii_case(MIME_TYPE_H264) {
            Some(Container::AnnexB)
        } else {
            None
        }
    }

    fn extension(&self) -> &'static str {
        match self {
            Container::Ogg => "ogg",
            Container::Ivf { .. } => "ivf",
            Container::AnnexB => "h264",
        }
    }

    /// Create the file and write the container header. Blocking.
    fn create(&self, path: &Path, clock_rate: u32) -> Result<RecordingWriter> {
        let file = File::create(path)
            .map_err(|e| Error::Sink(format!("cannot create {}: {}", path.display(), e)))?;
        let file = BufWriter::new(file);
        let sink_err = |e: webrtc::media::Error| Error::Sink(e.to_string());

        match *self {
            Container::Ogg => {
                let writer = OggWriter::new(file, clock_rate, 2).map_err(sink_err)?;
                Ok(Box::new(writer))
            }
            Container::Ivf { four_cc } => {
                let header = IVFFileHeader {
                    signature: *b"DKIF",
                    version: 0,
                    header_size: 32,
                    four_cc,
                    width: 640,
                    height: 480,
                    timebase_denominator: 30,
                    timebase_numerator: 1,
                    num_frames: 900,
                    unused: 0,
                };
                let writer = IVFWriter::new(file, &header).map_err(sink_err)?;
                Ok(Box::new(writer))
            }
            Container::AnnexB => Ok(Box::new(H264Writer::new(file))),
        }
    }
}

/// Drain `frames` into `writer` until the reader side hangs up. Blocking.
fn write_frames(
    mut writer: RecordingWriter,
    mut frames: mpsc::Receiver<Frame>,
    label: &str,
    path: &Path,
) -> u64 {
    let mut written: u64 = 0;
    while let Some(frame) = frames.blocking_recv() {
        if let Err(e) = writer.write_rtp(&frame) {
            warn!("[{}] Write to {} failed: {}", label, path.display(), e);
            break;
        }
        written += 1;
    }
    if let Err(e) = writer.close() {
        warn!("[{}] Closing {} failed: {}", label, path.display(), e);
    }
    written
}

/// Sink that writes each attached track to a container file.
///
/// File I/O runs on the blocking pool; the runtime only moves frames from the
/// relay to the writer.
pub struct Recorder {
    directory: PathBuf,
    label: String,
    next_index: AtomicUsize,
    consumers: Consumers,
}

impl Recorder {
    pub fn new(directory: &Path, label: &str) -> Self {
        Self {
            directory: directory.to_path_buf(),
            label: label.to_string(),
            next_index: AtomicUsize::new(0),
            consumers: Consumers::new(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn next_path(&self, kind: TrackKind, container: Container) -> PathBuf {
        let index = self.next_index.fetch_add(1, Ordering::Relaxed);
        self.directory.join(format!(
            "{}-{}-{}.{}",
            self.label,
            kind,
            index,
            container.extension()
        ))
    }
}

#[async_trait]
impl MediaSink for Recorder {
    async fn start(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.directory)
            .await
            .map_err(|e| {
                Error::Sink(format!(
                    "cannot create recording directory {}: {}",
                    self.directory.display(),
                    e
                ))
            })?;
        info!(
            "[{}] Recording to {}",
            self.label,
            self.directory.display()
        );
        Ok(())
    }

    async fn add_track(
        &self,
        kind: TrackKind,
        codec: RTCRtpCodecCapability,
        mut subscription: RelaySubscription,
    ) -> Result<()> {
        if self.consumers.is_stopped() {
            return Err(Error::Sink("recorder already stopped".to_string()));
        }

        let container = Container::for_codec(&codec.mime_type)
            .ok_or_else(|| Error::Sink(format!("no container for codec {}", codec.mime_type)))?;
        let path = self.next_path(kind, container);

        let writer = {
            let path = path.clone();
            let clock_rate = codec.clock_rate;
            tokio::task::spawn_blocking(move || container.create(&path, clock_rate))
                .await
                .map_err(|e| Error::Internal(format!("recording file task failed: {}", e)))??
        };
        info!(
            "[{}] Recording {} track ({}) to {}",
            self.label,
            kind,
            codec.mime_type,
            path.display()
        );

        let (frames_tx, frames_rx) = mpsc::channel(WRITE_QUEUE);
        let writer_task = {
            let label = self.label.clone();
            let path = path.clone();
            tokio::task::spawn_blocking(move || write_frames(writer, frames_rx, &label, &path))
        };

        let label = self.label.clone();
        let cancel = self.consumers.cancel.clone();
        self.consumers.push(tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    frame = subscription.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                };
                let queued = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => false,
                    result = frames_tx.send(frame) => result.is_ok(),
                };
                if !queued {
                    break;
                }
            }

            // Hanging up lets the writer flush and close the file
            drop(frames_tx);
            let written = writer_task.await.unwrap_or_default();
            debug!(
                "[{}] Finished {} after {} packets ({} dropped by relay)",
                label,
                path.display(),
                written,
                subscription.dropped_frames()
            );
        }));

        Ok(())
    }

    async fn stop(&self) {
        if self.consumers.stop().await {
            info!("[{}] Recording stopped", self.label);
        }
    }

    fn is_persistent(&self) -> bool {
        true
    }
}
