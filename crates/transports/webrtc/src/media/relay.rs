//! Track relay: one upstream read, many readers
//!
//! Every distinct inbound track is read by exactly one pump task. Each frame
//! the pump receives is copied into the private bounded queue of every current
//! subscriber, so a loopback and a recorder can consume the same track at
//! their own pace.
//!
//! When a subscriber's queue is full the configured [`BackpressurePolicy`]
//! decides: `DropNewest` skips the frame for that subscriber only, `Block`
//! waits for room before the next upstream read. Either way a subscriber sees
//! frames in upstream order.
//!
//! The pump stops when the upstream ends (all subscribers then see a clean end
//! of stream and the end signal fires) or when the last subscriber goes away
//! (no end signal; the track may still be live).

use crate::config::{BackpressurePolicy, RelayConfig};
use crate::transport::InboundTrack;
use futures::Stream;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// Unit of media moved through the relay
pub type Frame = webrtc::rtp::packet::Packet;

/// Fan-out broadcaster for inbound tracks
#[derive(Clone)]
pub struct TrackRelay {
    inner: Arc<RelayInner>,
}

struct RelayInner {
    config: RelayConfig,
    upstreams: Mutex<HashMap<String, Upstream>>,
    next_consumer_id: AtomicU64,
    next_generation: AtomicU64,
}

type ConsumerMap = Arc<Mutex<HashMap<u64, Consumer>>>;

/// The single read loop of one inbound track
struct Upstream {
    generation: u64,
    consumers: ConsumerMap,
    stop: CancellationToken,
    ended: CancellationToken,
}

#[derive(Clone)]
struct Consumer {
    tx: mpsc::Sender<Frame>,
    dropped: Arc<AtomicU64>,
}

impl TrackRelay {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                config,
                upstreams: Mutex::new(HashMap::new()),
                next_consumer_id: AtomicU64::new(1),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> RelayConfig {
        self.inner.config
    }

    /// Subscribe to an inbound track.
    ///
    /// The first subscriber for a track starts its read loop; later
    /// subscribers share it and receive frames from the moment they join.
    pub fn subscribe(&self, track: Arc<dyn InboundTrack>) -> RelaySubscription {
        let key = track.key();
        let consumer_id = self.inner.next_consumer_id.fetch_add(1, Ordering::Relaxed);
        let capacity = self.inner.config.queue_capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let dropped = Arc::new(AtomicU64::new(0));

        let mut upstreams = self.inner.upstreams.lock();

        let (generation, ended, consumer_count) = match upstreams.get(&key) {
            Some(upstream) => {
                let mut consumers = upstream.consumers.lock();
                consumers.insert(
                    consumer_id,
                    Consumer {
                        tx,
                        dropped: Arc::clone(&dropped),
                    },
                );
                (upstream.generation, upstream.ended.clone(), consumers.len())
            }
            None => {
                let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
                let mut consumers = HashMap::new();
                consumers.insert(
                    consumer_id,
                    Consumer {
                        tx,
                        dropped: Arc::clone(&dropped),
                    },
                );
                let upstream = Upstream {
                    generation,
                    consumers: Arc::new(Mutex::new(consumers)),
                    stop: CancellationToken::new(),
                    ended: CancellationToken::new(),
                };

                info!("Relay starting upstream read for track {}", key);
                tokio::spawn(pump(
                    track,
                    key.clone(),
                    generation,
                    Arc::clone(&upstream.consumers),
                    self.inner.config.backpressure,
                    upstream.stop.clone(),
                    upstream.ended.clone(),
                    Arc::downgrade(&self.inner),
                ));

                let ended = upstream.ended.clone();
                upstreams.insert(key.clone(), upstream);
                (generation, ended, 1)
            }
        };

        debug!(
            "Relay consumer {} subscribed to track {} ({} consumers)",
            consumer_id, key, consumer_count
        );

        RelaySubscription {
            consumer_id,
            key,
            generation,
            rx,
            ended,
            dropped,
            relay: Arc::downgrade(&self.inner),
        }
    }

    /// Release a subscription. Same as dropping it.
    pub fn unsubscribe(&self, subscription: RelaySubscription) {
        drop(subscription);
    }

    /// Number of tracks currently being read upstream
    pub fn active_upstreams(&self) -> usize {
        self.inner.upstreams.lock().len()
    }

    /// Number of subscribers of a track, 0 when the track is not being read
    pub fn consumer_count(&self, key: &str) -> usize {
        self.inner
            .upstreams
            .lock()
            .get(key)
            .map(|upstream| upstream.consumers.lock().len())
            .unwrap_or(0)
    }
}

impl RelayInner {
    fn unsubscribe(&self, key: &str, generation: u64, consumer_id: u64) {
        let mut upstreams = self.upstreams.lock();
        let Some(upstream) = upstreams.get(key) else {
            return;
        };
        if upstream.generation != generation {
            return;
        }

        let remaining = {
            let mut consumers = upstream.consumers.lock();
            consumers.remove(&consumer_id);
            consumers.len()
        };
        debug!(
            "Relay consumer {} left track {} ({} remaining)",
            consumer_id, key, remaining
        );

        if remaining == 0 {
            if let Some(upstream) = upstreams.remove(key) {
                info!("Relay releasing upstream for track {}: no consumers left", key);
                upstream.stop.cancel();
            }
        }
    }

    /// Forget an upstream whose pump has exited
    fn retire(&self, key: &str, generation: u64) {
        let mut upstreams = self.upstreams.lock();
        if upstreams
            .get(key)
            .is_some_and(|upstream| upstream.generation == generation)
        {
            upstreams.remove(key);
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn pump(
    track: Arc<dyn InboundTrack>,
    key: String,
    generation: u64,
    consumers: ConsumerMap,
    policy: BackpressurePolicy,
    stop: CancellationToken,
    ended: CancellationToken,
    relay: Weak<RelayInner>,
) {
    let mut frames: u64 = 0;
    let mut upstream_ended = false;

    'read: loop {
        let frame = tokio::select! {
            biased;
            _ = stop.cancelled() => break 'read,
            result = track.read_frame() => match result {
                Ok(frame) => frame,
                Err(e) => {
                    debug!("Upstream read for track {} ended: {}", key, e);
                    upstream_ended = true;
                    break 'read;
                }
            },
        };
        frames += 1;

        let targets: Vec<(u64, Consumer)> = consumers
            .lock()
            .iter()
            .map(|(id, consumer)| (*id, consumer.clone()))
            .collect();

        for (id, consumer) in targets {
            let delivered = match policy {
                BackpressurePolicy::DropNewest => match consumer.tx.try_send(frame.clone()) {
                    Ok(()) => true,
                    Err(TrySendError::Full(_)) => {
                        consumer.dropped.fetch_add(1, Ordering::Relaxed);
                        trace!("Relay consumer {} on track {} is full, frame dropped", id, key);
                        true
                    }
                    Err(TrySendError::Closed(_)) => false,
                },
                BackpressurePolicy::Block => tokio::select! {
                    biased;
                    _ = stop.cancelled() => break 'read,
                    result = consumer.tx.send(frame.clone()) => result.is_ok(),
                },
            };

            if !delivered {
                consumers.lock().remove(&id);
            }
        }
    }

    // Retire before clearing so a concurrent subscribe either lands in the
    // map being cleared or starts a fresh upstream
    if let Some(relay) = relay.upgrade() {
        relay.retire(&key, generation);
    }
    consumers.lock().clear();

    if upstream_ended {
        ended.cancel();
        info!("Relay upstream for track {} ended after {} frames", key, frames);
    } else {
        info!(
            "Relay stopped reading track {} after {} frames: no consumers left",
            key, frames
        );
    }
}

/// One consumer's view of a relayed track.
///
/// Yields frames in upstream order and ends when the upstream ends.
/// Dropping the subscription unsubscribes it.
pub struct RelaySubscription {
    consumer_id: u64,
    key: String,
    generation: u64,
    rx: mpsc::Receiver<Frame>,
    ended: CancellationToken,
    dropped: Arc<AtomicU64>,
    relay: Weak<RelayInner>,
}

impl RelaySubscription {
    /// Next frame, `None` once the upstream has ended
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    /// Key of the relayed track
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Token cancelled when the upstream track itself ends.
    ///
    /// Not cancelled when the read loop stops because every consumer left.
    pub fn end_signal(&self) -> CancellationToken {
        self.ended.clone()
    }

    /// Frames skipped for this consumer because its queue was full
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Release the subscription
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Stream for RelaySubscription {
    type Item = Frame;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for RelaySubscription {
    fn drop(&mut self) {
        if let Some(relay) = self.relay.upgrade() {
            relay.unsubscribe(&self.key, self.generation, self.consumer_id);
        }
    }
}

impl std::fmt::Debug for RelaySubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelaySubscription")
            .field("consumer_id", &self.consumer_id)
            .field("key", &self.key)
            .field("dropped", &self.dropped_frames())
            .finish()
    }
}
