//! Synthetic RTP generation for session and relay tests
//!
//! Produces packet sequences shaped like what a browser sends: 20 ms audio
//! frames at 48 kHz and 30 fps video frames at 90 kHz.

use bytes::Bytes;
use std::f32::consts::PI;
use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet;

/// Opus payload type used by browsers
pub const OPUS_PAYLOAD_TYPE: u8 = 111;

/// VP8 payload type used by browsers
pub const VP8_PAYLOAD_TYPE: u8 = 96;

/// Media generator for creating synthetic RTP streams
pub struct MediaGenerator {
    ssrc: u32,
    payload_type: u8,
    timestamp_step: u32,
}

impl MediaGenerator {
    /// 20 ms audio frames at 48 kHz
    pub fn audio(ssrc: u32) -> Self {
        Self {
            ssrc,
            payload_type: OPUS_PAYLOAD_TYPE,
            timestamp_step: 960,
        }
    }

    /// 30 fps video frames at 90 kHz
    pub fn video(ssrc: u32) -> Self {
        Self {
            ssrc,
            payload_type: VP8_PAYLOAD_TYPE,
            timestamp_step: 3_000,
        }
    }

    // ========================================================================
    // Payloads
    // ========================================================================

    /// Generate a sine wave audio signal
    ///
    /// # Arguments
    ///
    /// * `frequency` - Frequency in Hz (e.g., 440.0 for A4)
    /// * `duration_secs` - Duration in seconds
    /// * `sample_rate` - Sample rate in Hz (e.g., 48000)
    pub fn generate_sine_wave(
        &self,
        frequency: f32,
        duration_secs: f32,
        sample_rate: u32,
    ) -> Vec<f32> {
        let num_samples = (duration_secs * sample_rate as f32) as usize;
        let angular_frequency = 2.0 * PI * frequency / sample_rate as f32;

        (0..num_samples)
            .map(|i| (angular_frequency * i as f32).sin())
            .collect()
    }

    /// Payload bytes for frame `index`; the first byte carries the index so
    /// receivers can check what they got
    fn payload(&self, index: usize) -> Bytes {
        let samples = self.generate_sine_wave(440.0, 0.001, 48_000);
        let mut payload = Vec::with_capacity(samples.len() + 1);
        payload.push(index as u8);
        payload.extend(samples.iter().map(|s| ((s + 1.0) * 127.5) as u8));
        Bytes::from(payload)
    }

    // ========================================================================
    // Packets
    // ========================================================================

    /// Build the packet for frame `index`
    pub fn packet(&self, index: usize) -> Packet {
        Packet {
            header: Header {
                version: 2,
                marker: true,
                payload_type: self.payload_type,
                sequence_number: index as u16,
                timestamp: (index as u32).wrapping_mul(self.timestamp_step),
                ssrc: self.ssrc,
                ..Default::default()
            },
            payload: self.payload(index),
        }
    }

    /// Generate `count` consecutive packets
    pub fn packets(&self, count: usize) -> Vec<Packet> {
        (0..count).map(|i| self.packet(i)).collect()
    }
}
