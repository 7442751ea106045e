//! Server configuration
//!
//! Runtime settings shared by the signaling endpoint, sessions and the relay.
//! The binary builds this from command line arguments; tests build it directly.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default HTTP listen port
pub const DEFAULT_PORT: u16 = 8000;

/// Default per-consumer relay queue depth (frames)
pub const DEFAULT_RELAY_QUEUE: usize = 64;

/// Default tone frequency for the synthetic capture source
pub const DEFAULT_TONE_HZ: f32 = 440.0;

/// What a relay does when one consumer's queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Drop the incoming frame for the full consumer only
    #[default]
    DropNewest,
    /// Wait for queue space before reading the next upstream frame
    Block,
}

impl FromStr for BackpressurePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "drop" | "drop_newest" | "drop-newest" => Ok(Self::DropNewest),
            "block" => Ok(Self::Block),
            other => Err(Error::Config(format!(
                "unknown backpressure policy '{}' (expected 'drop' or 'block')",
                other
            ))),
        }
    }
}

/// Track relay settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Bounded queue depth per consumer
    pub queue_capacity: usize,
    /// Policy applied when a consumer queue is full
    pub backpressure: BackpressurePolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_RELAY_QUEUE,
            backpressure: BackpressurePolicy::default(),
        }
    }
}

/// Source used for the audio loopback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum CaptureConfig {
    /// Synthetic sine tone
    Tone { frequency_hz: f32 },
    /// Raw G.711 µ-law file, played in a loop
    File { path: PathBuf },
    /// No capture source; audio loopback is disabled
    Disabled,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        CaptureConfig::Tone {
            frequency_hz: DEFAULT_TONE_HZ,
        }
    }
}

impl FromStr for CaptureConfig {
    type Err = Error;

    /// Parses `tone`, `tone:<hz>`, `file:<path>` or `none`
    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("none") || s.eq_ignore_ascii_case("disabled") {
            return Ok(CaptureConfig::Disabled);
        }
        if s.eq_ignore_ascii_case("tone") {
            return Ok(CaptureConfig::default());
        }
        if let Some(hz) = s.strip_prefix("tone:") {
            let frequency_hz = hz
                .parse::<f32>()
                .map_err(|e| Error::Config(format!("invalid tone frequency '{}': {}", hz, e)))?;
            return Ok(CaptureConfig::Tone { frequency_hz });
        }
        if let Some(path) = s.strip_prefix("file:") {
            if path.is_empty() {
                return Err(Error::Config("capture file path is empty".to_string()));
            }
            return Ok(CaptureConfig::File {
                path: PathBuf::from(path),
            });
        }
        Err(Error::Config(format!(
            "unknown capture source '{}' (expected 'tone', 'tone:<hz>', 'file:<path>' or 'none')",
            s
        )))
    }
}

/// Complete server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    pub host: IpAddr,
    /// Listen port
    pub port: u16,
    /// Recording directory; `None` discards inbound media
    pub record_to: Option<PathBuf>,
    /// Logging verbosity (number of `-v` flags)
    pub verbose: u8,
    /// STUN server URLs handed to every peer connection
    pub stun_servers: Vec<String>,
    /// Audio loopback source
    pub capture: CaptureConfig,
    /// Relay fan-out settings
    pub relay: RelayConfig,
    /// Upper bound on ICE candidate gathering before the answer is returned
    pub ice_gathering_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::from([0, 0, 0, 0]),
            port: DEFAULT_PORT,
            record_to: None,
            verbose: 0,
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            capture: CaptureConfig::default(),
            relay: RelayConfig::default(),
            ice_gathering_timeout_ms: 5_000,
        }
    }
}

impl ServerConfig {
    /// Socket address the HTTP endpoint binds to
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn ice_gathering_timeout(&self) -> Duration {
        Duration::from_millis(self.ice_gathering_timeout_ms)
    }

    /// Whether inbound media is persisted
    pub fn is_recording(&self) -> bool {
        self.record_to.is_some()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.relay.queue_capacity == 0 {
            return Err(Error::Config(
                "relay queue capacity must be at least 1".to_string(),
            ));
        }

        for url in &self.stun_servers {
            if !(url.starts_with("stun:") || url.starts_with("stuns:")) {
                return Err(Error::Config(format!(
                    "STUN server URL must start with 'stun:' or 'stuns:': {}",
                    url
                )));
            }
        }

        if let CaptureConfig::Tone { frequency_hz } = self.capture {
            // Nyquist limit for the 8 kHz capture clock
            if !(frequency_hz > 0.0 && frequency_hz < 4_000.0) {
                return Err(Error::Config(format!(
                    "tone frequency must be within (0, 4000) Hz, got {}",
                    frequency_hz
                )));
            }
        }

        if self.ice_gathering_timeout_ms == 0 {
            return Err(Error::Config(
                "ICE gathering timeout must be positive".to_string(),
            ));
        }

        Ok(())
    }
}
