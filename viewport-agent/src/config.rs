//! Configuration for the host agent.

use std::io::Write;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use viewport_core::audio::{AudioFormat, AudioSourceKind};
use viewport_core::{
    AudioConfig, BackendKind, CaptureConfig, CapturingContext, Codec, HostOptions, InputConfig,
    Role, MAX_FRAME_RATE,
};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Listener settings.
    pub network: NetworkConfig,
    /// Screen capture settings.
    pub capture: CaptureSection,
    /// Remote input settings.
    pub input: InputSection,
    /// Audio capture settings.
    pub audio: AudioSection,
    /// Viewer authentication.
    pub auth: AuthConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind the viewer listener on.
    pub bind_address: String,
    /// TCP port for viewer connections.
    pub port: u16,
    /// Maximum concurrently connected viewers.
    pub max_viewers: u32,
}

/// Screen capture configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSection {
    /// Display backend: "auto", "dxgi", "x11", "synthetic".
    pub backend: BackendKind,
    /// Acquire timeout in milliseconds.
    pub acquire_timeout_ms: u64,
    /// Block size for delta detection (pixels).
    pub block_size: usize,
    /// Codec new viewers start with: "jpeg", "png", "zstd".
    pub default_codec: String,
    /// Image quality new viewers start with (1-100).
    pub default_quality: u8,
    /// Frame rate new viewers start with.
    pub default_fps: u32,
    /// Minimum milliseconds between rendered thumbnails.
    pub thumbnail_interval_ms: u64,
    /// How often to check for display hot-plug, in milliseconds.
    pub topology_poll_ms: u64,
    /// Consecutive acquisition timeouts tolerated before they count as a
    /// hard failure.
    pub max_transient_failures: u32,
}

/// Remote input configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InputSection {
    /// Whether remote input is accepted at startup.
    pub enabled: bool,
    /// Retries for a failed injection.
    pub max_retries: u32,
    /// Delay between injection retries in milliseconds.
    pub retry_delay_ms: u64,
    /// Input events buffered ahead of the dispatcher.
    pub queue_capacity: usize,
}

/// Audio capture configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSection {
    /// Start recording when the agent starts.
    pub enabled: bool,
    /// Source: "silence", "tone", "cpal".
    pub source: AudioSourceKind,
    /// Audio chunks kept for subscribers.
    pub ring_capacity: usize,
    /// Chunk length in milliseconds.
    pub chunk_ms: u64,
    pub sample_rate: u32,
    pub channels: u16,
    /// Frequency of the "tone" source.
    pub tone_hz: f32,
}

/// One accepted bearer token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenEntry {
    pub token: String,
    pub user: String,
    #[serde(default)]
    pub role: Role,
}

/// Authentication settings. Loopback peers are always trusted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub tokens: Vec<TokenEntry>,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Optional log file path. If empty, logs to stderr.
    pub file: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".into(),
            port: 7340,
            max_viewers: 8,
        }
    }
}

impl Default for CaptureSection {
    fn default() -> Self {
        Self {
            backend: BackendKind::Auto,
            acquire_timeout_ms: 100,
            block_size: 64,
            default_codec: "jpeg".into(),
            default_quality: 75,
            default_fps: 30,
            thumbnail_interval_ms: 1000,
            topology_poll_ms: 500,
            max_transient_failures: 30,
        }
    }
}

impl Default for InputSection {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 2,
            retry_delay_ms: 5,
            queue_capacity: 1024,
        }
    }
}

impl Default for AudioSection {
    fn default() -> Self {
        Self {
            enabled: false,
            source: AudioSourceKind::Silence,
            ring_capacity: 64,
            chunk_ms: 20,
            sample_rate: 48_000,
            channels: 2,
            tone_hz: 440.0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            file: String::new(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl HostConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::parse(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Write the default configuration to a new file (for bootstrapping).
    /// Fails with `AlreadyExists` rather than replacing an existing file.
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        file.write_all(text.as_bytes())
    }

    // ── Conversions ──────────────────────────────────────────────

    pub fn to_capture_config(&self) -> CaptureConfig {
        let c = &self.capture;
        CaptureConfig {
            acquire_timeout: Duration::from_millis(c.acquire_timeout_ms.clamp(1, 1000)),
            block_size: c.block_size.clamp(8, 512),
            topology_poll_interval: Duration::from_millis(c.topology_poll_ms.max(10)),
            thumbnail_interval: Duration::from_millis(c.thumbnail_interval_ms),
            max_transient_failures: c.max_transient_failures.max(1),
        }
    }

    pub fn to_input_config(&self) -> InputConfig {
        let i = &self.input;
        InputConfig {
            enabled: i.enabled,
            max_retries: i.max_retries.min(10),
            retry_delay: Duration::from_millis(i.retry_delay_ms.min(1000)),
            queue_capacity: i.queue_capacity.max(1),
        }
    }

    pub fn to_audio_config(&self) -> AudioConfig {
        let a = &self.audio;
        AudioConfig {
            enabled: a.enabled,
            source: a.source,
            ring_capacity: a.ring_capacity.max(1),
            chunk_duration: Duration::from_millis(a.chunk_ms.clamp(1, 1000)),
            format: AudioFormat {
                sample_rate: a.sample_rate.clamp(8_000, 192_000),
                channels: a.channels.clamp(1, 8),
            },
            tone_hz: a.tone_hz,
        }
    }

    pub fn to_host_options(&self) -> HostOptions {
        HostOptions {
            capture: self.to_capture_config(),
            input: self.to_input_config(),
            audio: self.to_audio_config(),
        }
    }

    /// Presentation settings a freshly connected viewer starts with.
    pub fn default_context(&self, connection_id: &str) -> CapturingContext {
        let codec = self.capture.default_codec.parse().unwrap_or_else(|_| {
            tracing::warn!(
                codec = %self.capture.default_codec,
                "unknown default codec; using jpeg"
            );
            Codec::Jpeg
        });
        CapturingContext::new(connection_id)
            .with_codec(codec)
            .with_quality(self.capture.default_quality)
            .with_frame_rate(self.capture.default_fps.min(MAX_FRAME_RATE))
    }
}

// ── Tests ────────────────────────────────────────────────────────
