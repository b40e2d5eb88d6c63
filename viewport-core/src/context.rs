//! Per-viewer presentation state.
//!
//! A [`CapturingContext`] is plain data plus validation. It is owned by
//! the session registry and mutated only through the owning viewer's
//! authorized commands; the capture loop reads snapshots of it.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Highest frame rate a viewer may request.
pub const MAX_FRAME_RATE: u32 = 60;

// ── Codec ────────────────────────────────────────────────────────

/// Frame encodings a viewer can select.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum Codec {
    /// Lossy, quality-controlled.
    #[default]
    Jpeg,
    /// Lossless, slower.
    Png,
    /// Packed BGRA compressed with zstd; quality picks the level.
    Zstd,
}

impl Codec {
    pub const ALL: [Codec; 3] = [Codec::Jpeg, Codec::Png, Codec::Zstd];

    pub fn as_str(self) -> &'static str {
        match self {
            Codec::Jpeg => "jpeg",
            Codec::Png => "png",
            Codec::Zstd => "zstd",
        }
    }
}

impl std::fmt::Display for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Codec {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" => Ok(Codec::Jpeg),
            "png" => Ok(Codec::Png),
            "zstd" | "raw" => Ok(Codec::Zstd),
            _ => Err(CoreError::UnknownCodec(s.to_string())),
        }
    }
}

// ── CapturingContext ─────────────────────────────────────────────

/// Presentation settings of one viewer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CapturingContext {
    pub viewer_id: String,
    /// Name of the display this viewer watches. Empty until the registry
    /// assigns the primary display on insertion.
    pub selected_screen: String,
    pub selected_codec: Codec,
    /// 1..=100.
    pub image_quality: u8,
    /// 1..=[`MAX_FRAME_RATE`].
    pub frame_rate: u32,
    pub is_cursor_visible: bool,
    /// Whether host audio is streamed to this viewer.
    #[serde(default)]
    pub is_audio_enabled: bool,
    /// Bumped on every mutation; the capture loop compares revisions to
    /// decide whether a viewer needs a fresh frame.
    pub revision: u64,
}

impl CapturingContext {
    pub fn new(viewer_id: impl Into<String>) -> Self {
        Self {
            viewer_id: viewer_id.into(),
            selected_screen: String::new(),
            selected_codec: Codec::default(),
            image_quality: 75,
            frame_rate: 30,
            is_cursor_visible: true,
            is_audio_enabled: false,
            revision: 0,
        }
    }

    pub fn with_frame_rate(mut self, fps: u32) -> Self {
        self.frame_rate = fps.clamp(1, MAX_FRAME_RATE);
        self
    }

    pub fn with_quality(mut self, quality: u8) -> Self {
        self.image_quality = quality.clamp(1, 100);
        self
    }

    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.selected_codec = codec;
        self
    }

    pub fn with_screen(mut self, name: impl Into<String>) -> Self {
        self.selected_screen = name.into();
        self
    }

    // ── Validated setters ────────────────────────────────────────

    pub fn set_frame_rate(&mut self, fps: u32) -> Result<(), CoreError> {
        if fps == 0 || fps > MAX_FRAME_RATE {
            return Err(CoreError::InvalidSetting {
                name: "frame_rate",
                reason: format!("{fps} is outside 1..={MAX_FRAME_RATE}"),
            });
        }
        self.frame_rate = fps;
        Ok(())
    }

    pub fn set_image_quality(&mut self, quality: u8) -> Result<(), CoreError> {
        if !(1..=100).contains(&quality) {
            return Err(CoreError::InvalidSetting {
                name: "image_quality",
                reason: format!("{quality} is outside 1..=100"),
            });
        }
        self.image_quality = quality;
        Ok(())
    }

    pub fn set_codec(&mut self, name: &str) -> Result<(), CoreError> {
        self.selected_codec = name.parse()?;
        Ok(())
    }

    pub fn set_cursor_visible(&mut self, visible: bool) {
        self.is_cursor_visible = visible;
    }

    pub fn set_audio_enabled(&mut self, enabled: bool) {
        self.is_audio_enabled = enabled;
    }

    /// Interval between frames at this context's rate.
    pub fn frame_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(1.0 / self.frame_rate.max(1) as f64)
    }
}
