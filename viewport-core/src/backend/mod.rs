//! Platform display backends.
//!
//! A [`DisplayBackend`] is the single capability seam between the
//! platform-agnostic core and the OS:
//!
//! | Capability          | Used by            |
//! |---------------------|--------------------|
//! | `enumerate`         | capture loop, host |
//! | `acquire_frame`     | capture loop       |
//! | `cursor`            | transform stage    |
//! | `take_topology_change` | capture supervisor |
//! | `inject_*`          | input dispatcher   |
//!
//! All native marshalling (DXGI texture descriptions, X11 image replies)
//! stays inside the adapter modules.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::display::Display;
use crate::error::{BackendError, CoreError};
use crate::frame::Frame;
use crate::protocol::{KeyboardInput, MouseButton, MouseEventKind};

pub mod synthetic;

#[cfg(target_os = "windows")]
pub mod dxgi;

#[cfg(target_os = "linux")]
pub mod x11;

pub use synthetic::SyntheticBackend;

// ── Native event types ───────────────────────────────────────────

/// A pointer event already mapped to absolute virtual-desktop pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeMouseEvent {
    pub x: i32,
    pub y: i32,
    pub kind: MouseEventKind,
    pub button: MouseButton,
    pub wheel_delta: i32,
}

/// Cursor position in virtual-desktop pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorState {
    pub x: i32,
    pub y: i32,
    pub visible: bool,
}

// ── DisplayBackend ───────────────────────────────────────────────

/// Platform capability: enumeration, acquisition and input injection.
///
/// Methods take `&self`; adapters synchronise their own handles. The
/// capture loop is the only caller of the acquisition methods and the
/// input dispatcher the only caller of the injection methods.
pub trait DisplayBackend: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &'static str;

    /// Enumerate the currently attached displays.
    fn enumerate(&self) -> Result<Vec<Display>, BackendError>;

    /// Acquire one frame of `display`, waiting up to `timeout`.
    ///
    /// [`BackendError::Timeout`] means no new image was ready.
    fn acquire_frame(&self, display: &Display, timeout: Duration) -> Result<Frame, BackendError>;

    /// Current cursor position, if the backend can report it.
    fn cursor(&self) -> Option<CursorState> {
        None
    }

    /// Returns `true` once per topology change observed since the last
    /// call.
    fn take_topology_change(&self) -> bool {
        false
    }

    /// Tear down and rebuild capture handles after a device loss.
    fn reinitialize(&self) -> Result<(), BackendError> {
        Ok(())
    }

    fn inject_mouse(&self, event: &NativeMouseEvent) -> Result<(), BackendError>;

    fn inject_keyboard(&self, event: &KeyboardInput) -> Result<(), BackendError>;

    /// Block or unblock the local user's physical input.
    fn block_user_input(&self, _block: bool) -> Result<(), BackendError> {
        Err(BackendError::Unsupported("blocking local input"))
    }
}

// ── Backend selection ────────────────────────────────────────────

/// Which backend to construct at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// The platform's native backend.
    #[default]
    Auto,
    Dxgi,
    X11,
    /// In-memory test pattern; never picked by `Auto`.
    Synthetic,
}

impl BackendKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Dxgi => "dxgi",
            Self::X11 => "x11",
            Self::Synthetic => "synthetic",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "dxgi" => Ok(Self::Dxgi),
            "x11" => Ok(Self::X11),
            "synthetic" => Ok(Self::Synthetic),
            other => Err(CoreError::Other(format!("unknown backend kind: {other}"))),
        }
    }
}

/// Construct the requested backend.
pub fn open_backend(kind: BackendKind) -> Result<Arc<dyn DisplayBackend>, BackendError> {
    let backend: Arc<dyn DisplayBackend> = match kind {
        BackendKind::Auto => return open_native(),
        BackendKind::Synthetic => Arc::new(SyntheticBackend::with_default_displays()),
        BackendKind::Dxgi => open_dxgi()?,
        BackendKind::X11 => open_x11()?,
    };
    info!(backend = backend.name(), "display backend opened");
    Ok(backend)
}

fn open_native() -> Result<Arc<dyn DisplayBackend>, BackendError> {
    let candidates: &[BackendKind] = if cfg!(target_os = "windows") {
        &[BackendKind::Dxgi]
    } else if cfg!(target_os = "linux") {
        &[BackendKind::X11]
    } else {
        &[]
    };

    let mut last_err = BackendError::Unavailable("no native backend for this platform".into());
    for kind in candidates {
        match open_backend(*kind) {
            Ok(backend) => return Ok(backend),
            Err(e) => {
                warn!(backend = %kind, "backend unavailable: {e}");
                last_err = e;
            }
        }
    }
    Err(last_err)
}

#[cfg(target_os = "windows")]
fn open_dxgi() -> Result<Arc<dyn DisplayBackend>, BackendError> {
    Ok(Arc::new(dxgi::DxgiBackend::new()?))
}

#[cfg(not(target_os = "windows"))]
fn open_dxgi() -> Result<Arc<dyn DisplayBackend>, BackendError> {
    Err(BackendError::Unavailable(
        "DXGI Desktop Duplication is only available on Windows".into(),
    ))
}

#[cfg(target_os = "linux")]
fn open_x11() -> Result<Arc<dyn DisplayBackend>, BackendError> {
    Ok(Arc::new(x11::X11Backend::connect()?))
}

#[cfg(not(target_os = "linux"))]
fn open_x11() -> Result<Arc<dyn DisplayBackend>, BackendError> {
    Err(BackendError::Unavailable("X11 is only available on Linux".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_parses_case_insensitively() {
        assert_eq!("X11".parse::<BackendKind>().unwrap(), BackendKind::X11);
        assert_eq!(" synthetic ".parse::<BackendKind>().unwrap(), BackendKind::Synthetic);
        assert!("wayland".parse::<BackendKind>().is_err());
    }

    #[test]
    fn synthetic_opens_everywhere() {
        let backend = open_backend(BackendKind::Synthetic).unwrap();
        assert_eq!(backend.name(), "synthetic");
        assert!(!backend.enumerate().unwrap().is_empty());
    }

    #[cfg(not(target_os = "windows"))]
    #[test]
    fn dxgi_is_unavailable_off_windows() {
        assert!(matches!(
            open_backend(BackendKind::Dxgi),
            Err(BackendError::Unavailable(_))
        ));
    }
}
