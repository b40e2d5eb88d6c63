//! Domain-specific error types for the capture core.
//!
//! Public operations return `Result<T, CoreError>`. Backend adapters
//! report failures as [`BackendError`] so the capture loop can tell a
//! transient stall from a lost device.

use std::time::Duration;
use thiserror::Error;

use crate::claims::Claims;

/// The canonical error type for the session & capture core.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Backend Errors ───────────────────────────────────────────
    /// The display backend reported a failure.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    // ── Session Errors ───────────────────────────────────────────
    /// The caller's role does not carry the claim the command needs.
    #[error("unauthorized: missing claim {}", .claim.name())]
    Unauthorized { claim: Claims },

    /// No viewer is registered under the given connection id.
    #[error("unknown viewer: {0}")]
    UnknownViewer(String),

    /// The requested display is not part of the current enumeration.
    #[error("unknown display: {0}")]
    UnknownDisplay(String),

    /// A capturing-context setting was out of range.
    #[error("invalid setting {name}: {reason}")]
    InvalidSetting {
        name: &'static str,
        reason: String,
    },

    /// The codec name did not match any supported codec.
    #[error("unknown codec: {0}")]
    UnknownCodec(String),

    // ── Pipeline Errors ──────────────────────────────────────────
    /// Encoding a frame for one viewer failed.
    #[error("encode error: {0}")]
    Encode(String),

    /// Serialising or deserialising a protocol message failed.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// A state-machine transition was requested from the wrong state.
    #[error("invalid transition: {0}")]
    InvalidTransition(&'static str),

    /// An internal channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

// ── BackendError ──────────────────────────────────────────────────

/// Failure reported by a [`DisplayBackend`](crate::backend::DisplayBackend).
#[derive(Debug, Error)]
pub enum BackendError {
    /// No new frame arrived within the acquire deadline.
    #[error("acquire timed out after {0:?}")]
    Timeout(Duration),

    /// The capture device was lost (mode change, GPU reset, session switch).
    #[error("device lost: {0}")]
    DeviceLost(String),

    /// The display subsystem cannot be reached at all.
    #[error("display subsystem unavailable: {0}")]
    Unavailable(String),

    /// The backend does not implement this capability.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    /// An input injection call was rejected by the OS.
    #[error("injection failed: {0}")]
    Injection(String),

    /// The named display is not known to the backend.
    #[error("no such display: {0}")]
    NoSuchDisplay(String),

    #[error("{0}")]
    Other(String),
}

impl BackendError {
    /// Errors worth retrying on the next tick without escalation.
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Timeout(_) | BackendError::Injection(_))
    }
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for CoreError {
    fn from(s: String) -> Self {
        CoreError::Other(s)
    }
}

impl From<&str> for CoreError {
    fn from(s: &str) -> Self {
        CoreError::Other(s.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for CoreError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        CoreError::ChannelClosed
    }
}

impl From<Box<bincode::ErrorKind>> for CoreError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        CoreError::Encoding(e.to_string())
    }
}

impl From<image::ImageError> for CoreError {
    fn from(e: image::ImageError) -> Self {
        CoreError::Encode(e.to_string())
    }
}
