//! Capture loop lifecycle.
//!
//! ```text
//!  Stopped ──► Starting ──► Running ──► Stopping ──► Stopped
//!                 ▲            │            ▲
//!                 │            ▼            │
//!                 └──────── Faulted ────────┘
//! ```

use std::time::Instant;

use crate::error::CoreError;

/// The current phase of the capture loop.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CaptureState {
    /// No workers. Initial state and the state after the last viewer left.
    #[default]
    Stopped,

    /// Workers are being spawned.
    Starting,

    /// At least one display is being captured.
    Running {
        /// When the loop entered `Running`.
        since: Instant,
    },

    /// Workers are being torn down.
    Stopping,

    /// Acquisition failed and re-initialization did not help. Recovers
    /// on a topology change or an explicit restart.
    Faulted { reason: String },
}

impl std::fmt::Display for CaptureState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "Stopped"),
            Self::Starting => write!(f, "Starting"),
            Self::Running { .. } => write!(f, "Running"),
            Self::Stopping => write!(f, "Stopping"),
            Self::Faulted { reason } => write!(f, "Faulted ({reason})"),
        }
    }
}

impl CaptureState {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running { .. })
    }

    pub fn is_faulted(&self) -> bool {
        matches!(self, Self::Faulted { .. })
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped)
    }

    /// Whether workers may exist in this state.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running { .. })
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Valid from: `Stopped`, `Faulted`.
    pub fn begin_start(&mut self) -> Result<(), CoreError> {
        match self {
            Self::Stopped | Self::Faulted { .. } => {
                *self = Self::Starting;
                Ok(())
            }
            _ => Err(CoreError::InvalidTransition(
                "cannot start: not in Stopped or Faulted state",
            )),
        }
    }

    /// Valid from: `Starting`.
    pub fn mark_running(&mut self) -> Result<(), CoreError> {
        match self {
            Self::Starting => {
                *self = Self::Running {
                    since: Instant::now(),
                };
                Ok(())
            }
            _ => Err(CoreError::InvalidTransition(
                "cannot run: not in Starting state",
            )),
        }
    }

    /// Valid from: `Starting`, `Running`.
    pub fn fault(&mut self, reason: impl Into<String>) -> Result<(), CoreError> {
        match self {
            Self::Starting | Self::Running { .. } => {
                *self = Self::Faulted {
                    reason: reason.into(),
                };
                Ok(())
            }
            _ => Err(CoreError::InvalidTransition(
                "cannot fault: not in Starting or Running state",
            )),
        }
    }

    /// Valid from: `Starting`, `Running`, `Faulted`.
    pub fn begin_stop(&mut self) -> Result<(), CoreError> {
        match self {
            Self::Starting | Self::Running { .. } | Self::Faulted { .. } => {
                *self = Self::Stopping;
                Ok(())
            }
            _ => Err(CoreError::InvalidTransition(
                "cannot stop: not in Starting, Running or Faulted state",
            )),
        }
    }

    /// Valid from: `Stopping`.
    pub fn mark_stopped(&mut self) -> Result<(), CoreError> {
        match self {
            Self::Stopping => {
                *self = Self::Stopped;
                Ok(())
            }
            _ => Err(CoreError::InvalidTransition(
                "cannot finish stopping: not in Stopping state",
            )),
        }
    }
}
