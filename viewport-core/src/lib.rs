//! # viewport-core
//!
//! Session and capture core of the Viewport remote-control host.
//!
//! This crate contains:
//! - **Registry**: `SessionRegistry`, the single owner of connected viewers and their contexts
//! - **Model**: `Viewer`, `CapturingContext`, `Claims`/`Role`, `Display`/`DisplaySet`, `Frame`
//! - **Backends**: the `DisplayBackend` seam with DXGI, X11 and synthetic adapters
//! - **Capture**: `CaptureLoop`, shared per-display acquisition with per-viewer encode and pacing
//! - **Overlays**: `OverlayManager`, per-viewer compositing hints such as the click indicator
//! - **Input**: `InputService`, claim-gated input mapped onto the selected display
//! - **Audio**: `AudioCaptureService`, a ring of PCM chunks with per-subscriber cursors
//! - **Protocol**: `ViewerCommand` / `HostEvent`, the viewer ⇄ host contract
//! - **Host**: `Host`, the composition root that routes commands through the claim check
//! - **Error**: `CoreError`/`BackendError`, typed `thiserror` errors

pub mod audio;
pub mod backend;
pub mod capture;
pub mod claims;
pub mod context;
pub mod display;
pub mod error;
pub mod frame;
pub mod host;
pub mod input;
pub mod overlay;
pub mod protocol;
pub mod registry;
pub mod viewer;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use audio::{AudioCaptureService, AudioChunk, AudioConfig, AudioSourceKind, AudioSubscriber};
pub use backend::{open_backend, BackendKind, DisplayBackend, SyntheticBackend};
pub use capture::{CaptureConfig, CaptureLoop, CaptureState, FrameSlot};
pub use claims::{Claims, Role};
pub use context::{CapturingContext, Codec, MAX_FRAME_RATE};
pub use display::{Display, DisplaySet, Rect, ScreenSize};
pub use error::{BackendError, CoreError};
pub use frame::{Frame, PixelFormat};
pub use host::{AudioFeed, Host, HostOptions};
pub use input::{InputConfig, InputService};
pub use overlay::{OverlayManager, CLICK_INDICATOR};
pub use protocol::{HostEvent, KeyboardInput, MouseButton, MouseInput, ScreenUpdate, ViewerCommand};
pub use registry::{Rejected, RegistryEvent, SessionRegistry, ViewerRegistration};
pub use viewer::{AuthenticationType, Viewer};
