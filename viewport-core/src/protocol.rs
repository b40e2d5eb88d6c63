//! Viewer ⇄ host message contract.
//!
//! The transport is an external collaborator; this module only fixes the
//! method/event surface it carries.
//!
//! ```text
//! Viewer ──[ViewerCommand]──────────────► Host   (claim-gated)
//! Host   ──[HostEvent]──────────────────► Viewer (ReceiveScreenUpdate,
//!                                                 ReceiveDisplays, …)
//! ```
//!
//! Both directions are bincode-encoded serde types.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::audio::AudioChunk;
use crate::claims::Claims;
use crate::context::Codec;
use crate::display::{Display, Rect, ScreenSize};
use crate::error::CoreError;

// ── Input DTOs ────────────────────────────────────────────────────

/// Mouse button identifiers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum MouseButton {
    #[default]
    None,
    Left,
    Right,
    Middle,
    X1,
    X2,
}

/// Type of mouse event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum MouseEventKind {
    Move,
    Press,
    Release,
    /// Wheel rotation; `wheel_delta` carries the amount.
    Wheel,
}

/// Pointer event in **normalized** coordinates of the viewer's selected
/// display: `(0.0, 0.0)` is the top-left corner, `(1.0, 1.0)` the
/// bottom-right.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct MouseInput {
    pub x: f64,
    pub y: f64,
    pub kind: MouseEventKind,
    pub button: MouseButton,
    /// Wheel delta in notches × 120 (positive = away from the user).
    pub wheel_delta: i32,
}

impl MouseInput {
    pub fn move_to(x: f64, y: f64) -> Self {
        Self {
            x,
            y,
            kind: MouseEventKind::Move,
            button: MouseButton::None,
            wheel_delta: 0,
        }
    }

    pub fn press(x: f64, y: f64, button: MouseButton) -> Self {
        Self {
            x,
            y,
            kind: MouseEventKind::Press,
            button,
            wheel_delta: 0,
        }
    }

    pub fn release(x: f64, y: f64, button: MouseButton) -> Self {
        Self {
            x,
            y,
            kind: MouseEventKind::Release,
            button,
            wheel_delta: 0,
        }
    }

    pub fn wheel(x: f64, y: f64, delta: i32) -> Self {
        Self {
            x,
            y,
            kind: MouseEventKind::Wheel,
            button: MouseButton::None,
            wheel_delta: delta,
        }
    }
}

/// Key press or release.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum KeyAction {
    Press,
    Release,
}

/// Keyboard event. Backends prefer `scan_code` when non-zero and fall
/// back to `virtual_key`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyboardInput {
    /// Windows virtual-key code.
    pub virtual_key: u16,
    /// Hardware scan code; values above 0xFF carry the 0xE0 extended prefix.
    pub scan_code: u16,
    pub action: KeyAction,
}

impl KeyboardInput {
    pub fn press(virtual_key: u16, scan_code: u16) -> Self {
        Self {
            virtual_key,
            scan_code,
            action: KeyAction::Press,
        }
    }

    pub fn release(virtual_key: u16, scan_code: u16) -> Self {
        Self {
            virtual_key,
            scan_code,
            action: KeyAction::Release,
        }
    }
}

// ── Inbound commands ──────────────────────────────────────────────

/// A command invoked by a viewer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ViewerCommand {
    ChangeSelectedScreen(String),
    SetFrameRate(u32),
    SetImageQuality(u8),
    SetCodec(String),
    ToggleDrawCursor(bool),
    SendMouseInput(MouseInput),
    SendKeyboardInput(KeyboardInput),
    ToggleInput(bool),
    BlockUserInput(bool),
    ToggleClickIndicator(bool),
    ToggleAudio(bool),
    RequestThumbnail { max_width: u32, max_height: u32 },
    RequestDisplays,
}

impl ViewerCommand {
    /// The claim required to invoke this command, if any.
    pub fn required_claim(&self) -> Option<Claims> {
        let claim = match self {
            ViewerCommand::ChangeSelectedScreen(_) => Claims::CHANGE_SELECTED_SCREEN,
            ViewerCommand::SetFrameRate(_) => Claims::SET_FRAME_RATE,
            ViewerCommand::SetImageQuality(_) => Claims::SET_IMAGE_QUALITY,
            ViewerCommand::SetCodec(_) => Claims::SET_CODEC,
            ViewerCommand::ToggleDrawCursor(_) => Claims::TOGGLE_DRAW_CURSOR,
            ViewerCommand::SendMouseInput(_) => Claims::MOUSE_INPUT,
            ViewerCommand::SendKeyboardInput(_) => Claims::KEYBOARD_INPUT,
            ViewerCommand::ToggleInput(_) => Claims::TOGGLE_INPUT,
            ViewerCommand::BlockUserInput(_) => Claims::BLOCK_USER_INPUT,
            ViewerCommand::ToggleClickIndicator(_) => Claims::TOGGLE_CLICK_INDICATOR,
            ViewerCommand::ToggleAudio(_) => Claims::RECEIVE_AUDIO,
            ViewerCommand::RequestThumbnail { .. } => Claims::THUMBNAIL,
            ViewerCommand::RequestDisplays => return None,
        };
        Some(claim)
    }

    /// Fire-and-forget commands are dropped silently when unauthorized
    /// instead of producing an error response.
    pub fn is_fire_and_forget(&self) -> bool {
        matches!(
            self,
            ViewerCommand::SendMouseInput(_) | ViewerCommand::SendKeyboardInput(_)
        )
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CoreError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CoreError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

// ── Outbound events ───────────────────────────────────────────────

/// One encoded frame delivered to one viewer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScreenUpdate {
    pub display_name: String,
    /// Per-display capture sequence number (strictly increasing per viewer).
    pub sequence: u64,
    /// Capture time in microseconds since the capture loop started.
    pub timestamp_us: u64,
    pub width: u32,
    pub height: u32,
    pub codec: Codec,
    pub data: Bytes,
    /// Region that changed since the previous capture of this display;
    /// `None` means the whole frame should be treated as new.
    pub changed: Option<Rect>,
}

/// Host → viewer event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum HostEvent {
    ReceiveScreenUpdate(ScreenUpdate),
    ReceiveDisplays(Vec<Display>),
    ReceiveScreenSize(ScreenSize),
    ReceiveThumbnail(Bytes),
    /// Host audio for viewers that enabled it.
    ReceiveAudioChunk(AudioChunk),
    /// The capture loop faulted; frames stop until it recovers.
    CaptureError(String),
    /// An explicit command was rejected.
    CommandFailed(String),
}

impl HostEvent {
    pub fn to_bytes(&self) -> Result<Vec<u8>, CoreError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CoreError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_command_but_display_list_is_gated() {
        assert_eq!(ViewerCommand::RequestDisplays.required_claim(), None);
        assert_eq!(
            ViewerCommand::SetCodec("png".into()).required_claim(),
            Some(Claims::SET_CODEC)
        );
        assert_eq!(
            ViewerCommand::SendMouseInput(MouseInput::move_to(0.1, 0.1)).required_claim(),
            Some(Claims::MOUSE_INPUT)
        );
    }

    #[test]
    fn only_input_is_fire_and_forget() {
        assert!(ViewerCommand::SendKeyboardInput(KeyboardInput::press(0x41, 0x1E)).is_fire_and_forget());
        assert!(!ViewerCommand::ToggleInput(false).is_fire_and_forget());
    }

    #[test]
    fn command_wire_format_decodes() {
        let cmd = ViewerCommand::RequestThumbnail {
            max_width: 320,
            max_height: 200,
        };
        let bytes = cmd.to_bytes().unwrap();
        assert_eq!(ViewerCommand::from_bytes(&bytes).unwrap(), cmd);
    }

    #[test]
    fn garbage_is_an_encoding_error() {
        let err = HostEvent::from_bytes(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF]).unwrap_err();
        assert!(matches!(err, CoreError::Encoding(_)));
    }
}
