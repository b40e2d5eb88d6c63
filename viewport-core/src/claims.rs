//! Authorization claims carried by a viewer.
//!
//! Each inbound command is gated by exactly one claim. Claims are kept
//! as a bit set on the [`Viewer`](crate::viewer::Viewer) so checks on the
//! hot input path are a single mask test.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Named authorization grants.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Claims: u32 {
        const CHANGE_SELECTED_SCREEN = 1 << 0;
        const SET_FRAME_RATE         = 1 << 1;
        const SET_IMAGE_QUALITY      = 1 << 2;
        const SET_CODEC              = 1 << 3;
        const TOGGLE_DRAW_CURSOR     = 1 << 4;
        const THUMBNAIL              = 1 << 5;
        const MOUSE_INPUT            = 1 << 8;
        const KEYBOARD_INPUT         = 1 << 9;
        const TOGGLE_INPUT           = 1 << 10;
        const BLOCK_USER_INPUT       = 1 << 11;
        const TOGGLE_CLICK_INDICATOR = 1 << 12;
        const RECEIVE_AUDIO          = 1 << 16;
    }
}

const CLAIM_NAMES: &[(Claims, &str)] = &[
    (Claims::CHANGE_SELECTED_SCREEN, "Screen.ChangeSelectedScreen"),
    (Claims::SET_FRAME_RATE, "Screen.SetFrameRate"),
    (Claims::SET_IMAGE_QUALITY, "Screen.SetImageQuality"),
    (Claims::SET_CODEC, "Screen.SetCodec"),
    (Claims::TOGGLE_DRAW_CURSOR, "Screen.ToggleDrawCursor"),
    (Claims::THUMBNAIL, "Screen.Thumbnail"),
    (Claims::MOUSE_INPUT, "Input.MouseInput"),
    (Claims::KEYBOARD_INPUT, "Input.KeyboardInput"),
    (Claims::TOGGLE_INPUT, "Input.ToggleInput"),
    (Claims::BLOCK_USER_INPUT, "Input.BlockUserInput"),
    (Claims::TOGGLE_CLICK_INDICATOR, "Input.ToggleClickIndicator"),
    (Claims::RECEIVE_AUDIO, "Audio.Receive"),
];

impl Claims {
    /// Canonical policy name of a single claim, e.g. `Input.MouseInput`.
    ///
    /// Returns `"<multiple>"` for combined sets and `"<none>"` for the
    /// empty set.
    pub fn name(self) -> &'static str {
        if self.is_empty() {
            return "<none>";
        }
        CLAIM_NAMES
            .iter()
            .find(|(claim, _)| *claim == self)
            .map(|(_, name)| *name)
            .unwrap_or("<multiple>")
    }

    /// Parse a canonical claim name.
    pub fn from_claim_name(name: &str) -> Option<Claims> {
        CLAIM_NAMES
            .iter()
            .find(|(_, n)| n.eq_ignore_ascii_case(name))
            .map(|(claim, _)| *claim)
    }

    /// Every claim relating to screen presentation.
    pub fn screen() -> Claims {
        Claims::CHANGE_SELECTED_SCREEN
            | Claims::SET_FRAME_RATE
            | Claims::SET_IMAGE_QUALITY
            | Claims::SET_CODEC
            | Claims::TOGGLE_DRAW_CURSOR
            | Claims::THUMBNAIL
    }

    /// Every claim relating to input control.
    pub fn input() -> Claims {
        Claims::MOUSE_INPUT
            | Claims::KEYBOARD_INPUT
            | Claims::TOGGLE_INPUT
            | Claims::BLOCK_USER_INPUT
            | Claims::TOGGLE_CLICK_INDICATOR
    }
}

// ── Role ──────────────────────────────────────────────────────────

/// Coarse viewer role; maps to a default claim set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Full control, including the process-wide input switches.
    Owner,
    /// May view and drive input but not flip host-wide switches.
    Operator,
    /// View only.
    #[default]
    Observer,
}

impl Role {
    pub fn default_claims(self) -> Claims {
        match self {
            Role::Owner => Claims::all(),
            Role::Operator => {
                Claims::screen()
                    | Claims::MOUSE_INPUT
                    | Claims::KEYBOARD_INPUT
                    | Claims::TOGGLE_CLICK_INDICATOR
                    | Claims::RECEIVE_AUDIO
            }
            Role::Observer => {
                Claims::CHANGE_SELECTED_SCREEN | Claims::THUMBNAIL | Claims::RECEIVE_AUDIO
            }
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Owner => write!(f, "owner"),
            Role::Operator => write!(f, "operator"),
            Role::Observer => write!(f, "observer"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip_through_lookup() {
        for (claim, name) in CLAIM_NAMES {
            assert_eq!(claim.name(), *name);
            assert_eq!(Claims::from_claim_name(name), Some(*claim));
        }
        assert_eq!(Claims::from_claim_name("Screen.Nope"), None);
    }

    #[test]
    fn combined_set_has_no_single_name() {
        assert_eq!((Claims::MOUSE_INPUT | Claims::KEYBOARD_INPUT).name(), "<multiple>");
        assert_eq!(Claims::empty().name(), "<none>");
    }

    #[test]
    fn observer_cannot_drive_input() {
        let claims = Role::Observer.default_claims();
        assert!(!claims.contains(Claims::MOUSE_INPUT));
        assert!(!claims.contains(Claims::SET_CODEC));
        assert!(claims.contains(Claims::CHANGE_SELECTED_SCREEN));
    }

    #[test]
    fn operator_cannot_flip_host_switches() {
        let claims = Role::Operator.default_claims();
        assert!(claims.contains(Claims::MOUSE_INPUT));
        assert!(!claims.contains(Claims::TOGGLE_INPUT));
        assert!(!claims.contains(Claims::BLOCK_USER_INPUT));
    }
}
