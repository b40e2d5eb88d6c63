//! Display topology types.
//!
//! A [`DisplaySet`] is one complete enumeration produced by a backend.
//! It is never edited in place: a topology change builds a new set and
//! the registry swaps it in as a whole.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

// ── Rect ──────────────────────────────────────────────────────────

/// An axis-aligned rectangle in virtual-desktop coordinates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn contains(&self, px: i32, py: i32) -> bool {
        px >= self.x
            && py >= self.y
            && (px as i64) < self.x as i64 + self.width as i64
            && (py as i64) < self.y as i64 + self.height as i64
    }

    /// Smallest rectangle covering both `self` and `other`.
    pub fn union(&self, other: &Rect) -> Rect {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        let left = self.x.min(other.x);
        let top = self.y.min(other.y);
        let right = (self.x as i64 + self.width as i64).max(other.x as i64 + other.width as i64);
        let bottom =
            (self.y as i64 + self.height as i64).max(other.y as i64 + other.height as i64);
        Rect::new(
            left,
            top,
            (right - left as i64) as u32,
            (bottom - top as i64) as u32,
        )
    }
}

/// Pixel dimensions of a display, sent as `ReceiveScreenSize`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScreenSize {
    pub width: u32,
    pub height: u32,
}

// ── Display ───────────────────────────────────────────────────────

/// One enumerated monitor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Display {
    /// Backend-stable name (`\\.\DISPLAY1`, `HDMI-1`, `synthetic-0`).
    pub name: String,
    pub bounds: Rect,
    pub is_primary: bool,
}

impl Display {
    pub fn new(name: impl Into<String>, bounds: Rect, is_primary: bool) -> Self {
        Self {
            name: name.into(),
            bounds,
            is_primary,
        }
    }

    pub fn size(&self) -> ScreenSize {
        ScreenSize {
            width: self.bounds.width,
            height: self.bounds.height,
        }
    }
}

// ── DisplaySet ────────────────────────────────────────────────────

/// An immutable, cheaply cloneable display enumeration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisplaySet {
    displays: Arc<[Display]>,
}

impl DisplaySet {
    /// Build a set, guaranteeing exactly one primary display when the
    /// list is non-empty (the first entry is promoted if none is marked,
    /// and later duplicates are demoted).
    pub fn new(mut displays: Vec<Display>) -> Self {
        let mut seen_primary = false;
        for d in displays.iter_mut() {
            if d.is_primary {
                if seen_primary {
                    d.is_primary = false;
                }
                seen_primary = true;
            }
        }
        if !seen_primary {
            if let Some(first) = displays.first_mut() {
                first.is_primary = true;
            }
        }
        Self {
            displays: displays.into(),
        }
    }

    pub fn primary(&self) -> Option<&Display> {
        self.displays.iter().find(|d| d.is_primary)
    }

    pub fn get(&self, name: &str) -> Option<&Display> {
        self.displays.iter().find(|d| d.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Display> {
        self.displays.iter()
    }

    pub fn len(&self) -> usize {
        self.displays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.displays.is_empty()
    }

    pub fn to_vec(&self) -> Vec<Display> {
        self.displays.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_displays() -> Vec<Display> {
        vec![
            Display::new("A", Rect::new(0, 0, 1920, 1080), false),
            Display::new("B", Rect::new(1920, 0, 1280, 1024), false),
        ]
    }

    #[test]
    fn first_display_promoted_to_primary() {
        let set = DisplaySet::new(two_displays());
        assert_eq!(set.primary().map(|d| d.name.as_str()), Some("A"));
    }

    #[test]
    fn only_one_primary_survives() {
        let mut list = two_displays();
        list[0].is_primary = true;
        list[1].is_primary = true;
        let set = DisplaySet::new(list);
        assert_eq!(set.iter().filter(|d| d.is_primary).count(), 1);
    }

    #[test]
    fn rect_union_covers_both() {
        let a = Rect::new(0, 0, 10, 10);
        let b = Rect::new(20, 5, 10, 10);
        assert_eq!(a.union(&b), Rect::new(0, 0, 30, 15));
        assert_eq!(Rect::default().union(&b), b);
    }

    #[test]
    fn rect_contains_is_half_open() {
        let r = Rect::new(1920, 0, 1280, 1024);
        assert!(r.contains(1920, 0));
        assert!(!r.contains(3200, 0));
        assert!(!r.contains(1919, 10));
    }
}
