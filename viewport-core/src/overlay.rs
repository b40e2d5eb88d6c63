//! Per-viewer visual overlays.
//!
//! Overlays are compositing hints stored next to each viewer in the
//! [`SessionRegistry`]. They are drawn onto that viewer's private canvas
//! in the transform stage and never touch the shared [`Frame`].
//!
//! [`Frame`]: crate::frame::Frame

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::frame::Canvas;
use crate::registry::SessionRegistry;

/// Ring drawn where the viewer last clicked.
pub const CLICK_INDICATOR: &str = "click-indicator";

/// How long a click ring stays visible.
pub const CLICK_LIFETIME: Duration = Duration::from_millis(600);

const CLICK_RADIUS: i64 = 14;
const CLICK_THICKNESS: i64 = 3;
const CLICK_COLOR: [u8; 3] = [255, 196, 0];

/// Last click seen for a viewer, in display-local pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClickMark {
    pub x: i32,
    pub y: i32,
    pub at: Instant,
}

// ── OverlaySet ───────────────────────────────────────────────────

/// The active overlays of one viewer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OverlaySet {
    active: BTreeSet<String>,
    last_click: Option<ClickMark>,
    /// Bumped by the registry on every effective change.
    pub revision: u64,
}

impl OverlaySet {
    /// Returns `true` if the overlay was not active before.
    pub fn activate(&mut self, name: &str) -> bool {
        self.active.insert(name.to_string())
    }

    /// Returns `true` if the overlay was active before.
    pub fn deactivate(&mut self, name: &str) -> bool {
        self.active.remove(name)
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.active.contains(name)
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn names(&self) -> &BTreeSet<String> {
        &self.active
    }

    pub fn last_click(&self) -> Option<ClickMark> {
        self.last_click
    }

    pub fn set_click(&mut self, mark: ClickMark) {
        self.last_click = Some(mark);
    }

    /// Whether a drawn overlay is still changing and needs new frames.
    pub fn is_animating(&self, now: Instant) -> bool {
        self.is_active(CLICK_INDICATOR)
            && self
                .last_click
                .is_some_and(|c| now.saturating_duration_since(c.at) < CLICK_LIFETIME)
    }

    /// Draw every active overlay onto `canvas`.
    pub fn composite(&self, canvas: &mut Canvas, now: Instant) {
        for name in &self.active {
            match name.as_str() {
                CLICK_INDICATOR => self.draw_click(canvas, now),
                // Unknown overlays are tracked but have no visual.
                _ => {}
            }
        }
    }

    fn draw_click(&self, canvas: &mut Canvas, now: Instant) {
        let Some(click) = self.last_click else {
            return;
        };
        let age = now.saturating_duration_since(click.at);
        if age >= CLICK_LIFETIME {
            return;
        }
        let fade = 1.0 - age.as_secs_f64() / CLICK_LIFETIME.as_secs_f64();
        let alpha = (220.0 * fade) as u8;
        let rgba = [CLICK_COLOR[0], CLICK_COLOR[1], CLICK_COLOR[2], alpha];

        let outer = CLICK_RADIUS * CLICK_RADIUS;
        let inner = (CLICK_RADIUS - CLICK_THICKNESS) * (CLICK_RADIUS - CLICK_THICKNESS);
        for dy in -CLICK_RADIUS..=CLICK_RADIUS {
            for dx in -CLICK_RADIUS..=CLICK_RADIUS {
                let d = dx * dx + dy * dy;
                if d <= outer && d >= inner {
                    canvas.blend(click.x as i64 + dx, click.y as i64 + dy, rgba);
                }
            }
        }
    }
}

// ── OverlayManager ───────────────────────────────────────────────

/// Activation API over the overlay sets held by the registry.
///
/// All operations are scoped to one connection id; a viewer never sees
/// another viewer's overlays.
#[derive(Clone)]
pub struct OverlayManager {
    registry: Arc<SessionRegistry>,
}

impl OverlayManager {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Idempotent. Returns `false` if the viewer is unknown.
    pub fn activate_overlay(&self, name: &str, connection_id: &str) -> bool {
        let result = self
            .registry
            .update_overlays(connection_id, |set| set.activate(name));
        if let Some(changed) = result {
            debug!(viewer = %connection_id, overlay = %name, changed, "overlay activated");
        }
        result.is_some()
    }

    /// Idempotent. Returns `false` if the viewer is unknown.
    pub fn deactivate_overlay(&self, name: &str, connection_id: &str) -> bool {
        let result = self
            .registry
            .update_overlays(connection_id, |set| set.deactivate(name));
        if let Some(changed) = result {
            debug!(viewer = %connection_id, overlay = %name, changed, "overlay deactivated");
        }
        result.is_some()
    }

    /// Active overlay names; empty for unknown viewers.
    pub fn get_active_overlays(&self, connection_id: &str) -> BTreeSet<String> {
        self.registry
            .overlays(connection_id)
            .map(|set| set.names().clone())
            .unwrap_or_default()
    }

    pub fn is_overlay_active(&self, name: &str, connection_id: &str) -> bool {
        self.registry
            .overlays(connection_id)
            .is_some_and(|set| set.is_active(name))
    }

    /// Remember a click at display-local `(x, y)`. Triggers a redraw only
    /// when the click indicator is on for this viewer.
    pub fn record_click(&self, connection_id: &str, x: i32, y: i32) {
        self.registry.update_overlays(connection_id, |set| {
            set.set_click(ClickMark {
                x,
                y,
                at: Instant::now(),
            });
            set.is_active(CLICK_INDICATOR)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claims::Role;
    use crate::display::{Display, DisplaySet, Rect};
    use crate::viewer::{AuthenticationType, Viewer};

    fn manager_with(ids: &[&str]) -> (Arc<SessionRegistry>, OverlayManager) {
        let reg = Arc::new(SessionRegistry::with_displays(DisplaySet::new(vec![
            Display::new("A", Rect::new(0, 0, 64, 64), true),
        ])));
        for id in ids {
            reg.try_add_viewer(Viewer::new(*id, "u", Role::Owner, AuthenticationType::Localhost));
        }
        let mgr = OverlayManager::new(Arc::clone(&reg));
        (reg, mgr)
    }

    #[test]
    fn overlays_are_isolated_between_viewers() {
        let (_reg, mgr) = manager_with(&["a", "b"]);
        assert!(mgr.activate_overlay("click", "a"));
        assert!(mgr.is_overlay_active("click", "a"));
        assert!(!mgr.is_overlay_active("click", "b"));
        assert!(mgr.get_active_overlays("b").is_empty());
    }

    #[test]
    fn activation_is_idempotent() {
        let (reg, mgr) = manager_with(&["a"]);
        mgr.activate_overlay(CLICK_INDICATOR, "a");
        let rev = reg.overlays("a").unwrap().revision;
        mgr.activate_overlay(CLICK_INDICATOR, "a");
        assert_eq!(reg.overlays("a").unwrap().revision, rev);
        assert_eq!(mgr.get_active_overlays("a").len(), 1);

        mgr.deactivate_overlay(CLICK_INDICATOR, "a");
        mgr.deactivate_overlay(CLICK_INDICATOR, "a");
        assert!(mgr.get_active_overlays("a").is_empty());
    }

    #[test]
    fn unknown_viewer_is_refused() {
        let (_reg, mgr) = manager_with(&[]);
        assert!(!mgr.activate_overlay("click", "nobody"));
        assert!(!mgr.is_overlay_active("click", "nobody"));
    }

    #[derive(Clone, Default)]
    struct LogBuffer(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn logged(f: impl FnOnce()) -> String {
        let buffer = LogBuffer::default();
        let writer = buffer.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        tracing::subscriber::with_default(subscriber, f);
        let bytes = buffer.0.lock().unwrap().clone();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn activation_is_logged_only_for_known_viewers() {
        let (_reg, mgr) = manager_with(&["a"]);
        let ghost = logged(|| {
            mgr.activate_overlay(CLICK_INDICATOR, "ghost");
            mgr.deactivate_overlay(CLICK_INDICATOR, "ghost");
        });
        assert!(!ghost.contains("overlay activated"));
        assert!(!ghost.contains("overlay deactivated"));

        let known = logged(|| {
            mgr.activate_overlay(CLICK_INDICATOR, "a");
            mgr.deactivate_overlay(CLICK_INDICATOR, "a");
        });
        assert!(known.contains("overlay activated"));
        assert!(known.contains("overlay deactivated"));
    }

    #[test]
    fn click_ring_draws_only_while_fresh() {
        let mut set = OverlaySet::default();
        set.activate(CLICK_INDICATOR);
        let now = Instant::now();
        set.set_click(ClickMark { x: 32, y: 32, at: now });

        let mut canvas = Canvas::new(64, 64);
        set.composite(&mut canvas, now);
        // On the ring, straight right of the centre.
        assert_ne!(canvas.pixel(32 + CLICK_RADIUS as u32 - 1, 32), [0, 0, 0, 0]);
        // The centre stays untouched.
        assert_eq!(canvas.pixel(32, 32), [0, 0, 0, 0]);
        assert!(set.is_animating(now));

        let later = now + CLICK_LIFETIME;
        let mut canvas = Canvas::new(64, 64);
        set.composite(&mut canvas, later);
        assert!(canvas.pixels.iter().all(|&b| b == 0));
        assert!(!set.is_animating(later));
    }

    #[test]
    fn click_only_redraws_when_indicator_on() {
        let (reg, mgr) = manager_with(&["a"]);
        mgr.record_click("a", 1, 1);
        assert_eq!(reg.overlays("a").unwrap().revision, 0);
        mgr.activate_overlay(CLICK_INDICATOR, "a");
        mgr.record_click("a", 2, 2);
        assert_eq!(reg.overlays("a").unwrap().revision, 2);
    }
}
