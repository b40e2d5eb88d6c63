//! In-memory backend with a moving test pattern.
//!
//! Used headless (CI, demos) and by the test suite: displays can be
//! hot-plugged, acquisitions and injections are counted, and failures
//! can be scripted.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::backend::{CursorState, DisplayBackend, NativeMouseEvent};
use crate::display::{Display, Rect};
use crate::error::BackendError;
use crate::frame::{Frame, PixelFormat};
use crate::protocol::KeyboardInput;

/// One recorded injection.
#[derive(Debug, Clone, PartialEq)]
pub enum Injected {
    Mouse(NativeMouseEvent),
    Keyboard(KeyboardInput),
    BlockInput(bool),
}

/// Scripted acquisition outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedFailure {
    Timeout,
    DeviceLost,
}

#[derive(Default)]
struct SyntheticState {
    displays: Vec<Display>,
    failures: VecDeque<ScriptedFailure>,
    fail_forever: bool,
    reinit_fails: bool,
    injected: Vec<Injected>,
    cursor: Option<CursorState>,
}

/// Programmable backend.
pub struct SyntheticBackend {
    state: Mutex<SyntheticState>,
    acquisitions: AtomicU64,
    reinitializations: AtomicU64,
    topology_dirty: AtomicBool,
    /// Incremented every acquisition so consecutive frames differ.
    phase: AtomicU64,
    static_image: AtomicBool,
}

impl SyntheticBackend {
    pub fn new(displays: Vec<Display>) -> Self {
        Self {
            state: Mutex::new(SyntheticState {
                displays,
                ..Default::default()
            }),
            acquisitions: AtomicU64::new(0),
            reinitializations: AtomicU64::new(0),
            topology_dirty: AtomicBool::new(false),
            phase: AtomicU64::new(0),
            static_image: AtomicBool::new(false),
        }
    }

    /// One 1280×720 primary display.
    pub fn with_default_displays() -> Self {
        Self::new(vec![Display::new(
            "synthetic-0",
            Rect::new(0, 0, 1280, 720),
            true,
        )])
    }

    fn state(&self) -> MutexGuard<'_, SyntheticState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Scripting ────────────────────────────────────────────────

    /// Replace the attached displays and flag a topology change.
    pub fn set_displays(&self, displays: Vec<Display>) {
        self.state().displays = displays;
        self.topology_dirty.store(true, Ordering::SeqCst);
    }

    /// Queue failures returned by the next acquisitions, in order.
    pub fn fail_next(&self, failures: impl IntoIterator<Item = ScriptedFailure>) {
        self.state().failures.extend(failures);
    }

    /// Make every acquisition (and re-initialization) fail until cleared.
    pub fn set_broken(&self, broken: bool) {
        let mut state = self.state();
        state.fail_forever = broken;
        state.reinit_fails = broken;
    }

    /// When set, every frame carries identical pixels.
    pub fn set_static(&self, still: bool) {
        self.static_image.store(still, Ordering::SeqCst);
    }

    pub fn set_cursor(&self, cursor: Option<CursorState>) {
        self.state().cursor = cursor;
    }

    // ── Inspection ───────────────────────────────────────────────

    pub fn acquisitions(&self) -> u64 {
        self.acquisitions.load(Ordering::SeqCst)
    }

    pub fn reinitializations(&self) -> u64 {
        self.reinitializations.load(Ordering::SeqCst)
    }

    pub fn injected(&self) -> Vec<Injected> {
        self.state().injected.clone()
    }

    fn render(display: &Display, phase: u64) -> Vec<u8> {
        let w = display.bounds.width as usize;
        let h = display.bounds.height as usize;
        let mut data = vec![0u8; w * h * 4];
        // Diagonal gradient with a bar that moves one step per frame.
        let bar = (phase as usize * 8) % w.max(1);
        for y in 0..h {
            for x in 0..w {
                let o = (y * w + x) * 4;
                let on_bar = x >= bar && x < bar + 8;
                data[o] = if on_bar { 255 } else { (x * 255 / w.max(1)) as u8 };
                data[o + 1] = (y * 255 / h.max(1)) as u8;
                data[o + 2] = if on_bar { 255 } else { 64 };
                data[o + 3] = 255;
            }
        }
        data
    }
}

impl DisplayBackend for SyntheticBackend {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn enumerate(&self) -> Result<Vec<Display>, BackendError> {
        let state = self.state();
        if state.fail_forever {
            return Err(BackendError::Unavailable("synthetic backend broken".into()));
        }
        Ok(state.displays.clone())
    }

    fn acquire_frame(&self, display: &Display, _timeout: Duration) -> Result<Frame, BackendError> {
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        let current = {
            let mut state = self.state();
            if state.fail_forever {
                return Err(BackendError::DeviceLost("synthetic backend broken".into()));
            }
            if let Some(failure) = state.failures.pop_front() {
                return Err(match failure {
                    ScriptedFailure::Timeout => BackendError::Timeout(Duration::ZERO),
                    ScriptedFailure::DeviceLost => {
                        BackendError::DeviceLost("scripted device loss".into())
                    }
                });
            }
            state
                .displays
                .iter()
                .find(|d| d.name == display.name)
                .cloned()
                .ok_or_else(|| BackendError::NoSuchDisplay(display.name.clone()))?
        };

        let phase = if self.static_image.load(Ordering::SeqCst) {
            0
        } else {
            self.phase.fetch_add(1, Ordering::SeqCst)
        };
        let data = Self::render(&current, phase);
        Ok(Frame::packed(
            current.name.clone(),
            current.bounds.width,
            current.bounds.height,
            PixelFormat::Bgra8,
            data,
        ))
    }

    fn cursor(&self) -> Option<CursorState> {
        self.state().cursor
    }

    fn take_topology_change(&self) -> bool {
        self.topology_dirty.swap(false, Ordering::SeqCst)
    }

    fn reinitialize(&self) -> Result<(), BackendError> {
        self.reinitializations.fetch_add(1, Ordering::SeqCst);
        if self.state().reinit_fails {
            return Err(BackendError::Unavailable("synthetic re-init refused".into()));
        }
        Ok(())
    }

    fn inject_mouse(&self, event: &NativeMouseEvent) -> Result<(), BackendError> {
        self.state().injected.push(Injected::Mouse(*event));
        Ok(())
    }

    fn inject_keyboard(&self, event: &KeyboardInput) -> Result<(), BackendError> {
        self.state().injected.push(Injected::Keyboard(*event));
        Ok(())
    }

    fn block_user_input(&self, block: bool) -> Result<(), BackendError> {
        self.state().injected.push(Injected::BlockInput(block));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> SyntheticBackend {
        SyntheticBackend::new(vec![Display::new("s", Rect::new(0, 0, 32, 16), true)])
    }

    #[test]
    fn frames_match_display_geometry() {
        let backend = small();
        let display = backend.enumerate().unwrap().remove(0);
        let frame = backend.acquire_frame(&display, Duration::ZERO).unwrap();
        assert_eq!((frame.width, frame.height), (32, 16));
        assert_eq!(frame.payload.len(), frame.byte_len());
        assert_eq!(backend.acquisitions(), 1);
    }

    #[test]
    fn consecutive_frames_differ_unless_static() {
        let backend = small();
        let display = backend.enumerate().unwrap().remove(0);
        let a = backend.acquire_frame(&display, Duration::ZERO).unwrap();
        let b = backend.acquire_frame(&display, Duration::ZERO).unwrap();
        assert_ne!(a.payload, b.payload);

        backend.set_static(true);
        let c = backend.acquire_frame(&display, Duration::ZERO).unwrap();
        let d = backend.acquire_frame(&display, Duration::ZERO).unwrap();
        assert_eq!(c.payload, d.payload);
    }

    #[test]
    fn scripted_failures_play_in_order() {
        let backend = small();
        let display = backend.enumerate().unwrap().remove(0);
        backend.fail_next([ScriptedFailure::Timeout, ScriptedFailure::DeviceLost]);
        assert!(matches!(
            backend.acquire_frame(&display, Duration::ZERO),
            Err(BackendError::Timeout(_))
        ));
        assert!(matches!(
            backend.acquire_frame(&display, Duration::ZERO),
            Err(BackendError::DeviceLost(_))
        ));
        assert!(backend.acquire_frame(&display, Duration::ZERO).is_ok());
    }

    #[test]
    fn hotplug_flags_topology_once() {
        let backend = small();
        assert!(!backend.take_topology_change());
        backend.set_displays(vec![]);
        assert!(backend.take_topology_change());
        assert!(!backend.take_topology_change());
    }

    #[test]
    fn unplugged_display_cannot_be_acquired() {
        let backend = small();
        let display = backend.enumerate().unwrap().remove(0);
        backend.set_displays(vec![]);
        assert!(matches!(
            backend.acquire_frame(&display, Duration::ZERO),
            Err(BackendError::NoSuchDisplay(_))
        ));
    }
}
