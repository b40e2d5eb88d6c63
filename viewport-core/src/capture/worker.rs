//! One capture worker per display being watched.
//!
//! Each tick runs on the blocking pool: acquire → delta → per-viewer
//! transform → publish. The async side only paces ticks and handles
//! failures.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::CursorState;
use crate::capture::delta::{DeltaDetector, DeltaFrame};
use crate::capture::pacing::FramePacer;
use crate::capture::{transform, Shared};
use crate::context::MAX_FRAME_RATE;
use crate::display::{Display, Rect};
use crate::error::BackendError;
use crate::frame::Frame;
use crate::protocol::ScreenUpdate;

// ── WorkerHandle ─────────────────────────────────────────────────

pub(crate) struct WorkerHandle {
    pub(crate) display: Display,
    running: Arc<AtomicBool>,
    rate: watch::Sender<u32>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    pub(crate) fn spawn(shared: Arc<Shared>, display: Display, fps: u32) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let (rate, rate_rx) = watch::channel(fps);
        let task = tokio::spawn(run(
            shared,
            display.clone(),
            rate_rx,
            Arc::clone(&running),
        ));
        Self {
            display,
            running,
            rate,
            task,
        }
    }

    pub(crate) fn rate(&self) -> u32 {
        *self.rate.borrow()
    }

    pub(crate) fn set_rate(&self, fps: u32) {
        self.rate.send_if_modified(|current| {
            if *current == fps {
                return false;
            }
            *current = fps;
            true
        });
    }

    pub(crate) fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.task.abort();
    }
}

// ── Tick state ───────────────────────────────────────────────────

/// Region a viewer has not been shown yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dirty {
    Clean,
    Region(Rect),
    Full,
}

impl Dirty {
    fn merge(self, delta: &DeltaFrame) -> Dirty {
        if delta.full_frame {
            return Dirty::Full;
        }
        match (self, delta.bounding_box()) {
            (Dirty::Full, _) => Dirty::Full,
            (current, None) => current,
            (Dirty::Clean, Some(r)) => Dirty::Region(r),
            (Dirty::Region(a), Some(b)) => Dirty::Region(a.union(&b)),
        }
    }
}

struct ViewerProgress {
    pacer: FramePacer,
    delivered_once: bool,
    context_revision: u64,
    overlay_revision: u64,
    dirty: Dirty,
}

pub(crate) enum TickOutcome {
    Delivered(usize),
    Idle,
    DisplayMissing,
    Failed(BackendError),
}

pub(crate) struct WorkerState {
    display: Display,
    detector: DeltaDetector,
    last_frame: Option<Frame>,
    last_cursor: Option<CursorState>,
    viewers: HashMap<String, ViewerProgress>,
    captures: u64,
    sequence: u64,
    last_timestamp_us: u64,
    /// Consecutive transient acquisition errors.
    transient_streak: u32,
    /// Set after a successful re-initialization, cleared by the next
    /// successful acquisition.
    recovering: bool,
}

impl WorkerState {
    pub(crate) fn new(display: Display, block_size: usize) -> Self {
        Self {
            display,
            detector: DeltaDetector::new(block_size),
            last_frame: None,
            last_cursor: None,
            viewers: HashMap::new(),
            captures: 0,
            sequence: 0,
            last_timestamp_us: 0,
            transient_streak: 0,
            recovering: false,
        }
    }

    /// Drop the cached frame so the next delivery is a full frame.
    pub(crate) fn reset(&mut self) {
        self.detector.reset();
        self.last_frame = None;
        self.transient_streak = 0;
    }

    pub(crate) fn tick(&mut self, shared: &Shared, tick: Duration) -> TickOutcome {
        let now = Instant::now();
        let (frame, delta) = match shared
            .backend
            .acquire_frame(&self.display, shared.config.acquire_timeout)
        {
            Ok(mut frame) => {
                self.transient_streak = 0;
                self.recovering = false;
                self.captures += 1;
                frame.sequence = self.captures;
                let delta = self.detector.detect(&frame);
                shared.remember(frame.clone());
                self.last_frame = Some(frame.clone());
                (frame, delta)
            }
            Err(BackendError::NoSuchDisplay(_)) => return TickOutcome::DisplayMissing,
            Err(e) if e.is_transient() => {
                self.transient_streak += 1;
                if self.transient_streak > shared.config.max_transient_failures {
                    return TickOutcome::Failed(BackendError::Other(format!(
                        "{e} ({} times in a row)",
                        self.transient_streak
                    )));
                }
                // No new image: reuse the last one so joins and setting
                // changes still produce a frame.
                match &self.last_frame {
                    Some(last) => (last.clone(), DeltaFrame::unchanged(last.width, last.height)),
                    None => return TickOutcome::Idle,
                }
            }
            Err(e) => return TickOutcome::Failed(e),
        };

        let cursor = shared.backend.cursor();
        let cursor_moved = cursor != self.last_cursor;
        self.last_cursor = cursor;

        let targets = shared.registry.targets_on(&self.display.name);
        self.viewers
            .retain(|id, _| targets.iter().any(|t| &t.connection_id == id));

        let mut tick_sequence = None;
        let mut delivered = 0;
        for target in &targets {
            let interval = target.context.frame_interval();
            let progress = self
                .viewers
                .entry(target.connection_id.clone())
                .or_insert_with(|| ViewerProgress {
                    pacer: FramePacer::new(interval, tick),
                    delivered_once: false,
                    context_revision: target.context.revision,
                    overlay_revision: target.overlays.revision,
                    dirty: Dirty::Full,
                });
            progress.pacer.retune(interval, tick);
            progress.dirty = progress.dirty.merge(&delta);

            let needs_frame = !progress.delivered_once
                || progress.dirty != Dirty::Clean
                || progress.context_revision != target.context.revision
                || progress.overlay_revision != target.overlays.revision
                || target.overlays.is_animating(now)
                || (cursor_moved && target.context.is_cursor_visible);
            if !needs_frame || !progress.pacer.admit(now) {
                continue;
            }

            let data = match transform::render_for_viewer(&frame, &self.display, cursor, target, now)
            {
                Ok(data) => data,
                Err(e) => {
                    let name = &self.display.name;
                    warn!(viewer = %target.connection_id, display = %name, "encode failed: {e}");
                    continue;
                }
            };

            let sequence = *tick_sequence.get_or_insert_with(|| {
                self.sequence += 1;
                self.sequence
            });
            let elapsed = now.saturating_duration_since(shared.epoch).as_micros() as u64;
            let timestamp_us = elapsed.max(self.last_timestamp_us + 1);
            self.last_timestamp_us = timestamp_us;

            let changed = match progress.dirty {
                Dirty::Region(r) if progress.delivered_once => Some(r),
                _ => None,
            };
            let update = ScreenUpdate {
                display_name: self.display.name.clone(),
                sequence,
                timestamp_us,
                width: frame.width,
                height: frame.height,
                codec: target.context.selected_codec,
                data,
                changed,
            };
            if target.slot.publish(update) {
                delivered += 1;
            }
            progress.delivered_once = true;
            progress.dirty = Dirty::Clean;
            progress.context_revision = target.context.revision;
            progress.overlay_revision = target.overlays.revision;
        }

        if delivered == 0 {
            TickOutcome::Idle
        } else {
            TickOutcome::Delivered(delivered)
        }
    }
}

// ── Worker task ──────────────────────────────────────────────────

async fn run(
    shared: Arc<Shared>,
    watched: Display,
    mut rate: watch::Receiver<u32>,
    running: Arc<AtomicBool>,
) {
    let name = watched.name.clone();
    info!(display = %name, fps = *rate.borrow(), "capture worker started");
    let mut state = WorkerState::new(watched, shared.config.block_size);

    while running.load(Ordering::SeqCst) {
        let started = Instant::now();
        let fps = (*rate.borrow_and_update()).clamp(1, MAX_FRAME_RATE);
        let tick = Duration::from_secs_f64(1.0 / fps as f64);

        let job_shared = Arc::clone(&shared);
        let joined = tokio::task::spawn_blocking(move || {
            let outcome = state.tick(&job_shared, tick);
            (state, outcome)
        })
        .await;
        let (next, outcome) = match joined {
            Ok(result) => result,
            Err(e) => {
                shared.fault(&name, format!("capture task failed: {e}"));
                return;
            }
        };
        state = next;

        match outcome {
            TickOutcome::Failed(e) => {
                warn!(display = %name, "acquisition failed: {e}");
                // One re-initialization per failure episode.
                if state.recovering {
                    shared.fault(&name, format!("{e} (still failing after re-initialization)"));
                    return;
                }
                let backend = Arc::clone(&shared.backend);
                match tokio::task::spawn_blocking(move || backend.reinitialize()).await {
                    Ok(Ok(())) => {
                        info!(display = %name, "backend re-initialized");
                        state.reset();
                        state.recovering = true;
                    }
                    Ok(Err(reinit)) => {
                        shared.fault(&name, format!("{e}; re-initialization failed: {reinit}"));
                        return;
                    }
                    Err(join) => {
                        shared.fault(&name, format!("re-initialization task failed: {join}"));
                        return;
                    }
                }
            }
            TickOutcome::DisplayMissing => {
                debug!(display = %name, "display vanished; requesting re-enumeration");
                shared.request_topology_refresh();
            }
            TickOutcome::Delivered(_) | TickOutcome::Idle => {}
        }

        pace(started, tick).await;
    }
    debug!(display = %name, "capture worker stopped");
}

/// Sleep for the remainder of the tick.
async fn pace(tick_start: Instant, interval: Duration) {
    let elapsed = tick_start.elapsed();
    if elapsed < interval {
        tokio::time::sleep(interval - elapsed).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(blocks: Vec<Rect>, full: bool) -> DeltaFrame {
        DeltaFrame {
            width: 256,
            height: 256,
            changed_blocks: blocks,
            full_frame: full,
        }
    }

    #[test]
    fn dirty_regions_accumulate_between_deliveries() {
        let d = Dirty::Clean
            .merge(&delta(vec![Rect::new(0, 0, 64, 64)], false))
            .merge(&delta(vec![], false))
            .merge(&delta(vec![Rect::new(64, 64, 64, 64)], false));
        assert_eq!(d, Dirty::Region(Rect::new(0, 0, 128, 128)));
    }

    #[test]
    fn full_frame_dominates() {
        let d = Dirty::Clean
            .merge(&delta(vec![], true))
            .merge(&delta(vec![Rect::new(0, 0, 64, 64)], false));
        assert_eq!(d, Dirty::Full);
        assert_eq!(Dirty::Clean.merge(&delta(vec![], false)), Dirty::Clean);
    }
}
