//! Per-viewer frame pacing on top of a shared capture cadence.
//!
//! A display is captured at the highest rate any of its viewers asked
//! for. Each viewer has a [`FramePacer`] that admits a frame only when its
//! own interval has elapsed, so a 10 FPS viewer on a 30 FPS display sees
//! every third capture.

use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct FramePacer {
    interval: Duration,
    /// Tolerance for capture-tick jitter, half a display tick.
    slack: Duration,
    next_due: Option<Instant>,
}

impl FramePacer {
    pub fn new(interval: Duration, tick: Duration) -> Self {
        Self {
            interval,
            slack: tick / 2,
            next_due: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Apply a new viewer rate and display tick. The current schedule is
    /// kept; the new interval applies from the next admitted frame.
    pub fn retune(&mut self, interval: Duration, tick: Duration) {
        self.interval = interval;
        self.slack = tick / 2;
    }

    /// Whether a frame may be delivered at `now`. Admitting a frame
    /// advances the schedule by one interval.
    pub fn admit(&mut self, now: Instant) -> bool {
        match self.next_due {
            None => {
                self.next_due = Some(now + self.interval);
                true
            }
            Some(due) if now + self.slack >= due => {
                let next = due + self.interval;
                // After a stall, restart the schedule instead of bursting.
                self.next_due = Some(if next + self.slack <= now {
                    now + self.interval
                } else {
                    next
                });
                true
            }
            Some(_) => false,
        }
    }
}
