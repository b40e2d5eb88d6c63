//! Latest-frame mailbox for one viewer.
//!
//! The capture loop publishes into the slot; the transport either polls
//! it ([`FrameSlot::next_frame`]) or awaits it ([`FrameSlot::wait`]). A
//! newer frame overwrites an unread older one, so a slow consumer never
//! causes a burst and never sees frames out of order.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use crate::protocol::ScreenUpdate;

#[derive(Debug, Default)]
struct SlotState {
    latest: Option<ScreenUpdate>,
    last_published: Option<(String, u64)>,
    published: u64,
    closed: bool,
}

/// Single-consumer, overwrite-on-publish frame mailbox.
#[derive(Debug, Default)]
pub struct FrameSlot {
    state: Mutex<SlotState>,
    notify: Notify,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Offer a frame. Returns `false` (and drops the frame) when the slot
    /// is closed or the frame is not newer than the last one published
    /// for the same display.
    pub fn publish(&self, update: ScreenUpdate) -> bool {
        {
            let mut state = self.state();
            if state.closed {
                return false;
            }
            if let Some((display, seq)) = &state.last_published {
                if *display == update.display_name && update.sequence <= *seq {
                    return false;
                }
            }
            state.last_published = Some((update.display_name.clone(), update.sequence));
            state.published += 1;
            state.latest = Some(update);
        }
        self.notify.notify_one();
        true
    }

    /// Non-blocking: the newest unread frame, or `None`.
    pub fn next_frame(&self) -> Option<ScreenUpdate> {
        self.state().latest.take()
    }

    /// Wait for the next frame. Resolves to `None` once the slot is closed
    /// and drained.
    pub async fn wait(&self) -> Option<ScreenUpdate> {
        loop {
            {
                let mut state = self.state();
                if let Some(update) = state.latest.take() {
                    return Some(update);
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Close the slot; pending and future frames are discarded.
    pub fn close(&self) {
        {
            let mut state = self.state();
            state.closed = true;
            state.latest = None;
        }
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Number of frames accepted since creation.
    pub fn published_count(&self) -> u64 {
        self.state().published
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Codec;
    use bytes::Bytes;
    use std::sync::Arc;
    use std::time::Duration;

    fn update(seq: u64) -> ScreenUpdate {
        ScreenUpdate {
            display_name: "d0".into(),
            sequence: seq,
            timestamp_us: seq * 1000,
            width: 1,
            height: 1,
            codec: Codec::Zstd,
            data: Bytes::new(),
            changed: None,
        }
    }

    #[test]
    fn empty_slot_polls_none() {
        let slot = FrameSlot::new();
        assert!(slot.next_frame().is_none());
    }

    #[test]
    fn newer_frame_overwrites_unread() {
        let slot = FrameSlot::new();
        assert!(slot.publish(update(1)));
        assert!(slot.publish(update(2)));
        assert_eq!(slot.next_frame().map(|u| u.sequence), Some(2));
        assert!(slot.next_frame().is_none());
    }

    #[test]
    fn stale_frame_is_rejected() {
        let slot = FrameSlot::new();
        assert!(slot.publish(update(5)));
        assert!(!slot.publish(update(5)));
        assert!(!slot.publish(update(3)));
        assert_eq!(slot.published_count(), 1);
    }

    #[test]
    fn closed_slot_discards() {
        let slot = FrameSlot::new();
        slot.publish(update(1));
        slot.close();
        assert!(slot.next_frame().is_none());
        assert!(!slot.publish(update(2)));
    }

    #[test]
    fn wait_is_pending_until_publish() {
        let slot = FrameSlot::new();
        let mut wait = tokio_test::task::spawn(slot.wait());
        tokio_test::assert_pending!(wait.poll());
        slot.publish(update(3));
        assert!(wait.is_woken());
        let ready = tokio_test::assert_ready!(wait.poll());
        assert_eq!(ready.map(|u| u.sequence), Some(3));
    }

    #[tokio::test]
    async fn wait_wakes_on_publish_and_close() {
        let slot = Arc::new(FrameSlot::new());
        let waiter = tokio::spawn({
            let slot = slot.clone();
            async move { slot.wait().await.map(|u| u.sequence) }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        slot.publish(update(7));
        assert_eq!(waiter.await.unwrap(), Some(7));

        let waiter = tokio::spawn({
            let slot = slot.clone();
            async move { slot.wait().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        slot.close();
        assert!(waiter.await.unwrap().is_none());
    }
}
