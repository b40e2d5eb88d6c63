//! Remote input injection.
//!
//! Viewer input arrives as normalized coordinates relative to the
//! viewer's selected display. [`InputService`] checks the process-wide
//! input switch and the viewer's claims, maps coordinates onto the
//! virtual desktop, and queues the event for a single dispatch thread
//! that owns every call into the backend, so per-host ordering is FIFO.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::backend::{DisplayBackend, NativeMouseEvent};
use crate::claims::Claims;
use crate::display::Rect;
use crate::error::{BackendError, CoreError};
use crate::overlay::OverlayManager;
use crate::protocol::{KeyboardInput, MouseEventKind, MouseInput};
use crate::registry::SessionRegistry;

// ── InputConfig ──────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct InputConfig {
    /// Initial state of the input switch.
    pub enabled: bool,
    /// Extra attempts after a failed injection.
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// Events queued beyond this are dropped.
    pub queue_capacity: usize,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 2,
            retry_delay: Duration::from_millis(5),
            queue_capacity: 1024,
        }
    }
}

/// Map normalized `(x, y)` onto `bounds`, clamped inside the display.
///
/// Returns `None` for non-finite input or an empty display.
pub fn map_to_display(bounds: &Rect, x: f64, y: f64) -> Option<(i32, i32)> {
    if !x.is_finite() || !y.is_finite() || bounds.is_empty() {
        return None;
    }
    let dx = (x.clamp(0.0, 1.0) * bounds.width as f64).round() as i64;
    let dy = (y.clamp(0.0, 1.0) * bounds.height as f64).round() as i64;
    let ax = (bounds.x as i64 + dx).min(bounds.x as i64 + bounds.width as i64 - 1);
    let ay = (bounds.y as i64 + dy).min(bounds.y as i64 + bounds.height as i64 - 1);
    Some((ax as i32, ay as i32))
}

enum InputJob {
    Mouse(NativeMouseEvent),
    Keyboard(KeyboardInput),
    BlockUserInput(bool, oneshot::Sender<Result<(), BackendError>>),
    Flush(oneshot::Sender<()>),
}

// ── InputService ─────────────────────────────────────────────────

pub struct InputService {
    registry: Arc<SessionRegistry>,
    overlays: OverlayManager,
    enabled: AtomicBool,
    queue: mpsc::Sender<InputJob>,
}

impl InputService {
    /// Start the dispatch thread. It exits once the service is dropped.
    pub fn start(
        backend: Arc<dyn DisplayBackend>,
        registry: Arc<SessionRegistry>,
        overlays: OverlayManager,
        config: InputConfig,
    ) -> Result<Self, CoreError> {
        let (queue, jobs) = mpsc::channel(config.queue_capacity.max(1));
        let enabled = AtomicBool::new(config.enabled);
        let dispatcher_config = config.clone();
        thread::Builder::new()
            .name("input-dispatch".into())
            .spawn(move || dispatch(backend, jobs, dispatcher_config))
            .map_err(|e| CoreError::Other(format!("failed to spawn input dispatcher: {e}")))?;
        info!(enabled = config.enabled, "input service started");
        Ok(Self {
            registry,
            overlays,
            enabled,
            queue,
        })
    }

    pub fn is_input_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Flip the process-wide input switch on behalf of a viewer.
    pub fn toggle_input(&self, connection_id: &str, enabled: bool) -> Result<(), CoreError> {
        self.require(connection_id, Claims::TOGGLE_INPUT)?;
        let was = self.enabled.swap(enabled, Ordering::SeqCst);
        if was != enabled {
            info!(viewer = %connection_id, enabled, "remote input toggled");
        }
        Ok(())
    }

    /// Queue a pointer event. Returns whether it was queued; events are
    /// dropped while input is disabled or the viewer lacks the claim.
    pub fn send_mouse_input(&self, connection_id: &str, input: &MouseInput) -> bool {
        if !self.admits(connection_id, Claims::MOUSE_INPUT) {
            return false;
        }
        let Some(display) = self.registry.selected_display(connection_id) else {
            debug!(viewer = %connection_id, "mouse input without a selected display dropped");
            return false;
        };
        let Some((x, y)) = map_to_display(&display.bounds, input.x, input.y) else {
            debug!(viewer = %connection_id, "mouse input with invalid coordinates dropped");
            return false;
        };

        if input.kind == MouseEventKind::Press {
            self.overlays
                .record_click(connection_id, x - display.bounds.x, y - display.bounds.y);
        }

        self.enqueue(
            connection_id,
            InputJob::Mouse(NativeMouseEvent {
                x,
                y,
                kind: input.kind,
                button: input.button,
                wheel_delta: input.wheel_delta,
            }),
        )
    }

    /// Queue a key event, gated like [`send_mouse_input`](Self::send_mouse_input).
    pub fn send_keyboard_input(&self, connection_id: &str, input: &KeyboardInput) -> bool {
        if !self.admits(connection_id, Claims::KEYBOARD_INPUT) {
            return false;
        }
        self.enqueue(connection_id, InputJob::Keyboard(*input))
    }

    /// Block or unblock the local user's physical input. Runs on the
    /// dispatch thread behind any queued events.
    pub async fn block_user_input(&self, connection_id: &str, block: bool) -> Result<(), CoreError> {
        self.require(connection_id, Claims::BLOCK_USER_INPUT)?;
        let (tx, rx) = oneshot::channel();
        self.queue
            .send(InputJob::BlockUserInput(block, tx))
            .await
            .map_err(|_| CoreError::ChannelClosed)?;
        rx.await.map_err(|_| CoreError::ChannelClosed)??;
        info!(viewer = %connection_id, block, "local input block changed");
        Ok(())
    }

    /// Wait until every event queued before this call has been injected.
    pub async fn flush(&self) -> Result<(), CoreError> {
        let (tx, rx) = oneshot::channel();
        self.queue
            .send(InputJob::Flush(tx))
            .await
            .map_err(|_| CoreError::ChannelClosed)?;
        rx.await.map_err(|_| CoreError::ChannelClosed)
    }

    fn require(&self, connection_id: &str, claim: Claims) -> Result<(), CoreError> {
        let viewer = self
            .registry
            .try_get_viewer(connection_id)
            .ok_or_else(|| CoreError::UnknownViewer(connection_id.to_string()))?;
        if !viewer.has_claim(claim) {
            return Err(CoreError::Unauthorized { claim });
        }
        Ok(())
    }

    fn admits(&self, connection_id: &str, claim: Claims) -> bool {
        if !self.is_input_enabled() {
            debug!(viewer = %connection_id, "input disabled; event dropped");
            return false;
        }
        match self.require(connection_id, claim) {
            Ok(()) => true,
            Err(e) => {
                debug!(viewer = %connection_id, "input event dropped: {e}");
                false
            }
        }
    }

    fn enqueue(&self, connection_id: &str, job: InputJob) -> bool {
        match self.queue.try_send(job) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(viewer = %connection_id, "input queue full; event dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

// ── Dispatch thread ──────────────────────────────────────────────

fn dispatch(backend: Arc<dyn DisplayBackend>, mut jobs: mpsc::Receiver<InputJob>, config: InputConfig) {
    debug!(backend = backend.name(), "input dispatcher running");
    while let Some(job) = jobs.blocking_recv() {
        match job {
            InputJob::Mouse(event) => {
                with_retries(&config, "mouse", || backend.inject_mouse(&event));
            }
            InputJob::Keyboard(event) => {
                with_retries(&config, "keyboard", || backend.inject_keyboard(&event));
            }
            InputJob::BlockUserInput(block, reply) => {
                let _ = reply.send(backend.block_user_input(block));
            }
            InputJob::Flush(reply) => {
                let _ = reply.send(());
            }
        }
    }
    debug!("input dispatcher exited");
}

fn with_retries<F>(config: &InputConfig, what: &str, mut inject: F)
where
    F: FnMut() -> Result<(), BackendError>,
{
    let mut attempt = 0;
    loop {
        match inject() {
            Ok(()) => return,
            Err(e) if e.is_transient() && attempt < config.max_retries => {
                attempt += 1;
                debug!(attempt, "{what} injection failed, retrying: {e}");
                thread::sleep(config.retry_delay);
            }
            Err(e) => {
                warn!(attempts = attempt + 1, "{what} injection failed: {e}");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::synthetic::Injected;
    use crate::backend::SyntheticBackend;
    use crate::claims::Role;
    use crate::display::{Display, DisplaySet};
    use crate::overlay::CLICK_INDICATOR;
    use crate::protocol::MouseButton;
    use crate::viewer::{AuthenticationType, Viewer};

    struct Fixture {
        backend: Arc<SyntheticBackend>,
        registry: Arc<SessionRegistry>,
        input: InputService,
    }

    fn fixture(enabled: bool) -> Fixture {
        let displays = vec![
            Display::new("A", Rect::new(0, 0, 1920, 1080), true),
            Display::new("B", Rect::new(1920, 0, 1280, 1024), false),
        ];
        let backend = Arc::new(SyntheticBackend::new(displays.clone()));
        let registry = Arc::new(SessionRegistry::with_displays(DisplaySet::new(displays)));
        let input = InputService::start(
            backend.clone(),
            Arc::clone(&registry),
            OverlayManager::new(Arc::clone(&registry)),
            InputConfig {
                enabled,
                ..Default::default()
            },
        )
        .unwrap();
        Fixture {
            backend,
            registry,
            input,
        }
    }

    fn add(reg: &SessionRegistry, id: &str, role: Role) {
        reg.try_add_viewer(Viewer::new(id, "u", role, AuthenticationType::BearerToken));
    }

    fn mouse_events(backend: &SyntheticBackend) -> Vec<NativeMouseEvent> {
        backend
            .injected()
            .into_iter()
            .filter_map(|i| match i {
                Injected::Mouse(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn centre_maps_to_display_centre() {
        let bounds = Rect::new(0, 0, 1920, 1080);
        assert_eq!(map_to_display(&bounds, 0.5, 0.5), Some((960, 540)));
        // The far edge is clamped inside the display.
        assert_eq!(map_to_display(&bounds, 1.0, 1.0), Some((1919, 1079)));
        assert_eq!(map_to_display(&bounds, -3.0, 0.0), Some((0, 0)));
        assert_eq!(map_to_display(&bounds, f64::NAN, 0.0), None);
    }

    #[test]
    fn secondary_display_is_offset() {
        let bounds = Rect::new(1920, 0, 1280, 1024);
        assert_eq!(map_to_display(&bounds, 0.5, 0.5), Some((2560, 512)));
    }

    #[tokio::test]
    async fn mouse_reaches_backend_in_absolute_pixels() {
        let f = fixture(true);
        add(&f.registry, "a", Role::Owner);
        assert!(f.input.send_mouse_input("a", &MouseInput::move_to(0.5, 0.5)));
        f.input.flush().await.unwrap();
        let events = mouse_events(&f.backend);
        assert_eq!(events.len(), 1);
        assert_eq!((events[0].x, events[0].y), (960, 540));
    }

    #[tokio::test]
    async fn disabled_input_reaches_nothing() {
        let f = fixture(false);
        add(&f.registry, "a", Role::Owner);
        assert!(!f.input.send_mouse_input("a", &MouseInput::move_to(0.5, 0.5)));
        assert!(!f.input.send_keyboard_input("a", &KeyboardInput::press(0x41, 0x1E)));
        f.input.flush().await.unwrap();
        assert!(f.backend.injected().is_empty());
    }

    #[tokio::test]
    async fn observer_input_is_dropped_silently() {
        let f = fixture(true);
        add(&f.registry, "o", Role::Observer);
        assert!(!f.input.send_mouse_input("o", &MouseInput::move_to(0.1, 0.1)));
        f.input.flush().await.unwrap();
        assert!(f.backend.injected().is_empty());
    }

    #[tokio::test]
    async fn events_keep_their_order() {
        let f = fixture(true);
        add(&f.registry, "a", Role::Owner);
        for i in 0..20 {
            f.input
                .send_mouse_input("a", &MouseInput::move_to(i as f64 / 20.0, 0.0));
        }
        f.input.flush().await.unwrap();
        let xs: Vec<i32> = mouse_events(&f.backend).iter().map(|e| e.x).collect();
        let mut sorted = xs.clone();
        sorted.sort();
        assert_eq!(xs.len(), 20);
        assert_eq!(xs, sorted);
    }

    #[tokio::test]
    async fn toggle_requires_claim() {
        let f = fixture(true);
        add(&f.registry, "op", Role::Operator);
        add(&f.registry, "own", Role::Owner);
        assert!(matches!(
            f.input.toggle_input("op", false),
            Err(CoreError::Unauthorized { .. })
        ));
        assert!(f.input.is_input_enabled());
        f.input.toggle_input("own", false).unwrap();
        assert!(!f.input.is_input_enabled());
    }

    #[tokio::test]
    async fn block_user_input_reaches_backend() {
        let f = fixture(true);
        add(&f.registry, "own", Role::Owner);
        f.input.block_user_input("own", true).await.unwrap();
        assert_eq!(f.backend.injected(), vec![Injected::BlockInput(true)]);
    }

    #[tokio::test]
    async fn press_records_click_for_indicator() {
        let f = fixture(true);
        add(&f.registry, "a", Role::Owner);
        f.registry
            .update_overlays("a", |o| o.activate(CLICK_INDICATOR));
        f.input
            .send_mouse_input("a", &MouseInput::press(0.25, 0.5, MouseButton::Left));
        let click = f.registry.overlays("a").unwrap().last_click().unwrap();
        assert_eq!((click.x, click.y), (480, 540));
    }
}
