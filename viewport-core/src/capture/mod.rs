//! Frame capture loop.
//!
//! Orchestrates the per-display pipeline:
//!
//! 1. A supervisor task watches the [`SessionRegistry`] and keeps one
//!    worker per display that at least one viewer watches, ticking at
//!    the highest frame rate among those viewers.
//! 2. Each worker acquires a frame from the [`DisplayBackend`], runs
//!    [`DeltaDetector`](delta::DeltaDetector), then for every viewer whose
//!    pacer admits a frame composites cursor and overlays, encodes with
//!    the viewer's codec and publishes into the viewer's [`FrameSlot`].
//! 3. The supervisor polls the backend for topology changes, installs the
//!    new display set and sends `ReceiveDisplays` to every viewer.
//!
//! The loop starts when the first viewer is added and stops when the last
//! one leaves. A hard acquisition failure that survives one backend
//! re-initialization faults the loop until the topology changes or
//! [`CaptureLoop::restart`] is called.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::backend::DisplayBackend;
use crate::display::DisplaySet;
use crate::error::CoreError;
use crate::frame::Frame;
use crate::protocol::{HostEvent, ScreenUpdate};
use crate::registry::{RegistryEvent, SessionRegistry};

pub mod delta;
pub mod encoder;
pub mod pacing;
pub mod slot;
pub mod state;
pub mod thumbnail;
pub mod transform;
mod worker;

pub use slot::FrameSlot;
pub use state::CaptureState;

use thumbnail::ThumbnailThrottle;
use worker::WorkerHandle;

// ── CaptureConfig ────────────────────────────────────────────────

/// Tuning knobs for [`CaptureLoop`].
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Longest a single backend acquisition may block.
    pub acquire_timeout: Duration,
    /// Delta detection tile size in pixels.
    pub block_size: usize,
    /// How often the backend is asked about hot-plug events.
    pub topology_poll_interval: Duration,
    /// Minimum spacing between two rendered thumbnails.
    pub thumbnail_interval: Duration,
    /// Consecutive transient errors (timeouts) tolerated before they are
    /// handled like a hard failure.
    pub max_transient_failures: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_millis(100),
            block_size: delta::DEFAULT_BLOCK_SIZE,
            topology_poll_interval: Duration::from_millis(500),
            thumbnail_interval: Duration::from_secs(1),
            max_transient_failures: 30,
        }
    }
}

// ── Shared ───────────────────────────────────────────────────────

pub(crate) struct Shared {
    pub(crate) backend: Arc<dyn DisplayBackend>,
    pub(crate) registry: Arc<SessionRegistry>,
    pub(crate) config: CaptureConfig,
    /// Reference point for `ScreenUpdate::timestamp_us`.
    pub(crate) epoch: Instant,
    state: watch::Sender<CaptureState>,
    workers: Mutex<HashMap<String, WorkerHandle>>,
    latest: Mutex<HashMap<String, Frame>>,
    thumbnails: ThumbnailThrottle,
    wake: Notify,
    topology_hint: AtomicBool,
    shutdown: AtomicBool,
}

impl Shared {
    fn workers(&self) -> MutexGuard<'_, HashMap<String, WorkerHandle>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn latest(&self) -> MutexGuard<'_, HashMap<String, Frame>> {
        self.latest.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply a validated transition; observers are only woken on success.
    fn transition<F>(&self, f: F) -> Result<(), CoreError>
    where
        F: FnOnce(&mut CaptureState) -> Result<(), CoreError>,
    {
        let mut result = Ok(());
        self.state.send_if_modified(|current| {
            let mut next = current.clone();
            match f(&mut next) {
                Ok(()) => {
                    debug!(from = %current, to = %next, "capture state");
                    *current = next;
                    true
                }
                Err(e) => {
                    result = Err(e);
                    false
                }
            }
        });
        result
    }

    pub(crate) fn remember(&self, frame: Frame) {
        self.latest().insert(frame.display_name.clone(), frame);
    }

    pub(crate) fn request_topology_refresh(&self) {
        self.topology_hint.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    /// Fault the loop. Only the first fault raises `CaptureError`.
    pub(crate) fn fault(&self, display_name: &str, reason: String) {
        if self.transition(|s| s.fault(reason.clone())).is_err() {
            return;
        }
        error!(display = %display_name, "capture faulted: {reason}");
        let notified = self
            .registry
            .broadcast(HostEvent::CaptureError(reason));
        debug!(viewers = notified, "capture error delivered");
        self.wake.notify_one();
    }

    fn stop_workers(workers: &mut HashMap<String, WorkerHandle>) {
        for (_, worker) in workers.drain() {
            worker.stop();
        }
    }

    /// Bring the worker set in line with current demand.
    fn reconcile(self: &Arc<Self>) {
        let state = self.state.borrow().clone();
        let mut workers = self.workers();

        if state.is_faulted() || self.shutdown.load(Ordering::SeqCst) {
            Self::stop_workers(&mut workers);
            return;
        }

        let demand = self.registry.demanded_displays();
        let displays = self.registry.displays();

        if demand.is_empty() {
            if state.is_active() || !workers.is_empty() {
                let _ = self.transition(CaptureState::begin_stop);
                Self::stop_workers(&mut workers);
                self.latest().clear();
                let _ = self.transition(CaptureState::mark_stopped);
                info!("capture stopped; no viewers");
            }
            return;
        }

        if state.is_stopped() && self.transition(CaptureState::begin_start).is_ok() {
            info!(displays = demand.len(), "capture starting");
        }

        workers.retain(|name, worker| {
            let keep =
                demand.contains_key(name) && displays.get(name) == Some(&worker.display);
            if !keep {
                worker.stop();
                self.latest().remove(name);
            }
            keep
        });

        for (name, fps) in &demand {
            match workers.get(name) {
                Some(worker) => worker.set_rate(*fps),
                None => match displays.get(name) {
                    Some(display) => {
                        let handle = WorkerHandle::spawn(Arc::clone(self), display.clone(), *fps);
                        workers.insert(name.clone(), handle);
                    }
                    None => warn!(display = %name, "demanded display is not enumerated"),
                },
            }
        }

        if self.state.borrow().clone() == CaptureState::Starting
            && self.transition(CaptureState::mark_running).is_ok()
        {
            info!(workers = workers.len(), "capture running");
        }
    }

    /// Re-enumerate; on change install the new set, tell every viewer, and
    /// leave `Faulted`.
    async fn refresh_topology(&self) {
        let backend = Arc::clone(&self.backend);
        let displays = match tokio::task::spawn_blocking(move || backend.enumerate()).await {
            Ok(Ok(displays)) => DisplaySet::new(displays),
            Ok(Err(e)) => {
                warn!("display enumeration failed: {e}");
                return;
            }
            Err(e) => {
                warn!("display enumeration task failed: {e}");
                return;
            }
        };
        if displays == self.registry.displays() {
            debug!("topology change reported but display set is unchanged");
            return;
        }

        let reassigned = self.registry.replace_displays(displays.clone());
        let notified = self
            .registry
            .broadcast(HostEvent::ReceiveDisplays(displays.to_vec()));
        info!(displays = displays.len(), viewers = notified, "display topology changed");

        for id in &reassigned {
            if let Some(display) = self.registry.selected_display(id) {
                self.registry
                    .send_to(id, HostEvent::ReceiveScreenSize(display.size()));
            }
        }

        if self.state.borrow().is_faulted() && self.transition(CaptureState::begin_start).is_ok()
        {
            info!("capture recovering after topology change");
        }
    }

    async fn topology_changed(&self) -> bool {
        let backend = Arc::clone(&self.backend);
        tokio::task::spawn_blocking(move || backend.take_topology_change())
            .await
            .unwrap_or(false)
    }
}

async fn supervise(shared: Arc<Shared>, mut events: broadcast::Receiver<RegistryEvent>) {
    let mut poll = tokio::time::interval(shared.config.topology_poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
    shared.reconcile();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "registry events lagged; reconciling");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = poll.tick() => {
                if shared.topology_changed().await {
                    shared.topology_hint.store(true, Ordering::SeqCst);
                }
            }
            _ = shared.wake.notified() => {}
        }

        if shared.shutdown.load(Ordering::SeqCst) {
            break;
        }
        if shared.topology_hint.swap(false, Ordering::SeqCst) {
            shared.refresh_topology().await;
        }
        shared.reconcile();
    }

    Shared::stop_workers(&mut shared.workers());
    debug!("capture supervisor exited");
}

// ── CaptureLoop ──────────────────────────────────────────────────

/// Handle to the running capture pipeline.
///
/// Must be created inside a Tokio runtime. Dropping the handle stops the
/// supervisor and every worker.
pub struct CaptureLoop {
    shared: Arc<Shared>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl CaptureLoop {
    pub fn spawn(
        backend: Arc<dyn DisplayBackend>,
        registry: Arc<SessionRegistry>,
        config: CaptureConfig,
    ) -> Self {
        let (state, _) = watch::channel(CaptureState::Stopped);
        let events = registry.subscribe();
        let shared = Arc::new(Shared {
            backend,
            registry,
            thumbnails: ThumbnailThrottle::new(config.thumbnail_interval),
            config,
            epoch: Instant::now(),
            state,
            workers: Mutex::new(HashMap::new()),
            latest: Mutex::new(HashMap::new()),
            wake: Notify::new(),
            topology_hint: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        });
        let supervisor = tokio::spawn(supervise(Arc::clone(&shared), events));
        Self {
            shared,
            supervisor: Mutex::new(Some(supervisor)),
        }
    }

    pub fn state(&self) -> CaptureState {
        self.shared.state.borrow().clone()
    }

    /// Watch lifecycle transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<CaptureState> {
        self.shared.state.subscribe()
    }

    /// Non-blocking poll of a viewer's newest undelivered frame.
    pub fn next_frame(&self, connection_id: &str) -> Option<ScreenUpdate> {
        self.shared.registry.frame_slot(connection_id)?.next_frame()
    }

    /// Current tick rate of the worker capturing `display_name`.
    pub fn tick_rate(&self, display_name: &str) -> Option<u32> {
        self.shared.workers().get(display_name).map(WorkerHandle::rate)
    }

    /// Names of the displays currently being captured.
    pub fn captured_displays(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shared.workers().keys().cloned().collect();
        names.sort();
        names
    }

    /// Leave `Faulted` and spawn workers for current demand again.
    pub fn restart(&self) -> Result<(), CoreError> {
        self.shared.transition(|s| {
            if !s.is_faulted() {
                return Err(CoreError::InvalidTransition(
                    "cannot restart: capture is not faulted",
                ));
            }
            s.begin_start()
        })?;
        info!("capture restart requested");
        self.shared.wake.notify_one();
        Ok(())
    }

    /// JPEG thumbnail of the most recent capture, scaled to fit
    /// `max_width × max_height`. When nothing is being captured the
    /// primary display is grabbed once.
    pub async fn get_thumbnail(&self, max_width: u32, max_height: u32) -> Result<Bytes, CoreError> {
        if let Some(cached) = self.shared.thumbnails.cached(max_width, max_height) {
            return Ok(cached);
        }

        let recent = self
            .shared
            .latest()
            .values()
            .max_by_key(|f| f.timestamp)
            .cloned();
        let primary = self.shared.registry.displays().primary().cloned();
        let backend = Arc::clone(&self.shared.backend);
        let timeout = self.shared.config.acquire_timeout;

        let data = tokio::task::spawn_blocking(move || -> Result<Bytes, CoreError> {
            let frame = match recent {
                Some(frame) => frame,
                None => {
                    let display = primary
                        .ok_or_else(|| CoreError::UnknownDisplay("no display attached".into()))?;
                    backend.acquire_frame(&display, timeout)?
                }
            };
            thumbnail::render(&frame, max_width, max_height)
        })
        .await
        .map_err(|e| CoreError::Other(format!("thumbnail task failed: {e}")))??;

        self.shared
            .thumbnails
            .store(max_width, max_height, data.clone());
        Ok(data)
    }

    /// Stop the supervisor and all workers and wait for the supervisor to
    /// exit.
    pub async fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.wake.notify_one();
        let handle = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        Shared::stop_workers(&mut self.shared.workers());
    }
}

impl Drop for CaptureLoop {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        Shared::stop_workers(&mut self.shared.workers());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SyntheticBackend;
    use crate::backend::synthetic::ScriptedFailure;
    use crate::claims::Role;
    use crate::display::{Display, Rect};
    use crate::viewer::{AuthenticationType, Viewer};

    fn fixture() -> (Arc<SyntheticBackend>, Arc<SessionRegistry>, CaptureLoop) {
        fixture_with(CaptureConfig {
            topology_poll_interval: Duration::from_millis(20),
            ..Default::default()
        })
    }

    fn fixture_with(config: CaptureConfig) -> (Arc<SyntheticBackend>, Arc<SessionRegistry>, CaptureLoop) {
        let backend = Arc::new(SyntheticBackend::new(vec![Display::new(
            "S",
            Rect::new(0, 0, 64, 48),
            true,
        )]));
        let registry = Arc::new(SessionRegistry::with_displays(DisplaySet::new(
            backend.enumerate().unwrap(),
        )));
        let capture = CaptureLoop::spawn(backend.clone(), Arc::clone(&registry), config);
        (backend, registry, capture)
    }

    async fn wait_for(capture: &CaptureLoop, pred: impl Fn(&CaptureState) -> bool) {
        let mut rx = capture.subscribe_state();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| pred(s)))
            .await
            .expect("state not reached")
            .unwrap();
    }

    fn viewer(id: &str) -> Viewer {
        Viewer::new(id, "t", Role::Owner, AuthenticationType::Localhost)
    }

    #[tokio::test]
    async fn starts_with_first_viewer_and_stops_with_last() {
        let (_backend, registry, capture) = fixture();
        assert!(capture.state().is_stopped());

        registry.try_add_viewer(viewer("a"));
        wait_for(&capture, CaptureState::is_running).await;
        assert_eq!(capture.captured_displays(), vec!["S".to_string()]);

        registry.try_remove_viewer("a");
        wait_for(&capture, CaptureState::is_stopped).await;
        assert!(capture.captured_displays().is_empty());
    }

    #[tokio::test]
    async fn first_frame_arrives_in_slot() {
        let (_backend, registry, capture) = fixture();
        registry.try_add_viewer(viewer("a"));
        let slot = registry.frame_slot("a").unwrap();
        let update = tokio::time::timeout(Duration::from_secs(5), slot.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(update.display_name, "S");
        assert_eq!((update.width, update.height), (64, 48));
        assert!(update.changed.is_none());
        drop(capture);
    }

    #[tokio::test]
    async fn broken_backend_faults_and_restart_recovers() {
        let (backend, registry, capture) = fixture();
        registry.try_add_viewer(viewer("a"));
        let mut events = registry.take_event_receiver("a").unwrap();
        wait_for(&capture, CaptureState::is_running).await;

        backend.set_broken(true);
        wait_for(&capture, CaptureState::is_faulted).await;
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, HostEvent::CaptureError(_)));
        assert!(backend.reinitializations() >= 1);

        backend.set_broken(false);
        capture.restart().unwrap();
        wait_for(&capture, CaptureState::is_running).await;
    }

    #[tokio::test]
    async fn next_frame_arrives_within_one_tick_then_drains() {
        let (backend, registry, capture) = fixture();
        backend.set_static(true);
        registry.try_add_viewer(viewer("a"));
        wait_for(&capture, CaptureState::is_running).await;

        let context = registry.context("a").unwrap();
        let budget = context.frame_interval() + CaptureConfig::default().acquire_timeout;
        let deadline = Instant::now() + budget;
        let first = loop {
            if let Some(update) = capture.next_frame("a") {
                break update;
            }
            assert!(Instant::now() < deadline, "no frame within {budget:?}");
            tokio::time::sleep(Duration::from_millis(1)).await;
        };
        assert_eq!(first.display_name, "S");
        assert!(capture.next_frame("a").is_none());
        assert!(capture.next_frame("nobody").is_none());
    }

    #[tokio::test]
    async fn device_loss_recovers_after_one_reinitialization() {
        let (backend, registry, capture) = fixture();
        registry.try_add_viewer(viewer("a"));
        wait_for(&capture, CaptureState::is_running).await;

        backend.fail_next([ScriptedFailure::DeviceLost]);
        let slot = registry.frame_slot("a").unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while backend.reinitializations() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        slot.next_frame();
        assert!(tokio::time::timeout(Duration::from_secs(5), slot.wait()).await.unwrap().is_some());
        assert!(capture.state().is_running());
        assert_eq!(backend.reinitializations(), 1);
    }

    #[tokio::test]
    async fn failure_right_after_reinitialization_faults() {
        let (backend, registry, capture) = fixture();
        registry.try_add_viewer(viewer("a"));
        let mut events = registry.take_event_receiver("a").unwrap();
        wait_for(&capture, CaptureState::is_running).await;

        backend.fail_next([ScriptedFailure::DeviceLost; 20]);
        wait_for(&capture, CaptureState::is_faulted).await;
        assert_eq!(backend.reinitializations(), 1);
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, HostEvent::CaptureError(_)));
    }

    #[tokio::test]
    async fn endless_timeouts_escalate_to_fault() {
        let (backend, registry, capture) = fixture_with(CaptureConfig {
            topology_poll_interval: Duration::from_millis(20),
            max_transient_failures: 3,
            ..Default::default()
        });
        registry.try_add_viewer(viewer("a"));
        let mut events = registry.take_event_receiver("a").unwrap();
        wait_for(&capture, CaptureState::is_running).await;

        backend.fail_next([ScriptedFailure::Timeout; 40]);
        wait_for(&capture, CaptureState::is_faulted).await;
        assert_eq!(backend.reinitializations(), 1);
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, HostEvent::CaptureError(m) if m.contains("in a row")));
    }

    #[tokio::test]
    async fn short_timeout_burst_is_absorbed() {
        let (backend, registry, capture) = fixture_with(CaptureConfig {
            topology_poll_interval: Duration::from_millis(20),
            max_transient_failures: 3,
            ..Default::default()
        });
        registry.try_add_viewer(viewer("a"));
        wait_for(&capture, CaptureState::is_running).await;

        backend.fail_next([ScriptedFailure::Timeout; 3]);
        let target = backend.acquisitions() + 6;
        tokio::time::timeout(Duration::from_secs(5), async {
            while backend.acquisitions() < target {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(capture.state().is_running());
        assert_eq!(backend.reinitializations(), 0);
    }

    #[tokio::test]
    async fn restart_requires_fault() {
        let (_backend, _registry, capture) = fixture();
        assert!(matches!(
            capture.restart(),
            Err(CoreError::InvalidTransition(_))
        ));
    }

    #[tokio::test]
    async fn thumbnail_without_running_capture_grabs_primary() {
        let (_backend, _registry, capture) = fixture();
        let data = capture.get_thumbnail(32, 32).await.unwrap();
        let img = image::load_from_memory(&data).unwrap();
        assert_eq!((img.width(), img.height()), (32, 24));
    }
}
