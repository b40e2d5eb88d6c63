//! Process-wide session registry.
//!
//! The registry is the single source of truth for which viewers exist.
//! It owns, per connection id and under one lock:
//!
//! - the [`Viewer`] record,
//! - its [`CapturingContext`] (kept in a separate map so the 1:1
//!   invariant is observable),
//! - its overlay set, outbound event channel and [`FrameSlot`].
//!
//! Every mutation is a bounded critical section; events are published on
//! a broadcast channel after the lock is released.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::capture::FrameSlot;
use crate::context::CapturingContext;
use crate::display::{Display, DisplaySet};
use crate::error::CoreError;
use crate::overlay::OverlaySet;
use crate::protocol::HostEvent;
use crate::viewer::Viewer;

/// Capacity of each viewer's outbound event queue.
pub const OUTBOUND_CAPACITY: usize = 64;
const EVENT_CAPACITY: usize = 256;

// ── RegistryEvent ────────────────────────────────────────────────

/// Change notifications published by the registry.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    ViewerAdded(Viewer),
    /// Carries the removed viewer, or `None` when the id was unknown.
    ViewerRemoved {
        connection_id: String,
        viewer: Option<Viewer>,
    },
    ContextChanged(String),
    OverlaysChanged(String),
    /// A new display set was installed; `reassigned` lists the viewers
    /// whose selected screen vanished and now point at the primary.
    DisplaysChanged { reassigned: Vec<String> },
}

/// Why a viewer was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Rejected {
    #[error("connection id already registered")]
    Duplicate,
    #[error("host is full")]
    Full,
}

// ── ViewerTarget ─────────────────────────────────────────────────

/// Point-in-time view of one viewer, as consumed by the capture loop.
#[derive(Debug, Clone)]
pub struct ViewerTarget {
    pub connection_id: String,
    pub context: CapturingContext,
    pub overlays: OverlaySet,
    pub slot: Arc<FrameSlot>,
}

struct Session {
    viewer: Viewer,
    overlays: OverlaySet,
    outbound: mpsc::Sender<HostEvent>,
    pending_receiver: Option<mpsc::Receiver<HostEvent>>,
    slot: Arc<FrameSlot>,
}

#[derive(Default)]
struct RegistryInner {
    displays: DisplaySet,
    sessions: HashMap<String, Session>,
    contexts: HashMap<String, CapturingContext>,
}

impl RegistryInner {
    fn snapshot(&self, id: &str) -> Option<Viewer> {
        let session = self.sessions.get(id)?;
        let mut viewer = session.viewer.clone();
        if let Some(ctx) = self.contexts.get(id) {
            viewer.capturing_context = ctx.clone();
        }
        Some(viewer)
    }

    fn default_screen(&self) -> String {
        self.displays
            .primary()
            .map(|d| d.name.clone())
            .unwrap_or_default()
    }
}

// ── SessionRegistry ──────────────────────────────────────────────

/// Concurrent map of viewers and their capturing contexts.
pub struct SessionRegistry {
    inner: Mutex<RegistryInner>,
    events: broadcast::Sender<RegistryEvent>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Mutex::new(RegistryInner::default()),
            events,
        }
    }

    /// Create a registry that already knows the current displays.
    pub fn with_displays(displays: DisplaySet) -> Self {
        let registry = Self::new();
        registry.inner().displays = displays;
        registry
    }

    fn inner(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: RegistryEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Subscribe to registry changes. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    // ── Membership ───────────────────────────────────────────────

    /// Insert a viewer and its context. Returns `false` if the
    /// connection id is already registered (state unchanged).
    ///
    /// A context whose `selected_screen` is empty or unknown is pointed
    /// at the primary display.
    pub fn try_add_viewer(&self, viewer: Viewer) -> bool {
        self.admit(viewer, usize::MAX).is_ok()
    }

    /// [`try_add_viewer`](Self::try_add_viewer) that also refuses the
    /// viewer when `max_viewers` are already registered. The check and
    /// the insert happen under the same lock.
    pub fn try_add_viewer_bounded(&self, viewer: Viewer, max_viewers: usize) -> Result<(), Rejected> {
        self.admit(viewer, max_viewers)
    }

    fn admit(&self, mut viewer: Viewer, max_viewers: usize) -> Result<(), Rejected> {
        let snapshot = {
            let mut inner = self.inner();
            if inner.sessions.contains_key(&viewer.connection_id) {
                return Err(Rejected::Duplicate);
            }
            if inner.sessions.len() >= max_viewers {
                debug!(viewer = %viewer.connection_id, max_viewers, "viewer refused; registry full");
                return Err(Rejected::Full);
            }

            let id = viewer.connection_id.clone();
            let mut context = viewer.capturing_context.clone();
            context.viewer_id = id.clone();
            if !inner.displays.contains(&context.selected_screen) {
                context.selected_screen = inner.default_screen();
            }
            viewer.capturing_context = context.clone();

            let (outbound, receiver) = mpsc::channel(OUTBOUND_CAPACITY);
            inner.contexts.insert(id.clone(), context);
            inner.sessions.insert(
                id,
                Session {
                    viewer: viewer.clone(),
                    overlays: OverlaySet::default(),
                    outbound,
                    pending_receiver: Some(receiver),
                    slot: Arc::new(FrameSlot::new()),
                },
            );
            viewer
        };

        info!(
            viewer = %snapshot.connection_id,
            user = %snapshot.user_name,
            role = %snapshot.role,
            screen = %snapshot.capturing_context.selected_screen,
            "viewer added"
        );
        self.emit(RegistryEvent::ViewerAdded(snapshot));
        Ok(())
    }

    /// Remove a viewer, its context and its overlays. The viewer's frame
    /// slot is closed so in-flight frames are discarded.
    pub fn try_remove_viewer(&self, connection_id: &str) -> bool {
        let removed = {
            let mut inner = self.inner();
            let context = inner.contexts.remove(connection_id);
            inner.sessions.remove(connection_id).map(|session| {
                let mut viewer = session.viewer;
                if let Some(ctx) = context {
                    viewer.capturing_context = ctx;
                }
                (viewer, session.slot)
            })
        };

        let found = removed.is_some();
        let viewer = removed.map(|(viewer, slot)| {
            slot.close();
            viewer
        });
        if found {
            info!(viewer = %connection_id, "viewer removed");
        } else {
            debug!(viewer = %connection_id, "remove of unknown viewer ignored");
        }
        self.emit(RegistryEvent::ViewerRemoved {
            connection_id: connection_id.to_string(),
            viewer,
        });
        found
    }

    /// Insert a viewer and return a handle that removes it on drop.
    pub fn register(self: &Arc<Self>, viewer: Viewer) -> Option<ViewerRegistration> {
        self.register_bounded(viewer, usize::MAX).ok()
    }

    /// [`register`](Self::register) with a viewer limit.
    pub fn register_bounded(
        self: &Arc<Self>,
        viewer: Viewer,
        max_viewers: usize,
    ) -> Result<ViewerRegistration, Rejected> {
        let id = viewer.connection_id.clone();
        self.admit(viewer, max_viewers)?;
        Ok(ViewerRegistration {
            registry: Arc::clone(self),
            connection_id: id,
        })
    }

    pub fn try_get_viewer(&self, connection_id: &str) -> Option<Viewer> {
        self.inner().snapshot(connection_id)
    }

    /// Snapshot of every registered viewer.
    pub fn get_all_viewers(&self) -> Vec<Viewer> {
        let inner = self.inner();
        inner
            .sessions
            .keys()
            .filter_map(|id| inner.snapshot(id))
            .collect()
    }

    pub fn viewer_count(&self) -> usize {
        self.inner().sessions.len()
    }

    pub fn context_count(&self) -> usize {
        self.inner().contexts.len()
    }

    /// Hand out the outbound event receiver. Only the first call per
    /// viewer gets it.
    pub fn take_event_receiver(&self, connection_id: &str) -> Option<mpsc::Receiver<HostEvent>> {
        self.inner()
            .sessions
            .get_mut(connection_id)
            .and_then(|s| s.pending_receiver.take())
    }

    pub fn frame_slot(&self, connection_id: &str) -> Option<Arc<FrameSlot>> {
        self.inner()
            .sessions
            .get(connection_id)
            .map(|s| Arc::clone(&s.slot))
    }

    // ── Contexts ─────────────────────────────────────────────────

    pub fn context(&self, connection_id: &str) -> Option<CapturingContext> {
        self.inner().contexts.get(connection_id).cloned()
    }

    /// Apply an authorized mutation to one viewer's context.
    ///
    /// The closure works on a copy; the copy is committed (and the
    /// revision bumped) only if it succeeds and still references a known
    /// display.
    pub fn update_context<F>(&self, connection_id: &str, f: F) -> Result<CapturingContext, CoreError>
    where
        F: FnOnce(&mut CapturingContext) -> Result<(), CoreError>,
    {
        let updated = {
            let mut inner = self.inner();
            let current = inner
                .contexts
                .get(connection_id)
                .ok_or_else(|| CoreError::UnknownViewer(connection_id.to_string()))?;
            let mut next = current.clone();
            f(&mut next)?;
            if !inner.displays.is_empty() && !inner.displays.contains(&next.selected_screen) {
                return Err(CoreError::UnknownDisplay(next.selected_screen));
            }
            next.revision = current.revision + 1;
            inner.contexts.insert(connection_id.to_string(), next.clone());
            next
        };
        self.emit(RegistryEvent::ContextChanged(connection_id.to_string()));
        Ok(updated)
    }

    // ── Overlays ─────────────────────────────────────────────────

    /// Read a viewer's overlay set.
    pub fn overlays(&self, connection_id: &str) -> Option<OverlaySet> {
        self.inner()
            .sessions
            .get(connection_id)
            .map(|s| s.overlays.clone())
    }

    /// Mutate a viewer's overlay set. When `f` reports a change the set's
    /// revision is bumped and `OverlaysChanged` is raised.
    pub fn update_overlays<F>(&self, connection_id: &str, f: F) -> Option<bool>
    where
        F: FnOnce(&mut OverlaySet) -> bool,
    {
        let changed = {
            let mut inner = self.inner();
            let session = inner.sessions.get_mut(connection_id)?;
            let changed = f(&mut session.overlays);
            if changed {
                session.overlays.revision += 1;
            }
            changed
        };
        if changed {
            self.emit(RegistryEvent::OverlaysChanged(connection_id.to_string()));
        }
        Some(changed)
    }

    // ── Displays ─────────────────────────────────────────────────

    pub fn displays(&self) -> DisplaySet {
        self.inner().displays.clone()
    }

    /// Bounds of the display a viewer currently watches.
    pub fn selected_display(&self, connection_id: &str) -> Option<Display> {
        let inner = self.inner();
        let ctx = inner.contexts.get(connection_id)?;
        inner.displays.get(&ctx.selected_screen).cloned()
    }

    /// Install a new enumeration. Contexts whose selected screen vanished
    /// are reassigned to the new primary; their ids are returned.
    pub fn replace_displays(&self, displays: DisplaySet) -> Vec<String> {
        let reassigned = {
            let mut inner = self.inner();
            inner.displays = displays;
            let primary = inner.default_screen();
            let RegistryInner {
                displays, contexts, ..
            } = &mut *inner;
            let mut reassigned = Vec::new();
            for (id, ctx) in contexts.iter_mut() {
                if !displays.contains(&ctx.selected_screen) {
                    ctx.selected_screen = primary.clone();
                    ctx.revision += 1;
                    reassigned.push(id.clone());
                }
            }
            reassigned.sort();
            reassigned
        };
        if !reassigned.is_empty() {
            info!(viewers = ?reassigned, "display vanished; viewers moved to primary");
        }
        self.emit(RegistryEvent::DisplaysChanged {
            reassigned: reassigned.clone(),
        });
        reassigned
    }

    // ── Capture support ──────────────────────────────────────────

    /// Map of display name → highest frame rate requested for it.
    pub fn demanded_displays(&self) -> BTreeMap<String, u32> {
        let inner = self.inner();
        let mut demand = BTreeMap::new();
        for ctx in inner.contexts.values() {
            if ctx.selected_screen.is_empty() {
                continue;
            }
            let entry = demand.entry(ctx.selected_screen.clone()).or_insert(0);
            *entry = (*entry).max(ctx.frame_rate);
        }
        demand
    }

    /// Snapshot of every viewer watching `display_name`.
    pub fn targets_on(&self, display_name: &str) -> Vec<ViewerTarget> {
        let inner = self.inner();
        let mut targets: Vec<ViewerTarget> = inner
            .contexts
            .iter()
            .filter(|(_, ctx)| ctx.selected_screen == display_name)
            .filter_map(|(id, ctx)| {
                inner.sessions.get(id).map(|s| ViewerTarget {
                    connection_id: id.clone(),
                    context: ctx.clone(),
                    overlays: s.overlays.clone(),
                    slot: Arc::clone(&s.slot),
                })
            })
            .collect();
        targets.sort_by(|a, b| a.connection_id.cmp(&b.connection_id));
        targets
    }

    // ── Outbound ─────────────────────────────────────────────────

    /// Queue an event for one viewer. Never blocks; a full queue drops
    /// the event.
    pub fn send_to(&self, connection_id: &str, event: HostEvent) -> bool {
        let sender = self
            .inner()
            .sessions
            .get(connection_id)
            .map(|s| s.outbound.clone());
        match sender {
            Some(tx) => Self::try_deliver(connection_id, &tx, event),
            None => false,
        }
    }

    /// Queue an event for every viewer matching `filter`.
    pub fn send_where<P>(&self, event: HostEvent, mut filter: P) -> usize
    where
        P: FnMut(&CapturingContext) -> bool,
    {
        let senders: Vec<(String, mpsc::Sender<HostEvent>)> = {
            let inner = self.inner();
            inner
                .sessions
                .iter()
                .filter(|(id, _)| inner.contexts.get(*id).is_some_and(&mut filter))
                .map(|(id, s)| (id.clone(), s.outbound.clone()))
                .collect()
        };
        senders
            .iter()
            .filter(|(id, tx)| Self::try_deliver(id, tx, event.clone()))
            .count()
    }

    /// Queue an event for every viewer.
    pub fn broadcast(&self, event: HostEvent) -> usize {
        self.send_where(event, |_| true)
    }

    fn try_deliver(id: &str, tx: &mpsc::Sender<HostEvent>, event: HostEvent) -> bool {
        match tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(viewer = %id, "outbound queue full; event dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

// ── ViewerRegistration ───────────────────────────────────────────

/// RAII registration: dropping it removes the viewer, its context and
/// its overlays from the registry.
pub struct ViewerRegistration {
    registry: Arc<SessionRegistry>,
    connection_id: String,
}

impl ViewerRegistration {
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// The viewer's outbound event stream (first call only).
    pub fn take_events(&self) -> Option<mpsc::Receiver<HostEvent>> {
        self.registry.take_event_receiver(&self.connection_id)
    }

    pub fn frame_slot(&self) -> Option<Arc<FrameSlot>> {
        self.registry.frame_slot(&self.connection_id)
    }
}

impl Drop for ViewerRegistration {
    fn drop(&mut self) {
        self.registry.try_remove_viewer(&self.connection_id);
    }
}

impl std::fmt::Debug for ViewerRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewerRegistration")
            .field("connection_id", &self.connection_id)
            .finish()
    }
}
