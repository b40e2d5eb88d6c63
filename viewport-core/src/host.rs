//! Composition root for one managed machine.
//!
//! [`Host`] owns the registry, the capture loop, the overlay manager, the
//! input service and the audio service, and routes every inbound
//! [`ViewerCommand`] through the claim check before it reaches them.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::audio::{AudioCaptureService, AudioChunk, AudioConfig, AudioSubscriber};
use crate::backend::DisplayBackend;
use crate::capture::{CaptureConfig, CaptureLoop};
use crate::display::DisplaySet;
use crate::error::CoreError;
use crate::input::{InputConfig, InputService};
use crate::overlay::{OverlayManager, CLICK_INDICATOR};
use crate::protocol::{HostEvent, ViewerCommand};
use crate::registry::{Rejected, SessionRegistry, ViewerRegistration};
use crate::viewer::Viewer;

/// Configuration of every service a [`Host`] starts.
#[derive(Debug, Clone, Default)]
pub struct HostOptions {
    pub capture: CaptureConfig,
    pub input: InputConfig,
    pub audio: AudioConfig,
}

pub struct Host {
    backend: Arc<dyn DisplayBackend>,
    registry: Arc<SessionRegistry>,
    capture: CaptureLoop,
    overlays: OverlayManager,
    input: InputService,
    audio: AudioCaptureService,
    audio_interval: Duration,
}

impl Host {
    /// Enumerate displays and start every service. Must be called inside
    /// a Tokio runtime.
    ///
    /// Audio failures are logged and leave the host running without audio.
    pub fn start(backend: Arc<dyn DisplayBackend>, options: HostOptions) -> Result<Self, CoreError> {
        let displays = backend.enumerate()?;
        info!(
            backend = backend.name(),
            displays = displays.len(),
            "starting host"
        );
        let registry = Arc::new(SessionRegistry::with_displays(DisplaySet::new(displays)));
        let overlays = OverlayManager::new(Arc::clone(&registry));
        let input = InputService::start(
            Arc::clone(&backend),
            Arc::clone(&registry),
            overlays.clone(),
            options.input,
        )?;
        let capture = CaptureLoop::spawn(Arc::clone(&backend), Arc::clone(&registry), options.capture);

        let audio = AudioCaptureService::from_config(&options.audio).unwrap_or_else(|e| {
            warn!("audio source unavailable, continuing without audio: {e}");
            AudioCaptureService::unavailable(e.to_string(), options.audio.ring_capacity)
        });
        if options.audio.enabled {
            if let Err(e) = audio.start_recording() {
                warn!("audio unavailable: {e}");
            }
        }

        Ok(Self {
            backend,
            registry,
            capture,
            overlays,
            input,
            audio,
            audio_interval: options.audio.chunk_duration,
        })
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn capture(&self) -> &CaptureLoop {
        &self.capture
    }

    pub fn overlays(&self) -> &OverlayManager {
        &self.overlays
    }

    pub fn input(&self) -> &InputService {
        &self.input
    }

    pub fn audio(&self) -> &AudioCaptureService {
        &self.audio
    }

    /// How often an [`AudioFeed`] should be drained.
    pub fn audio_interval(&self) -> Duration {
        self.audio_interval
    }

    /// Audio reader for one viewer, starting at the next chunk.
    pub fn audio_feed(&self, connection_id: &str) -> AudioFeed {
        AudioFeed {
            registry: Arc::clone(&self.registry),
            connection_id: connection_id.to_string(),
            subscriber: self.audio.subscribe(),
        }
    }

    /// Register an accepted viewer. `None` if the connection id is taken.
    pub fn connect(&self, viewer: Viewer) -> Option<ViewerRegistration> {
        self.registry.register(viewer)
    }

    /// [`connect`](Self::connect), refusing the viewer once
    /// `max_viewers` are connected.
    pub fn connect_bounded(
        &self,
        viewer: Viewer,
        max_viewers: usize,
    ) -> Result<ViewerRegistration, Rejected> {
        self.registry.register_bounded(viewer, max_viewers)
    }

    /// Execute one command on behalf of `connection_id`.
    ///
    /// Unauthorized input events are dropped and report success; every
    /// other unauthorized command fails with [`CoreError::Unauthorized`].
    pub async fn dispatch(&self, connection_id: &str, command: ViewerCommand) -> Result<(), CoreError> {
        let viewer = self
            .registry
            .try_get_viewer(connection_id)
            .ok_or_else(|| CoreError::UnknownViewer(connection_id.to_string()))?;
        if let Some(claim) = command.required_claim() {
            if !viewer.has_claim(claim) {
                if command.is_fire_and_forget() {
                    debug!(viewer = %connection_id, claim = claim.name(), "unauthorized input dropped");
                    return Ok(());
                }
                return Err(CoreError::Unauthorized { claim });
            }
        }

        match command {
            ViewerCommand::ChangeSelectedScreen(name) => {
                self.registry.update_context(connection_id, |ctx| {
                    ctx.selected_screen = name;
                    Ok(())
                })?;
                if let Some(display) = self.registry.selected_display(connection_id) {
                    self.registry
                        .send_to(connection_id, HostEvent::ReceiveScreenSize(display.size()));
                }
            }
            ViewerCommand::SetFrameRate(fps) => {
                self.registry
                    .update_context(connection_id, |ctx| ctx.set_frame_rate(fps))?;
            }
            ViewerCommand::SetImageQuality(quality) => {
                self.registry
                    .update_context(connection_id, |ctx| ctx.set_image_quality(quality))?;
            }
            ViewerCommand::SetCodec(name) => {
                self.registry
                    .update_context(connection_id, |ctx| ctx.set_codec(&name))?;
            }
            ViewerCommand::ToggleDrawCursor(visible) => {
                self.registry.update_context(connection_id, |ctx| {
                    ctx.set_cursor_visible(visible);
                    Ok(())
                })?;
            }
            ViewerCommand::SendMouseInput(input) => {
                self.input.send_mouse_input(connection_id, &input);
            }
            ViewerCommand::SendKeyboardInput(input) => {
                self.input.send_keyboard_input(connection_id, &input);
            }
            ViewerCommand::ToggleInput(enabled) => self.input.toggle_input(connection_id, enabled)?,
            ViewerCommand::BlockUserInput(block) => {
                self.input.block_user_input(connection_id, block).await?;
            }
            ViewerCommand::ToggleClickIndicator(on) => {
                if on {
                    self.overlays.activate_overlay(CLICK_INDICATOR, connection_id);
                } else {
                    self.overlays.deactivate_overlay(CLICK_INDICATOR, connection_id);
                }
            }
            ViewerCommand::ToggleAudio(on) => {
                if on {
                    self.audio.start_recording()?;
                }
                self.registry.update_context(connection_id, |ctx| {
                    ctx.set_audio_enabled(on);
                    Ok(())
                })?;
            }
            ViewerCommand::RequestThumbnail {
                max_width,
                max_height,
            } => {
                let data = self.capture.get_thumbnail(max_width, max_height).await?;
                self.registry
                    .send_to(connection_id, HostEvent::ReceiveThumbnail(data));
            }
            ViewerCommand::RequestDisplays => {
                self.registry.send_to(
                    connection_id,
                    HostEvent::ReceiveDisplays(self.registry.displays().to_vec()),
                );
            }
        }
        Ok(())
    }

    /// [`dispatch`](Self::dispatch), reporting failures to the viewer as
    /// `CommandFailed`.
    pub async fn handle(&self, connection_id: &str, command: ViewerCommand) {
        if let Err(e) = self.dispatch(connection_id, command).await {
            warn!(viewer = %connection_id, "command failed: {e}");
            self.registry
                .send_to(connection_id, HostEvent::CommandFailed(e.to_string()));
        }
    }

    /// Stop capture, drain queued input and stop audio.
    pub async fn shutdown(&self) {
        self.capture.shutdown().await;
        if let Err(e) = self.input.flush().await {
            debug!("input flush on shutdown: {e}");
        }
        self.audio.stop_recording();
        info!("host stopped");
    }
}

// ── AudioFeed ────────────────────────────────────────────────────

/// Per-viewer audio reader gated by the viewer's `is_audio_enabled`.
pub struct AudioFeed {
    registry: Arc<SessionRegistry>,
    connection_id: String,
    subscriber: AudioSubscriber,
}

impl AudioFeed {
    /// Every unread chunk, or nothing while the viewer has audio off.
    /// Chunks recorded while audio is off are discarded so enabling it
    /// never replays stale sound.
    pub fn drain(&mut self) -> Vec<AudioChunk> {
        let enabled = self
            .registry
            .context(&self.connection_id)
            .is_some_and(|ctx| ctx.is_audio_enabled);
        let chunks: Vec<AudioChunk> =
            std::iter::from_fn(|| self.subscriber.get_next_audio_chunk()).collect();
        if enabled { chunks } else { Vec::new() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SyntheticBackend;
    use crate::claims::Role;
    use crate::display::{Display, Rect};
    use crate::viewer::AuthenticationType;

    fn host() -> Host {
        let backend = Arc::new(SyntheticBackend::new(vec![
            Display::new("A", Rect::new(0, 0, 64, 48), true),
            Display::new("B", Rect::new(64, 0, 32, 32), false),
        ]));
        Host::start(backend, HostOptions::default()).unwrap()
    }

    fn viewer(id: &str, role: Role) -> Viewer {
        Viewer::new(id, "user", role, AuthenticationType::BearerToken)
    }

    #[tokio::test]
    async fn observer_cannot_change_codec() {
        let host = host();
        let _reg = host.connect(viewer("o", Role::Observer)).unwrap();
        let err = host
            .dispatch("o", ViewerCommand::SetCodec("png".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Unauthorized { .. }));
        host.shutdown().await;
    }

    #[tokio::test]
    async fn unauthorized_input_is_silent() {
        let host = host();
        let _reg = host.connect(viewer("o", Role::Observer)).unwrap();
        host.dispatch(
            "o",
            ViewerCommand::SendMouseInput(crate::protocol::MouseInput::move_to(0.5, 0.5)),
        )
        .await
        .unwrap();
        host.shutdown().await;
    }

    #[tokio::test]
    async fn screen_change_reports_new_size() {
        let host = host();
        let reg = host.connect(viewer("v", Role::Operator)).unwrap();
        let mut events = reg.take_events().unwrap();
        host.dispatch("v", ViewerCommand::ChangeSelectedScreen("B".into()))
            .await
            .unwrap();
        assert_eq!(host.registry().context("v").unwrap().selected_screen, "B");
        match events.recv().await.unwrap() {
            HostEvent::ReceiveScreenSize(size) => assert_eq!((size.width, size.height), (32, 32)),
            other => panic!("unexpected event {other:?}"),
        }
        host.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_screen_leaves_context_untouched() {
        let host = host();
        let _reg = host.connect(viewer("v", Role::Owner)).unwrap();
        let before = host.registry().context("v").unwrap();
        let err = host
            .dispatch("v", ViewerCommand::ChangeSelectedScreen("Z".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::UnknownDisplay(_)));
        assert_eq!(host.registry().context("v").unwrap(), before);
        host.shutdown().await;
    }

    #[tokio::test]
    async fn failures_are_reported_as_command_failed() {
        let host = host();
        let reg = host.connect(viewer("v", Role::Owner)).unwrap();
        let mut events = reg.take_events().unwrap();
        host.handle("v", ViewerCommand::SetFrameRate(0)).await;
        assert!(matches!(
            events.recv().await.unwrap(),
            HostEvent::CommandFailed(_)
        ));
        host.shutdown().await;
    }

    #[tokio::test]
    async fn click_indicator_toggles_overlay() {
        let host = host();
        let _reg = host.connect(viewer("v", Role::Operator)).unwrap();
        host.dispatch("v", ViewerCommand::ToggleClickIndicator(true))
            .await
            .unwrap();
        assert!(host.overlays().is_overlay_active(CLICK_INDICATOR, "v"));
        host.dispatch("v", ViewerCommand::ToggleClickIndicator(false))
            .await
            .unwrap();
        assert!(host.overlays().get_active_overlays("v").is_empty());
        host.shutdown().await;
    }

    #[cfg(not(feature = "cpal"))]
    #[tokio::test]
    async fn broken_audio_source_leaves_video_running() {
        let backend = Arc::new(SyntheticBackend::new(vec![Display::new(
            "A",
            Rect::new(0, 0, 64, 48),
            true,
        )]));
        let options = HostOptions {
            audio: AudioConfig {
                enabled: true,
                source: crate::audio::AudioSourceKind::Cpal,
                ..Default::default()
            },
            ..Default::default()
        };
        let host = Host::start(backend, options).unwrap();
        assert!(host.audio().is_faulted());
        assert!(!host.audio().is_recording());

        let reg = host.connect(viewer("v", Role::Owner)).unwrap();
        let slot = reg.frame_slot().unwrap();
        let update = tokio::time::timeout(Duration::from_secs(5), slot.wait())
            .await
            .unwrap();
        assert!(update.is_some());

        let err = host.dispatch("v", ViewerCommand::ToggleAudio(true)).await.unwrap_err();
        assert!(err.to_string().contains("audio unavailable"));
        assert!(!host.registry().context("v").unwrap().is_audio_enabled);
        host.shutdown().await;
    }

    #[tokio::test]
    async fn audio_reaches_only_viewers_that_enabled_it() {
        let host = host();
        let _on = host.connect(viewer("on", Role::Observer)).unwrap();
        let _off = host.connect(viewer("off", Role::Observer)).unwrap();
        let mut on_feed = host.audio_feed("on");
        let mut off_feed = host.audio_feed("off");

        host.dispatch("on", ViewerCommand::ToggleAudio(true)).await.unwrap();
        assert!(host.audio().is_recording());
        tokio::time::sleep(Duration::from_millis(120)).await;

        let chunks = on_feed.drain();
        assert!(!chunks.is_empty());
        assert!(chunks.windows(2).all(|w| w[1].sequence_number > w[0].sequence_number));
        assert!(off_feed.drain().is_empty());

        host.dispatch("on", ViewerCommand::ToggleAudio(false)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(on_feed.drain().is_empty());
        host.shutdown().await;
    }

    #[tokio::test]
    async fn audio_needs_its_claim() {
        let host = host();
        let _reg = host
            .connect(viewer("o", Role::Observer).with_claims(crate::claims::Claims::THUMBNAIL))
            .unwrap();
        let err = host.dispatch("o", ViewerCommand::ToggleAudio(true)).await.unwrap_err();
        assert!(matches!(err, CoreError::Unauthorized { .. }));
        assert!(!host.audio().is_recording());
        host.shutdown().await;
    }

    #[tokio::test]
    async fn display_list_needs_no_claim() {
        let host = host();
        let reg = host
            .connect(viewer("o", Role::Observer).with_claims(crate::claims::Claims::empty()))
            .unwrap();
        let mut events = reg.take_events().unwrap();
        host.dispatch("o", ViewerCommand::RequestDisplays).await.unwrap();
        match events.recv().await.unwrap() {
            HostEvent::ReceiveDisplays(list) => assert_eq!(list.len(), 2),
            other => panic!("unexpected event {other:?}"),
        }
        host.shutdown().await;
    }
}
