//! Reference viewer transport.
//!
//! One TCP connection per viewer, framed with
//! `tokio_util::codec::LengthDelimitedCodec`; every frame is one
//! bincode-encoded message.
//!
//! ```text
//! Viewer ──[Hello]────────────────► Host
//! Host   ──[ReceiveDisplays]──────► Viewer
//! Host   ──[ReceiveScreenSize]────► Viewer
//! Viewer ──[ViewerCommand]*───────► Host
//! Host   ──[HostEvent]*───────────► Viewer
//! ```

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::MissedTickBehavior;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info, warn};

use viewport_core::{
    AuthenticationType, CapturingContext, Host, HostEvent, Rejected, Role, Viewer, ViewerCommand,
};

use crate::config::{AuthConfig, HostConfig};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Largest accepted frame; a 4K frame at PNG size fits comfortably.
pub const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// First message of every connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Hello {
    pub user_name: String,
    /// Bearer token; ignored for loopback peers.
    pub token: Option<String>,
}

pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

// ── Authenticator ────────────────────────────────────────────────

/// Turns a `Hello` into a [`Viewer`].
pub struct Authenticator {
    tokens: HashMap<String, (String, Role)>,
}

impl Authenticator {
    pub fn new(auth: &AuthConfig) -> Self {
        let tokens = auth
            .tokens
            .iter()
            .map(|t| (t.token.clone(), (t.user.clone(), t.role)))
            .collect();
        Self { tokens }
    }

    /// Loopback peers become `Localhost` owners. Everyone else needs a
    /// configured token, which fixes their user name and role.
    pub fn authenticate(
        &self,
        peer: IpAddr,
        hello: &Hello,
        connection_id: &str,
        context: CapturingContext,
    ) -> Option<Viewer> {
        let viewer = if peer.is_loopback() {
            Viewer::new(
                connection_id,
                hello.user_name.clone(),
                Role::Owner,
                AuthenticationType::Localhost,
            )
        } else {
            let (user, role) = self.tokens.get(hello.token.as_deref()?)?;
            Viewer::new(
                connection_id,
                user.clone(),
                *role,
                AuthenticationType::BearerToken,
            )
        };
        Some(viewer.with_ip(peer).with_context(context))
    }
}

// ── Connection ───────────────────────────────────────────────────

async fn send_event<T>(framed: &mut Framed<T, LengthDelimitedCodec>, event: &HostEvent) -> Result<(), BoxError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    framed.send(Bytes::from(event.to_bytes()?)).await?;
    Ok(())
}

/// Serve one viewer until it disconnects.
pub async fn serve_connection<T>(
    host: Arc<Host>,
    auth: Arc<Authenticator>,
    config: Arc<HostConfig>,
    io: T,
    peer: SocketAddr,
) -> Result<(), BoxError>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut framed = Framed::new(io, codec());

    let hello = match tokio::time::timeout(HELLO_TIMEOUT, framed.next()).await {
        Ok(Some(frame)) => bincode::deserialize::<Hello>(&frame?)?,
        Ok(None) => return Ok(()),
        Err(_) => return Err("no hello within timeout".into()),
    };

    let connection_id = uuid::Uuid::new_v4().to_string();
    let context = config.default_context(&connection_id);
    let Some(viewer) = auth.authenticate(peer.ip(), &hello, &connection_id, context) else {
        send_event(&mut framed, &HostEvent::CommandFailed("authentication failed".into())).await?;
        return Err(format!("authentication failed for {peer}").into());
    };
    let role = viewer.role;
    let max_viewers = config.network.max_viewers as usize;
    let registration = match host.connect_bounded(viewer, max_viewers) {
        Ok(registration) => registration,
        Err(Rejected::Full) => {
            send_event(&mut framed, &HostEvent::CommandFailed(Rejected::Full.to_string())).await?;
            return Err(format!("rejected {peer}: {max_viewers} viewers already connected").into());
        }
        Err(e) => return Err(e.to_string().into()),
    };
    info!(viewer = %connection_id, user = %hello.user_name, %peer, %role, "viewer connected");

    let mut events = registration.take_events().ok_or("event stream already taken")?;
    let slot = registration.frame_slot().ok_or("viewer vanished during setup")?;

    send_event(
        &mut framed,
        &HostEvent::ReceiveDisplays(host.registry().displays().to_vec()),
    )
    .await?;
    if let Some(display) = host.registry().selected_display(&connection_id) {
        send_event(&mut framed, &HostEvent::ReceiveScreenSize(display.size())).await?;
    }

    let (mut net_writer, mut net_reader) = framed.split();

    let mut audio = host.audio_feed(&connection_id);
    let mut audio_tick = tokio::time::interval(host.audio_interval());
    audio_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    // Host -> Network
    let writer_id = connection_id.clone();
    let writer = tokio::spawn(async move {
        'outer: loop {
            let batch = tokio::select! {
                event = events.recv() => match event {
                    Some(event) => vec![event],
                    None => break,
                },
                update = slot.wait() => match update {
                    Some(update) => vec![HostEvent::ReceiveScreenUpdate(update)],
                    None => break,
                },
                _ = audio_tick.tick() => audio
                    .drain()
                    .into_iter()
                    .map(HostEvent::ReceiveAudioChunk)
                    .collect(),
            };
            for event in batch {
                let bytes = match event.to_bytes() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(viewer = %writer_id, "failed to encode event: {e}");
                        continue;
                    }
                };
                if let Err(e) = net_writer.send(Bytes::from(bytes)).await {
                    debug!(viewer = %writer_id, "network write error: {e}");
                    break 'outer;
                }
            }
        }
    });

    // Network -> Host
    while let Some(frame) = net_reader.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                debug!(viewer = %connection_id, "network read error: {e}");
                break;
            }
        };
        match ViewerCommand::from_bytes(&frame) {
            Ok(command) => host.handle(&connection_id, command).await,
            Err(e) => warn!(viewer = %connection_id, "malformed command: {e}"),
        }
    }

    drop(registration);
    let _ = writer.await;
    info!(viewer = %connection_id, "viewer disconnected");
    Ok(())
}
