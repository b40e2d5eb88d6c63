//! Host agent service core logic.
//!
//! Owns the [`Host`] and the TCP listener that accepts viewers. Each
//! accepted connection is served on its own task by
//! [`transport::serve_connection`].

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};

use viewport_core::Host;

use crate::config::HostConfig;
use crate::transport::{self, Authenticator};

// ── HostService ──────────────────────────────────────────────────

/// The top-level agent service.
pub struct HostService {
    config: Arc<HostConfig>,
    host: Arc<Host>,
    auth: Arc<Authenticator>,
    running: Arc<AtomicBool>,
}

impl HostService {
    pub fn new(config: HostConfig, host: Host) -> Self {
        let auth = Arc::new(Authenticator::new(&config.auth));
        Self {
            config: Arc::new(config),
            host: Arc::new(host),
            auth,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Obtain a handle that can be used to stop the service from
    /// another task. Storing `false` takes effect even before
    /// [`serve`](Self::serve) starts.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn host(&self) -> &Arc<Host> {
        &self.host
    }

    /// Bind the configured address and serve until stopped.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let addr: SocketAddr = format!(
            "{}:{}",
            self.config.network.bind_address, self.config.network.port
        )
        .parse()?;
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await;
        Ok(())
    }

    /// Accept viewers on `listener` until stopped, then shut the host
    /// down. Returns at once if the service was already stopped.
    pub async fn serve(&self, listener: TcpListener) {
        match listener.local_addr() {
            Ok(addr) => info!("viewport agent listening on {addr}"),
            Err(e) => warn!("listener has no local address: {e}"),
        }

        while self.running.load(Ordering::SeqCst) {
            let accept = tokio::select! {
                result = listener.accept() => result,
                _ = Self::wait_for_stop(&self.running) => break,
            };

            let (stream, peer) = match accept {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("accept error: {e}");
                    continue;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                warn!("set_nodelay failed for {peer}: {e}");
            }

            let host = Arc::clone(&self.host);
            let auth = Arc::clone(&self.auth);
            let config = Arc::clone(&self.config);
            tokio::spawn(async move {
                if let Err(e) = transport::serve_connection(host, auth, config, stream, peer).await {
                    warn!("connection from {peer} ended: {e}");
                }
            });
        }

        self.host.shutdown().await;
        info!("viewport agent stopped");
    }

    /// Signal the service to stop.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// `true` until the service is stopped.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Resolves when `running` becomes false.
    async fn wait_for_stop(running: &Arc<AtomicBool>) {
        loop {
            if !running.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use viewport_core::{HostOptions, SyntheticBackend};

    fn service() -> HostService {
        let backend = Arc::new(SyntheticBackend::with_default_displays());
        let host = Host::start(backend, HostOptions::default()).unwrap();
        HostService::new(HostConfig::default(), host)
    }

    #[tokio::test]
    async fn service_creates_with_defaults() {
        let svc = service();
        assert!(svc.is_running());
        assert_eq!(svc.host().backend_name(), "synthetic");
    }

    #[tokio::test]
    async fn stop_handle_ends_serving() {
        let svc = Arc::new(service());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let task = tokio::spawn({
            let svc = Arc::clone(&svc);
            async move { svc.serve(listener).await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!task.is_finished());
        svc.stop_handle().store(false, Ordering::SeqCst);
        tokio::time::timeout(std::time::Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert!(!svc.is_running());
    }

    #[tokio::test]
    async fn stop_before_serve_is_honored() {
        let svc = service();
        svc.stop_handle().store(false, Ordering::SeqCst);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        tokio::time::timeout(std::time::Duration::from_millis(500), svc.serve(listener))
            .await
            .unwrap();
        assert!(!svc.is_running());
    }
}
