//! Viewport agent entry point.
//!
//! ```text
//! viewport-agent                      Run in the foreground
//! viewport-agent --config <path>      Load a custom config TOML
//! viewport-agent --backend synthetic  Override the display backend
//! viewport-agent --gen-config         Write default config to --config path
//! ```

use std::path::{Path, PathBuf};

use clap::Parser;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use viewport_agent::config::HostConfig;
use viewport_agent::service::HostService;
use viewport_core::{open_backend, BackendKind, Host};

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "viewport-agent", about = "Viewport remote-control host agent")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "viewport-agent.toml")]
    config: PathBuf,

    /// Display backend, overriding `[capture] backend`.
    #[arg(long)]
    backend: Option<BackendKind>,

    /// Write the default configuration to the `--config` path and exit.
    #[arg(long)]
    gen_config: bool,
}

/// Stderr logging, or a log file when `[logging] file` is set.
fn init_tracing(config: &HostConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    if config.logging.file.is_empty() {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        return None;
    }

    let path = Path::new(&config.logging.file);
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "viewport-agent.log".into());
    let appender = tracing_appender::rolling::never(dir, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
    Some(guard)
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // --gen-config: bootstrap a config file and exit.
    if cli.gen_config {
        HostConfig::write_default(&cli.config)
            .map_err(|e| format!("cannot write {}: {e}", cli.config.display()))?;
        println!("wrote default configuration to {}", cli.config.display());
        return Ok(());
    }

    let mut config = HostConfig::load(&cli.config);
    if let Some(kind) = cli.backend {
        config.capture.backend = kind;
    }
    let _guard = init_tracing(&config);

    info!("viewport-agent v{}", env!("CARGO_PKG_VERSION"));
    info!("listening on {}:{}", config.network.bind_address, config.network.port);
    info!("backend: {}", config.capture.backend);
    info!("remote tokens: {}", config.auth.tokens.len());

    let backend = open_backend(config.capture.backend)?;
    let host = Host::start(backend, config.to_host_options())?;
    let service = HostService::new(config, host);
    let stop = service.stop_handle();

    // Ctrl-C handler.
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received; shutting down");
        stop.store(false, std::sync::atomic::Ordering::SeqCst);
    });

    service.run().await?;

    Ok(())
}
