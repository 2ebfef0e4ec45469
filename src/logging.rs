//! Tracing setup for a long-running scan service.
//!
//! Scans run headless, so log output goes to systemd's journal where
//! available and to a daily-rolled file otherwise. Stdout stays reserved
//! for the JSON results the binary prints.

use anyhow::Result;
use std::path::PathBuf;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global tracing subscriber. Call once at startup.
///
/// The filter comes from the `MEDIASCAN_LOG` environment variable
/// (`trace`/`debug`/`info`/`warn`/`error`, default `info`). On Linux the
/// journald layer is preferred; when journald is not reachable, or on other
/// platforms, logs roll daily into `log_dir` (default: the local data
/// directory).
pub fn init(log_dir: Option<PathBuf>) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_env("MEDIASCAN_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(target_os = "linux")]
    {
        if let Ok(journald_layer) = tracing_journald::layer() {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(journald_layer)
                .init();

            tracing::info!("logging to journald");
            return Ok(());
        }
    }

    let log_dir = log_dir.unwrap_or_else(|| {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("mediascan")
            .join("logs")
    });

    std::fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, "mediascan.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    // The worker guard must outlive the process; park it in a static since
    // init runs once.
    static GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
        std::sync::OnceLock::new();
    let _ = GUARD.set(_guard);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();

    tracing::info!(dir = ?log_dir, "logging to rolling file");
    Ok(())
}
