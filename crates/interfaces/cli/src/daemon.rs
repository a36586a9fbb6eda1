use std::fs::{self, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use fs2::FileExt;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tracing::info;

use askd_config::{AppConfig, resolve_runtime_dir};
use askd_core::RuntimePaths;
use askd_runtime::run_daemon;

/// Foreground daemon: take the runtime-dir lock, record the pid, and serve
/// until a shutdown command or SIGTERM/SIGINT.
pub(crate) async fn run_daemon_process(config: AppConfig, config_path: Option<PathBuf>) -> Result<()> {
    let runtime_dir = resolve_runtime_dir(config.runtime_dir_override().as_deref())?;
    let paths = RuntimePaths::new(&runtime_dir);

    let lock_path = paths.daemon_lock();
    let lock_file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .mode(0o600)
        .open(&lock_path)
        .with_context(|| format!("failed to open {}", lock_path.display()))?;
    lock_file
        .try_lock_exclusive()
        .map_err(|_| anyhow!("another askd daemon already holds {}", lock_path.display()))?;

    let pid_file = runtime_dir.join("askd.pid");
    fs::write(&pid_file, std::process::id().to_string())?;
    info!(pid = std::process::id(), runtime_dir = %runtime_dir.display(), "askd daemon starting");

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let (signal_tx, signal_rx) = watch::channel(false);
    let signals = tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {},
            _ = sigint.recv() => {},
        }
        let _ = signal_tx.send(true);
        // Keep the sender alive so the daemon sees the value, not a hangup.
        std::future::pending::<()>().await;
    });

    let result = run_daemon(Arc::new(config), config_path, runtime_dir, signal_rx).await;

    signals.abort();
    let _ = fs::remove_file(&pid_file);
    // Dropping the file releases the lock.
    drop(lock_file);
    result
}
