//! Worker process lifecycle: spawn, readiness, crash monitoring, and stop.
//!
//! Each spawned worker gets a monitor task that owns its [`Child`].  The
//! monitor never touches the registry: an unexpected exit is reported as a
//! [`SupervisorEvent`] and handled by the recovery loop.

use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use askd_config::AppConfig;
use askd_core::RuntimePaths;
use askd_exec::process::{SIGTERM, send_signal};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    WorkerExited {
        client_id: String,
        generation: u64,
        pid: u32,
        status: String,
    },
}

/// Handle to a running monitor.  Dropping it stops the worker as well.
pub struct MonitorHandle {
    stop_tx: Option<oneshot::Sender<()>>,
    join: JoinHandle<()>,
}

impl MonitorHandle {
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Gracefully stop the worker and wait until it is gone.
    pub async fn stop(mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Err(err) = (&mut self.join).await {
            warn!(?err, "worker monitor panicked");
        }
    }

    /// A monitor with no process behind it that runs until stopped.
    #[cfg(test)]
    pub(crate) fn parked() -> Self {
        Self::lingering(Duration::ZERO, Default::default())
    }

    /// Like [`MonitorHandle::parked`], but its "worker" takes `exit_delay`
    /// to go away after a stop and then sets `exited`.
    #[cfg(test)]
    pub(crate) fn lingering(
        exit_delay: Duration,
        exited: std::sync::Arc<std::sync::atomic::AtomicBool>,
    ) -> Self {
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let join = tokio::spawn(async move {
            let _ = stop_rx.await;
            tokio::time::sleep(exit_delay).await;
            exited.store(true, Ordering::SeqCst);
        });
        Self {
            stop_tx: Some(stop_tx),
            join,
        }
    }
}

pub struct SpawnedWorker {
    pub pid: u32,
    pub monitor: MonitorHandle,
}

/// Everything needed to launch one worker.
#[derive(Debug, Clone)]
pub struct WorkerLaunch {
    pub client_id: String,
    pub instance_id: String,
    pub generation: u64,
    pub socket_path: PathBuf,
    pub state_path: PathBuf,
}

pub struct Supervisor {
    config: AppConfig,
    config_path: Option<PathBuf>,
    paths: RuntimePaths,
    events: mpsc::UnboundedSender<SupervisorEvent>,
    spawned: AtomicU64,
}

impl Supervisor {
    pub fn new(
        config: AppConfig,
        config_path: Option<PathBuf>,
        paths: RuntimePaths,
        events: mpsc::UnboundedSender<SupervisorEvent>,
    ) -> Self {
        Self {
            config,
            config_path,
            paths,
            events,
            spawned: AtomicU64::new(0),
        }
    }

    /// Worker processes launched since the daemon started.
    pub fn workers_spawned(&self) -> u64 {
        self.spawned.load(Ordering::SeqCst)
    }

    fn program(&self) -> Result<PathBuf> {
        let configured = self.config.worker.program.trim();
        if configured.is_empty() {
            std::env::current_exe().context("cannot locate the askd executable")
        } else {
            Ok(PathBuf::from(configured))
        }
    }

    /// Launch a worker and wait until its socket accepts connections.
    pub async fn spawn(&self, launch: &WorkerLaunch) -> Result<SpawnedWorker> {
        let program = self.program()?;
        let log_path = self.paths.worker_log(&launch.instance_id);
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o600)
            .open(&log_path)
            .with_context(|| format!("failed to open worker log {}", log_path.display()))?;

        let mut cmd = Command::new(&program);
        if let Some(path) = &self.config_path {
            cmd.arg("--config").arg(path);
        }
        cmd.arg("worker")
            .arg("--instance-id")
            .arg(&launch.instance_id)
            .arg("--client-id")
            .arg(&launch.client_id)
            .arg("--socket")
            .arg(&launch.socket_path)
            .arg("--state")
            .arg(&launch.state_path)
            .env("ASKD_RUNTIME_DIR", self.paths.dir())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(log))
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn worker {}", program.display()))?;
        self.spawned.fetch_add(1, Ordering::SeqCst);
        let pid = child
            .id()
            .context("worker exited before its pid could be read")?;
        info!(
            client_id = %launch.client_id,
            instance_id = %launch.instance_id,
            pid,
            generation = launch.generation,
            "worker spawned"
        );

        if let Err(err) = self.wait_ready(&mut child, &launch.socket_path).await {
            let _ = child.kill().await;
            return Err(err);
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let join = tokio::spawn(monitor(
            child,
            launch.clone(),
            pid,
            Duration::from_millis(self.config.worker.stop_grace_ms),
            stop_rx,
            self.events.clone(),
        ));

        Ok(SpawnedWorker {
            pid,
            monitor: MonitorHandle {
                stop_tx: Some(stop_tx),
                join,
            },
        })
    }

    async fn wait_ready(&self, child: &mut Child, socket: &Path) -> Result<()> {
        let attempts = self.config.worker.ready_attempts.max(1);
        let interval = Duration::from_millis(self.config.worker.ready_interval_ms);

        for _ in 0..attempts {
            if UnixStream::connect(socket).await.is_ok() {
                return Ok(());
            }
            if let Some(status) = child.try_wait()? {
                bail!(
                    "worker exited during startup ({status}); see its log in {}",
                    self.paths.dir().display()
                );
            }
            tokio::time::sleep(interval).await;
        }

        bail!(
            "worker did not become ready on {} after {attempts} attempts",
            socket.display()
        )
    }
}

async fn monitor(
    mut child: Child,
    launch: WorkerLaunch,
    pid: u32,
    grace: Duration,
    stop_rx: oneshot::Receiver<()>,
    events: mpsc::UnboundedSender<SupervisorEvent>,
) {
    tokio::select! {
        status = child.wait() => {
            let status = match status {
                Ok(status) => status.to_string(),
                Err(err) => format!("wait failed: {err}"),
            };
            warn!(client_id = %launch.client_id, pid, %status, "worker exited unexpectedly");
            let _ = events.send(SupervisorEvent::WorkerExited {
                client_id: launch.client_id,
                generation: launch.generation,
                pid,
                status,
            });
        }
        // A dropped sender counts as a stop request too.
        _ = stop_rx => {
            stop_child(&mut child, pid, grace).await;
            remove_socket(&launch.socket_path);
            info!(client_id = %launch.client_id, pid, "worker stopped");
        }
    }
}

/// SIGTERM, wait up to `grace` for the checkpoint, then SIGKILL.
async fn stop_child(child: &mut Child, pid: u32, grace: Duration) {
    if let Err(err) = send_signal(pid, SIGTERM) {
        debug!(pid, ?err, "SIGTERM failed; worker may already be gone");
    }
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => debug!(pid, %status, "worker exited after SIGTERM"),
        Ok(Err(err)) => warn!(pid, ?err, "waiting for worker failed"),
        Err(_) => {
            warn!(pid, grace_ms = grace.as_millis() as u64, "worker ignored SIGTERM; killing");
            let _ = child.kill().await;
        }
    }
}

fn remove_socket(path: &Path) {
    if let Err(err) = std::fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(?err, path = %path.display(), "failed to remove worker socket");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    /// A stand-in worker: a shell script that ignores the worker arguments.
    fn script_supervisor(
        dir: &TempDir,
        body: &str,
    ) -> (Supervisor, mpsc::UnboundedReceiver<SupervisorEvent>) {
        use std::os::unix::fs::PermissionsExt;

        let script = dir.path().join("fake-worker.sh");
        fs::write(&script, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = AppConfig::default();
        config.worker.program = script.display().to_string();
        config.worker.ready_attempts = 10;
        config.worker.ready_interval_ms = 20;
        config.worker.stop_grace_ms = 200;

        let (tx, rx) = mpsc::unbounded_channel();
        (
            Supervisor::new(config, None, RuntimePaths::new(dir.path()), tx),
            rx,
        )
    }

    fn launch(dir: &TempDir) -> WorkerLaunch {
        WorkerLaunch {
            client_id: "c1".into(),
            instance_id: "inst1".into(),
            generation: 1,
            socket_path: dir.path().join("worker.sock"),
            state_path: dir.path().join("state.json"),
        }
    }

    #[tokio::test]
    async fn worker_that_never_listens_fails_readiness() {
        let dir = TempDir::new().unwrap();
        let (supervisor, _rx) = script_supervisor(&dir, "sleep 30");
        let err = supervisor.spawn(&launch(&dir)).await.err().unwrap();
        assert!(err.to_string().contains("did not become ready"));
        assert_eq!(supervisor.workers_spawned(), 1);
    }

    #[tokio::test]
    async fn worker_that_dies_at_startup_is_reported() {
        let dir = TempDir::new().unwrap();
        let (supervisor, _rx) = script_supervisor(&dir, "echo boom >&2; exit 7");
        let err = supervisor.spawn(&launch(&dir)).await.err().unwrap();
        assert!(err.to_string().contains("exited during startup"), "{err}");
        let log = fs::read_to_string(dir.path().join("worker-inst1.log")).unwrap();
        assert!(log.contains("boom"));
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let dir = TempDir::new().unwrap();
        let mut config = AppConfig::default();
        config.worker.program = dir.path().join("absent").display().to_string();
        let (tx, _rx) = mpsc::unbounded_channel();
        let supervisor = Supervisor::new(config, None, RuntimePaths::new(dir.path()), tx);
        assert!(supervisor.spawn(&launch(&dir)).await.is_err());
        assert_eq!(supervisor.workers_spawned(), 0);
    }
}
