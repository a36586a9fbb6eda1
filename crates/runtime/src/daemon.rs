//! The broker daemon: accept loop on the well-known socket plus the
//! background recovery and reaper tasks.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use askd_config::AppConfig;
use askd_core::{ClientCommand, ClientRequest, DaemonReply, RuntimePaths};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, instrument, warn};

use crate::broker::Broker;
use crate::reaper::run_reaper;
use crate::recovery::run_recovery;

/// Requests larger than this are cut off and fail to parse.
const MAX_REQUEST_BYTES: u64 = 1024 * 1024;

/// Run the daemon until a `shutdown` command arrives or `external_shutdown`
/// flips to true.  Every worker is stopped before this returns.
pub async fn run_daemon(
    config: Arc<AppConfig>,
    config_path: Option<PathBuf>,
    runtime_dir: PathBuf,
    mut external_shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let socket_path = config.daemon_socket(&runtime_dir);
    claim_socket(&socket_path).await?;

    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("failed to bind {}", socket_path.display()))?;
    fs::set_permissions(&socket_path, fs::Permissions::from_mode(0o600))
        .with_context(|| format!("failed to restrict {}", socket_path.display()))?;
    info!(socket = %socket_path.display(), "askd daemon listening");

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let broker = Arc::new(Broker::new(
        config.clone(),
        config_path,
        RuntimePaths::new(&runtime_dir),
        events_tx,
    ));
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let recovery = tokio::spawn(run_recovery(
        broker.clone(),
        events_rx,
        shutdown_rx.clone(),
    ));
    let reaper = tokio::spawn(run_reaper(
        broker.clone(),
        Duration::from_secs(config.daemon.reaper_interval_secs.max(1)),
        shutdown_rx.clone(),
    ));
    let read_timeout = Duration::from_secs(config.daemon.client_read_timeout_secs.max(1));

    loop {
        tokio::select! {
            biased;
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("shutdown requested by client");
                    break;
                }
            }
            changed = external_shutdown.changed() => {
                if changed.is_err() || *external_shutdown.borrow() {
                    info!("termination signal received");
                    break;
                }
            }
            accept = listener.accept() => match accept {
                Ok((stream, _)) => {
                    let broker = broker.clone();
                    let shutdown_tx = shutdown_tx.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(broker, stream, shutdown_tx, read_timeout).await {
                            debug!(?err, "client connection ended with error");
                        }
                    });
                }
                Err(err) => warn!(?err, "accept failed"),
            },
        }
    }

    let _ = shutdown_tx.send(true);
    broker.shutdown().await;
    let _ = recovery.await;
    let _ = reaper.await;

    if let Err(err) = fs::remove_file(&socket_path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(?err, "failed to remove daemon socket");
        }
    }
    info!("askd daemon stopped");
    Ok(())
}

/// Refuse to start over a live daemon; unlink a stale socket file.
async fn claim_socket(socket_path: &Path) -> Result<()> {
    if fs::symlink_metadata(socket_path).is_err() {
        return Ok(());
    }
    if UnixStream::connect(socket_path).await.is_ok() {
        bail!("askd is already running on {}", socket_path.display());
    }
    info!(socket = %socket_path.display(), "removing stale daemon socket");
    fs::remove_file(socket_path)
        .with_context(|| format!("failed to remove stale socket {}", socket_path.display()))
}

#[instrument(skip_all)]
async fn handle_connection(
    broker: Arc<Broker>,
    stream: UnixStream,
    shutdown_tx: watch::Sender<bool>,
    read_timeout: Duration,
) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half.take(MAX_REQUEST_BYTES));
    let mut line = String::new();

    let (reply, stop_daemon) =
        match tokio::time::timeout(read_timeout, reader.read_line(&mut line)).await {
            Err(_) => (DaemonReply::err("timed out waiting for a request"), false),
            Ok(Err(err)) => (DaemonReply::err(format!("failed to read request: {err}")), false),
            // Connected and closed without a request: a liveness check.
            Ok(Ok(0)) => return Ok(()),
            Ok(Ok(_)) => dispatch(&broker, line.trim()).await,
        };

    let mut payload = serde_json::to_string(&reply)?;
    payload.push('\n');
    write_half.write_all(payload.as_bytes()).await?;
    write_half.flush().await?;
    write_half.shutdown().await?;

    if stop_daemon {
        let _ = shutdown_tx.send(true);
    }
    Ok(())
}

/// Parse and run one request.  The flag is set when the daemon should exit
/// after replying.
async fn dispatch(broker: &Broker, raw: &str) -> (DaemonReply, bool) {
    let request: ClientRequest = match serde_json::from_str(raw) {
        Ok(request) => request,
        Err(err) => return (DaemonReply::err(format!("invalid request: {err}")), false),
    };
    let command = match ClientCommand::try_from(request) {
        Ok(command) => command,
        Err(err) => return (DaemonReply::err(err), false),
    };
    let stop_daemon = command == ClientCommand::Shutdown;
    (broker.handle(command).await, stop_daemon)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DaemonClient;
    use tempfile::TempDir;

    struct Running {
        _dir: TempDir,
        socket: PathBuf,
        signal: watch::Sender<bool>,
        task: tokio::task::JoinHandle<Result<()>>,
    }

    async fn start() -> Running {
        let dir = TempDir::new().unwrap();
        let mut config = AppConfig::default();
        config.worker.program = dir.path().join("no-such-worker").display().to_string();
        config.worker.ready_attempts = 2;
        config.worker.ready_interval_ms = 10;
        let config = Arc::new(config);
        let socket = config.daemon_socket(dir.path());

        let (signal, signal_rx) = watch::channel(false);
        let task = tokio::spawn(run_daemon(
            config,
            None,
            dir.path().to_path_buf(),
            signal_rx,
        ));
        let client = DaemonClient::new(&socket);
        client.connect_with_backoff(20).await.unwrap();
        Running {
            _dir: dir,
            socket,
            signal,
            task,
        }
    }

    async fn send_raw(socket: &Path, raw: &str) -> DaemonReply {
        let stream = UnixStream::connect(socket).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        write_half.write_all(raw.as_bytes()).await.unwrap();
        write_half.write_all(b"\n").await.unwrap();
        let mut line = String::new();
        BufReader::new(read_half).read_line(&mut line).await.unwrap();
        serde_json::from_str(line.trim()).unwrap()
    }

    #[tokio::test]
    async fn serves_help_and_rejects_bad_requests() {
        let daemon = start().await;

        let help = send_raw(&daemon.socket, r#"{"command":"/help"}"#).await;
        assert!(help.into_result().unwrap().as_str().unwrap().contains("ask"));

        let garbage = send_raw(&daemon.socket, "not json").await;
        assert!(garbage.into_result().unwrap_err().starts_with("invalid request"));

        let missing = send_raw(&daemon.socket, r#"{"command":"/ask","question":"hi"}"#).await;
        assert!(missing.into_result().unwrap_err().contains("client_id"));

        let bad_profile = send_raw(
            &daemon.socket,
            r#"{"command":"/config","client_id":"c1","profile":"medium"}"#,
        )
        .await;
        assert!(bad_profile.into_result().unwrap_err().contains("high, default, low"));

        daemon.signal.send(true).unwrap();
        daemon.task.await.unwrap().unwrap();
        assert!(!daemon.socket.exists());
    }

    #[tokio::test]
    async fn shutdown_command_replies_then_exits() {
        let daemon = start().await;
        let reply = send_raw(&daemon.socket, r#"{"command":"shutdown"}"#).await;
        assert_eq!(reply.into_result().unwrap(), "daemon shutting down");

        tokio::time::timeout(Duration::from_secs(5), daemon.task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!daemon.socket.exists());
    }

    #[tokio::test]
    async fn second_daemon_on_a_live_socket_is_refused() {
        let daemon = start().await;
        let (_tx, rx) = watch::channel(false);
        let mut config = AppConfig::default();
        config.daemon.socket_path = daemon.socket.display().to_string();
        let err = run_daemon(Arc::new(config), None, daemon.socket.parent().unwrap().to_path_buf(), rx)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already running"));

        daemon.signal.send(true).unwrap();
        daemon.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn stale_socket_file_is_replaced() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("askd.sock");
        drop(std::os::unix::net::UnixListener::bind(&socket).unwrap());
        assert!(socket.exists());

        claim_socket(&socket).await.unwrap();
        assert!(!socket.exists());
    }
}
