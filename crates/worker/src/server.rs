use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use askd_exec::Backend;
use askd_store::{Expected, PersistedState, StateStore};
use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::state::WorkerState;

const MAX_REQUEST_BYTES: u64 = 4 * 1024 * 1024;
const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub instance_id: String,
    pub client_id: String,
    pub socket_path: PathBuf,
    pub state_path: PathBuf,
    pub max_turns: usize,
    pub history_in_prompt: usize,
    pub store: StateStore,
    pub parent_pid: Option<u32>,
}

/// Serve one conversation until `shutdown` flips (or its sender drops).
///
/// The socket is bound before the saved state is read so readiness checks
/// queue in the listen backlog while loading runs.  No request is handled
/// until loading finished, which keeps an explicit `restore_history` from
/// being overwritten by the file.
pub async fn run_worker(
    opts: WorkerOptions,
    backend: &dyn Backend,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    remove_stale_socket(&opts.socket_path)?;
    let listener = UnixListener::bind(&opts.socket_path)
        .with_context(|| format!("failed to bind {}", opts.socket_path.display()))?;
    fs::set_permissions(&opts.socket_path, fs::Permissions::from_mode(0o600))
        .with_context(|| format!("failed to restrict {}", opts.socket_path.display()))?;
    info!(
        instance_id = %opts.instance_id,
        socket = %opts.socket_path.display(),
        "worker listening"
    );

    let mut state = WorkerState::new(&opts.instance_id, opts.max_turns, opts.history_in_prompt);
    let mut created_at = Utc::now();

    let load = {
        let store = opts.store.clone();
        let path = opts.state_path.clone();
        let instance_id = opts.instance_id.clone();
        let client_id = opts.client_id.clone();
        tokio::task::spawn_blocking(move || {
            store.load(
                &path,
                Expected {
                    instance_id: &instance_id,
                    client_id: Some(&client_id),
                },
            )
        })
    };

    let loaded = tokio::select! {
        loaded = load => loaded.context("state load task failed")?,
        _ = shutdown.changed() => {
            info!(instance_id = %opts.instance_id, "shutdown before state load finished");
            cleanup_socket(&opts);
            return Ok(());
        }
    };
    if let Some(persisted) = loaded {
        info!(
            instance_id = %opts.instance_id,
            turns = persisted.conversation_history.len(),
            "resuming saved conversation"
        );
        created_at = persisted.created_at;
        state.seed(persisted);
    }
    checkpoint(&opts, &state, created_at).await;

    loop {
        let stream = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(err) => {
                    warn!(?err, "accept failed");
                    continue;
                }
            },
        };

        let dirty = tokio::select! {
            biased;
            _ = shutdown.changed() => {
                info!(instance_id = %opts.instance_id, "shutdown during request; aborting it");
                break;
            }
            served = serve_connection(&mut state, stream, backend) => match served {
                Ok(dirty) => dirty,
                Err(err) => {
                    debug!(?err, "connection error");
                    false
                }
            },
        };

        if dirty {
            checkpoint(&opts, &state, created_at).await;
        }
    }

    checkpoint(&opts, &state, created_at).await;
    cleanup_socket(&opts);
    info!(instance_id = %opts.instance_id, turns = state.turn_count(), "worker stopped");
    Ok(())
}

/// One request per connection.  A connection that closes without sending
/// anything is a readiness check.
#[instrument(skip_all, fields(instance_id = %state.instance_id()))]
async fn serve_connection(
    state: &mut WorkerState,
    stream: UnixStream,
    backend: &dyn Backend,
) -> Result<bool> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half.take(MAX_REQUEST_BYTES));
    let mut line = String::new();

    let bytes = tokio::time::timeout(REQUEST_READ_TIMEOUT, reader.read_line(&mut line))
        .await
        .context("request read timed out")??;
    if bytes == 0 || line.trim().is_empty() {
        return Ok(false);
    }

    let handled = state.handle_line(line.trim(), backend).await;

    let mut payload = serde_json::to_vec(&handled.response)?;
    payload.push(b'\n');
    if let Err(err) = write_half.write_all(&payload).await {
        // The state change stands even if the caller went away.
        warn!(?err, "failed to deliver response");
        return Ok(handled.dirty);
    }
    let _ = write_half.flush().await;
    let _ = write_half.shutdown().await;
    Ok(handled.dirty)
}

async fn checkpoint(opts: &WorkerOptions, state: &WorkerState, created_at: DateTime<Utc>) {
    let document = PersistedState {
        instance_id: opts.instance_id.clone(),
        client_id: Some(opts.client_id.clone()),
        parent_pid: opts.parent_pid,
        socket_path: Some(opts.socket_path.clone()),
        conversation_history: state.history(),
        config: state.config(),
        created_at,
        saved_at: Utc::now(),
    };
    let store = opts.store.clone();
    let path = opts.state_path.clone();

    match tokio::task::spawn_blocking(move || store.save(&path, &document)).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(instance_id = %opts.instance_id, %err, "checkpoint failed"),
        Err(err) => warn!(instance_id = %opts.instance_id, ?err, "checkpoint task failed"),
    }
}

fn remove_stale_socket(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "removed stale socket");
            Ok(())
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("failed to remove {}", path.display())),
    }
}

fn cleanup_socket(opts: &WorkerOptions) {
    if let Err(err) = fs::remove_file(&opts.socket_path) {
        if err.kind() != ErrorKind::NotFound {
            warn!(?err, path = %opts.socket_path.display(), "failed to remove socket");
        }
    }
}
