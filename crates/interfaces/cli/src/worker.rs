use std::os::unix::process::parent_id;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Args;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tracing::{info, warn};

use askd_config::AppConfig;
use askd_exec::CommandBackend;
use askd_store::StateStore;
use askd_worker::{WorkerOptions, run_worker};

#[derive(Debug, Args)]
pub(crate) struct WorkerArgs {
    #[arg(long)]
    instance_id: String,
    #[arg(long)]
    client_id: String,
    #[arg(long)]
    socket: PathBuf,
    #[arg(long)]
    state: PathBuf,
}

/// Worker entry point, launched by the daemon's supervisor.
pub(crate) async fn run_worker_process(config: &AppConfig, args: WorkerArgs) -> Result<()> {
    let parent = parent_id();
    let opts = WorkerOptions {
        instance_id: args.instance_id,
        client_id: args.client_id,
        socket_path: args.socket,
        state_path: args.state,
        max_turns: config.worker.max_turns,
        history_in_prompt: config.backend.history_turns_in_prompt,
        store: StateStore::new(config.store.fsync, config.store.max_age_hours),
        parent_pid: Some(parent),
    };
    let backend = CommandBackend::from_config(&config.backend);

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let (stop_tx, stop_rx) = watch::channel(false);
    let watcher = tokio::spawn(async move {
        let mut orphan_check = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("SIGTERM received; checkpointing");
                    break;
                }
                _ = sigint.recv() => {
                    info!("SIGINT received; checkpointing");
                    break;
                }
                _ = orphan_check.tick() => {
                    if parent_id() != parent {
                        warn!(parent, "daemon is gone; worker exiting");
                        break;
                    }
                }
            }
        }
        let _ = stop_tx.send(true);
        std::future::pending::<()>().await;
    });

    let result = run_worker(opts, &backend, stop_rx).await;
    watcher.abort();
    result
}
