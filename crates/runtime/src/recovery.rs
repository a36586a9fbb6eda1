//! Crash recovery: `Active → Recovering → Active | Failed`.
//!
//! Monitors report exits over a channel; this loop turns each report into a
//! restart under the session gate.  A replacement worker reloads its own
//! state file, and when the session had any state the broker also pushes
//! its cached view with one `restore_history` request.

use std::sync::Arc;

use anyhow::{Result, anyhow};
use askd_core::{RequestKind, RuntimeConfig, WorkerRequest};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::broker::Broker;
use crate::link::call_worker;
use crate::registry::SessionPhase;
use crate::supervisor::SupervisorEvent;

pub async fn run_recovery(
    broker: Arc<Broker>,
    mut events: mpsc::UnboundedReceiver<SupervisorEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            event = events.recv() => match event {
                Some(event) => {
                    let broker = broker.clone();
                    tokio::spawn(async move { broker.on_worker_exit(event).await });
                }
                None => break,
            },
        }
    }
    debug!("recovery loop stopped");
}

impl Broker {
    pub(crate) async fn on_worker_exit(&self, event: SupervisorEvent) {
        let SupervisorEvent::WorkerExited {
            client_id,
            generation,
            pid,
            status,
        } = event;

        if self.is_closing() {
            return;
        }
        let Some(gate) = self.registry.gate(&client_id) else {
            debug!(%client_id, pid, "exit for an untracked session");
            return;
        };
        let _guard = gate.lock().await;

        let current = self.registry.with_session(&client_id, |s| {
            Arc::ptr_eq(&s.gate, &gate)
                && s.generation == generation
                && s.phase == SessionPhase::Active
        });
        if current != Some(true) {
            debug!(%client_id, pid, generation, "ignoring exit of a replaced worker");
            return;
        }

        if let Err(err) = self.recover_locked(&client_id, &status).await {
            error!(%client_id, ?err, "worker recovery failed");
        }
    }

    /// Replace a dead worker.  Caller holds the session gate.
    pub(crate) async fn recover_locked(&self, client_id: &str, cause: &str) -> Result<()> {
        let (cached_config, old_monitor) = self
            .registry
            .with_session(client_id, |s| {
                s.pid = None;
                (s.config, s.monitor.take())
            })
            .ok_or_else(|| anyhow!("no session for {client_id}"))?;
        if let Some(monitor) = old_monitor {
            monitor.stop().await;
        }

        let launch = self.next_launch(client_id, SessionPhase::Recovering)?;
        info!(%client_id, instance_id = %launch.instance_id, cause, "recovering worker");

        let history = self
            .load_state(&launch)
            .await
            .map(|prior| prior.conversation_history)
            .unwrap_or_default();

        let worker = match self.supervisor.spawn(&launch).await {
            Ok(worker) => worker,
            Err(err) => {
                let reason = format!("{err:#}");
                self.registry.with_session(client_id, |s| {
                    s.phase = SessionPhase::Failed(reason);
                    s.pid = None;
                });
                return Err(err);
            }
        };
        self.registry.with_session(client_id, |s| {
            s.phase = SessionPhase::Active;
            s.pid = Some(worker.pid);
            s.monitor = Some(worker.monitor);
            s.conversation_count = history.len();
        });

        if history.is_empty() && cached_config == RuntimeConfig::default() {
            info!(%client_id, "worker recovered with empty state");
            return Ok(());
        }

        let restored = history.len();
        let request = WorkerRequest::new(
            &launch.instance_id,
            RequestKind::RestoreHistory {
                history,
                profile: Some(cached_config.profile.to_string()),
                show_reasoning: Some(cached_config.show_reasoning),
                output_format: Some(cached_config.output_format.to_string()),
            },
        );
        match call_worker(&launch.socket_path, &request, self.request_timeout()).await {
            Ok(response) if response.is_success() => {
                self.absorb(client_id, &response);
                info!(%client_id, restored, "worker recovered");
            }
            Ok(response) => {
                warn!(%client_id, message = response.message(), "restore_history rejected");
            }
            Err(err) => warn!(%client_id, ?err, "restore_history failed"),
        }
        Ok(())
    }
}
