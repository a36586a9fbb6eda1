//! Client command dispatch on top of the session registry and supervisor.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow, bail};
use askd_config::AppConfig;
use askd_core::{
    ClientCommand, ConfigAction, DaemonReply, RequestKind, RuntimeConfig, RuntimePaths,
    WorkerReply, WorkerRequest, WorkerResponse, current_uid, derive_instance_id,
};
use askd_store::{Expected, PersistedState, StateStore};
use futures::future::join_all;
use serde_json::{Value, json};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tracing::{info, instrument, warn};

use crate::link::call_worker;
use crate::registry::{Session, SessionPhase, SessionRegistry};
use crate::supervisor::{Supervisor, SupervisorEvent, WorkerLaunch};

pub const HELP_TEXT: &str = "\
askd commands (leading '/' and 'codex-' optional):
  ask <question>          send a question to this client's assistant (alias: query)
  config [profile]        show settings, or set profile: high, default, low
  reasoning on|off        include the reasoning trace in answers
  output-format on|off    on: final answer only; off: append run details (alias: final-only)
  status [client_id]      one session, or every tracked session
  health                  daemon uptime and worker summary
  stop                    stop this client's worker
  shutdown                stop every worker and exit the daemon
  help                    this text";

/// Where to reach a ready worker.  While this is alive the session counts
/// a request in flight and the reaper leaves it alone.
pub(crate) struct WorkerTarget<'a> {
    pub instance_id: String,
    pub socket_path: PathBuf,
    registry: &'a SessionRegistry,
    client_id: String,
    gate: Arc<AsyncMutex<()>>,
}

impl Drop for WorkerTarget<'_> {
    fn drop(&mut self) {
        self.registry.finish_request(&self.client_id, &self.gate);
    }
}

pub struct Broker {
    config: Arc<AppConfig>,
    pub(crate) registry: SessionRegistry,
    pub(crate) supervisor: Supervisor,
    pub(crate) store: StateStore,
    paths: RuntimePaths,
    uid: u32,
    started_at: Instant,
    closing: AtomicBool,
}

impl Broker {
    pub fn new(
        config: Arc<AppConfig>,
        config_path: Option<PathBuf>,
        paths: RuntimePaths,
        events: mpsc::UnboundedSender<SupervisorEvent>,
    ) -> Self {
        let store = StateStore::new(config.store.fsync, config.store.max_age_hours);
        let supervisor = Supervisor::new((*config).clone(), config_path, paths.clone(), events);
        Self {
            config,
            registry: SessionRegistry::new(),
            supervisor,
            store,
            paths,
            uid: current_uid(),
            started_at: Instant::now(),
            closing: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub(crate) fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.config.daemon.worker_request_timeout_secs.max(1))
    }

    pub(crate) fn idle_threshold(&self) -> Duration {
        Duration::from_secs(self.config.daemon.idle_timeout_secs)
    }

    #[instrument(skip_all, fields(command = command_name(&command)))]
    pub async fn handle(&self, command: ClientCommand) -> DaemonReply {
        let result = match command {
            ClientCommand::Help => Ok(Value::from(HELP_TEXT)),
            ClientCommand::Health => Ok(self.health()),
            ClientCommand::Status { client_id } => Ok(self.status(client_id.as_deref())),
            ClientCommand::Ask {
                client_id,
                question,
                request_id,
            } => {
                self.forward(
                    &client_id,
                    RequestKind::Query {
                        message: question,
                        request_id,
                    },
                )
                .await
            }
            ClientCommand::ConfigGet { client_id } => {
                self.forward(&client_id, RequestKind::Config(ConfigAction::Get))
                    .await
            }
            ClientCommand::ConfigSet { client_id, profile } => {
                let action = ConfigAction::SetProfile {
                    profile: profile.to_string(),
                };
                self.forward(&client_id, RequestKind::Config(action)).await
            }
            ClientCommand::Reasoning { client_id, show } => {
                let action = ConfigAction::SetReasoning {
                    show_reasoning: show,
                };
                self.forward(&client_id, RequestKind::Config(action)).await
            }
            ClientCommand::OutputFormat { client_id, format } => {
                let action = ConfigAction::SetOutputFormat {
                    output_format: format.to_string(),
                };
                self.forward(&client_id, RequestKind::Config(action)).await
            }
            ClientCommand::Stop { client_id } => {
                let stopped = self.stop_session(&client_id).await;
                Ok(Value::from(if stopped {
                    format!("stopped session for {client_id}")
                } else {
                    format!("no session for {client_id}")
                }))
            }
            ClientCommand::Shutdown => {
                self.shutdown().await;
                Ok(Value::from("daemon shutting down"))
            }
        };

        match result {
            Ok(value) => DaemonReply::ok(value),
            Err(err) => DaemonReply::err(format!("{err:#}")),
        }
    }

    /// Send one request to the client's worker, starting it if needed, and
    /// turn the reply into the client-facing value.
    async fn forward(&self, client_id: &str, kind: RequestKind) -> Result<Value> {
        let target = self.ensure_worker(client_id).await?;
        let request = WorkerRequest::new(&target.instance_id, kind);
        let response = call_worker(&target.socket_path, &request, self.request_timeout()).await;
        drop(target);

        let response = response?;
        self.absorb(client_id, &response);
        if !response.is_success() {
            bail!("{}", response.message());
        }

        if let WorkerReply::ConfigResponse { action, config, .. } = &response.reply {
            if action == ConfigAction::Get.name() {
                return Ok(config_value(config));
            }
        }
        Ok(Value::from(response.message()))
    }

    /// Mirror what the worker reported into the session's cached view.
    pub(crate) fn absorb(&self, client_id: &str, response: &WorkerResponse) {
        self.registry.with_session(client_id, |session| match &response.reply {
            WorkerReply::Response { metadata, .. } => {
                session.conversation_count = metadata.turn_count;
                session.config = RuntimeConfig {
                    profile: metadata.active_profile,
                    show_reasoning: metadata.show_reasoning,
                    output_format: metadata.output_format,
                };
            }
            WorkerReply::ConfigResponse { config, .. } => session.config = *config,
            WorkerReply::RestoreResponse {
                restored, config, ..
            } => {
                session.conversation_count = *restored;
                session.config = *config;
            }
            WorkerReply::Error { .. } => {}
        });
    }

    /// Get-or-create the client's session and make sure a worker serves it.
    pub(crate) async fn ensure_worker(&self, client_id: &str) -> Result<WorkerTarget<'_>> {
        // A stop or reap can remove the entry while we queue on its gate;
        // in that case start over with a fresh entry.
        for _ in 0..3 {
            if self.is_closing() {
                bail!("daemon is shutting down");
            }

            let (gate, created) = self
                .registry
                .get_or_create(client_id, || self.new_session(client_id));
            if created {
                info!(client_id, "session created");
            }
            let _guard = gate.lock().await;

            let current = self.registry.with_session(client_id, |s| {
                Arc::ptr_eq(&s.gate, &gate).then(|| {
                    s.last_activity = Instant::now();
                    (s.phase.clone(), s.worker_lost())
                })
            });
            let Some(Some((phase, lost))) = current else {
                continue;
            };

            match phase {
                SessionPhase::Active if !lost => {}
                SessionPhase::Active | SessionPhase::Recovering => {
                    self.recover_locked(client_id, "worker found dead on request")
                        .await?;
                }
                SessionPhase::Failed(reason) => {
                    self.registry
                        .with_session(client_id, |s| s.phase = SessionPhase::Idle);
                    bail!("worker for {client_id} could not be restarted: {reason}");
                }
                SessionPhase::Idle | SessionPhase::Starting => {
                    self.start_locked(client_id).await?;
                }
            }

            return self.target(client_id, gate.clone());
        }
        bail!("session for {client_id} kept disappearing; try again")
    }

    pub(crate) fn new_session(&self, client_id: &str) -> Session {
        let instance_id = derive_instance_id(self.uid, client_id);
        Session::new(
            client_id,
            instance_id.clone(),
            self.paths.worker_socket(&instance_id),
            self.paths.state_file(&instance_id),
        )
    }

    /// Caller holds `gate`, so the entry cannot be reaped or replaced between
    /// the lookup and the in-flight count.
    fn target(&self, client_id: &str, gate: Arc<AsyncMutex<()>>) -> Result<WorkerTarget<'_>> {
        let (instance_id, socket_path) = self
            .registry
            .with_session(client_id, |s| (s.instance_id.clone(), s.socket_path.clone()))
            .ok_or_else(|| anyhow!("no session for {client_id}"))?;
        if !self.registry.begin_request(client_id, &gate) {
            bail!("no session for {client_id}");
        }
        Ok(WorkerTarget {
            instance_id,
            socket_path,
            registry: &self.registry,
            client_id: client_id.to_string(),
            gate,
        })
    }

    /// Bump the generation and describe the next worker for `client_id`.
    pub(crate) fn next_launch(&self, client_id: &str, phase: SessionPhase) -> Result<WorkerLaunch> {
        self.registry
            .with_session(client_id, |s| {
                s.phase = phase;
                s.generation += 1;
                WorkerLaunch {
                    client_id: s.client_id.clone(),
                    instance_id: s.instance_id.clone(),
                    generation: s.generation,
                    socket_path: s.socket_path.clone(),
                    state_path: s.state_path.clone(),
                }
            })
            .ok_or_else(|| anyhow!("no session for {client_id}"))
    }

    /// First start for a session.  Caller holds the session gate.
    async fn start_locked(&self, client_id: &str) -> Result<()> {
        let launch = self.next_launch(client_id, SessionPhase::Starting)?;

        if let Some(prior) = self.load_state(&launch).await {
            self.registry.with_session(client_id, |s| {
                s.conversation_count = prior.conversation_history.len();
                s.config = prior.config;
            });
        }

        match self.supervisor.spawn(&launch).await {
            Ok(worker) => {
                self.registry.with_session(client_id, |s| {
                    s.phase = SessionPhase::Active;
                    s.pid = Some(worker.pid);
                    s.monitor = Some(worker.monitor);
                });
                Ok(())
            }
            Err(err) => {
                warn!(client_id, ?err, "worker spawn failed");
                self.registry.with_session(client_id, |s| {
                    s.phase = SessionPhase::Idle;
                    s.pid = None;
                });
                Err(err)
            }
        }
    }

    /// Read the state file the worker for `launch` would load, off the runtime.
    pub(crate) async fn load_state(&self, launch: &WorkerLaunch) -> Option<PersistedState> {
        let store = self.store.clone();
        let path = launch.state_path.clone();
        let instance_id = launch.instance_id.clone();
        let client_id = launch.client_id.clone();
        tokio::task::spawn_blocking(move || {
            store.load(
                &path,
                Expected {
                    instance_id: &instance_id,
                    client_id: Some(&client_id),
                },
            )
        })
        .await
        .ok()
        .flatten()
    }

    /// Tear down one session.  Returns false when none was tracked.
    pub async fn stop_session(&self, client_id: &str) -> bool {
        let Some(gate) = self.registry.gate(client_id) else {
            return false;
        };
        let _guard = gate.lock().await;
        // The entry stays registered until the worker is gone, so a request
        // racing the stop queues on this gate instead of spawning a second
        // worker for the same instance.
        let taken = self.registry.with_session(client_id, |s| {
            Arc::ptr_eq(&s.gate, &gate).then(|| s.monitor.take())
        });
        let Some(Some(monitor)) = taken else {
            return false;
        };
        if let Some(monitor) = monitor {
            monitor.stop().await;
        }
        self.registry.remove_gated(client_id, &gate);
        info!(client_id, "session stopped");
        true
    }

    /// Refuse new work and stop every worker.
    pub async fn shutdown(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        let clients = self.registry.client_ids();
        info!(sessions = clients.len(), "stopping all sessions");
        join_all(clients.iter().map(|id| self.stop_session(id))).await;
    }

    fn status(&self, client_id: Option<&str>) -> Value {
        match client_id {
            Some(id) => match self.registry.snapshot(id) {
                Some(snapshot) => json!(snapshot),
                None => json!({ "client_id": id, "state": "untracked" }),
            },
            None => {
                let clients = self.registry.snapshot_all();
                json!({ "count": clients.len(), "clients": clients })
            }
        }
    }

    fn health(&self) -> Value {
        json!({
            "uptime_secs": self.started_at.elapsed().as_secs(),
            "workers_spawned": self.supervisor.workers_spawned(),
            "clients": self.registry.snapshot_all(),
        })
    }
}

fn command_name(command: &ClientCommand) -> &'static str {
    match command {
        ClientCommand::Help => "help",
        ClientCommand::Health => "health",
        ClientCommand::Status { .. } => "status",
        ClientCommand::Ask { .. } => "ask",
        ClientCommand::ConfigGet { .. } => "config_get",
        ClientCommand::ConfigSet { .. } => "config_set",
        ClientCommand::Reasoning { .. } => "reasoning",
        ClientCommand::OutputFormat { .. } => "output_format",
        ClientCommand::Stop { .. } => "stop",
        ClientCommand::Shutdown => "shutdown",
    }
}

fn config_value(config: &RuntimeConfig) -> Value {
    serde_json::to_value(config).unwrap_or(Value::Null)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use askd_core::{ErrorCode, OutputFormat, Profile, QueryMetadata};
    use tempfile::TempDir;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixListener;

    use crate::supervisor::MonitorHandle;

    pub(crate) fn broker(dir: &TempDir) -> Broker {
        let mut config = AppConfig::default();
        config.worker.program = dir.path().join("no-such-worker").display().to_string();
        config.worker.ready_attempts = 2;
        config.worker.ready_interval_ms = 10;
        let (tx, _rx) = mpsc::unbounded_channel();
        Broker::new(Arc::new(config), None, RuntimePaths::new(dir.path()), tx)
    }

    /// Answers queries like a worker would, counting turns.  Each reply is
    /// held back by `delay`.
    async fn fake_worker(listener: UnixListener, delay: Duration) {
        let mut turns = 0;
        let mut config = RuntimeConfig::default();
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let (read_half, mut write_half) = stream.into_split();
            let mut line = String::new();
            BufReader::new(read_half).read_line(&mut line).await.unwrap();
            let request: WorkerRequest = serde_json::from_str(line.trim()).unwrap();
            let reply = match request.kind {
                RequestKind::Query { message, .. } => {
                    turns += 2;
                    WorkerReply::Response {
                        message: format!("echo: {message}"),
                        metadata: QueryMetadata {
                            turn_count: turns,
                            active_profile: config.profile,
                            show_reasoning: config.show_reasoning,
                            output_format: config.output_format,
                            replayed: false,
                        },
                    }
                }
                RequestKind::Config(ConfigAction::SetProfile { profile }) => {
                    config.set_profile(&profile).unwrap();
                    WorkerReply::ConfigResponse {
                        action: "set_profile".into(),
                        message: format!("profile set to {profile}"),
                        config,
                    }
                }
                RequestKind::Config(ConfigAction::Get) => WorkerReply::ConfigResponse {
                    action: "get".into(),
                    message: "current settings".into(),
                    config,
                },
                _ => WorkerReply::Error {
                    message: "unsupported".into(),
                    error_code: ErrorCode::ValidationError,
                },
            };
            tokio::time::sleep(delay).await;
            let response = WorkerResponse::new(request.instance_id, reply);
            let mut out = serde_json::to_string(&response).unwrap();
            out.push('\n');
            write_half.write_all(out.as_bytes()).await.unwrap();
        }
    }

    /// Register `client_id` as served by an in-process fake worker.
    pub(crate) fn attach_fake(broker: &Broker, client_id: &str) {
        attach_slow_fake(broker, client_id, Duration::ZERO);
    }

    pub(crate) fn attach_slow_fake(broker: &Broker, client_id: &str, delay: Duration) {
        let (gate, _) = broker
            .registry
            .get_or_create(client_id, || broker.new_session(client_id));
        drop(gate);
        let socket = broker
            .registry
            .with_session(client_id, |s| s.socket_path.clone())
            .unwrap();
        let listener = UnixListener::bind(&socket).unwrap();
        tokio::spawn(fake_worker(listener, delay));
        broker.registry.with_session(client_id, |s| {
            s.phase = SessionPhase::Active;
            s.generation = 1;
            s.monitor = Some(MonitorHandle::parked());
        });
    }

    fn ask(client_id: &str, question: &str) -> ClientCommand {
        ClientCommand::Ask {
            client_id: client_id.into(),
            question: question.into(),
            request_id: None,
        }
    }

    #[tokio::test]
    async fn help_and_health_need_no_session() {
        let dir = TempDir::new().unwrap();
        let broker = broker(&dir);
        let help = broker.handle(ClientCommand::Help).await.into_result().unwrap();
        assert!(help.as_str().unwrap().contains("output-format"));

        let health = broker.handle(ClientCommand::Health).await.into_result().unwrap();
        assert_eq!(health["workers_spawned"], 0);
        assert_eq!(health["clients"].as_array().unwrap().len(), 0);
        assert!(broker.registry().is_empty());
    }

    #[tokio::test]
    async fn status_of_unknown_client_does_not_create_it() {
        let dir = TempDir::new().unwrap();
        let broker = broker(&dir);
        let status = broker
            .handle(ClientCommand::Status {
                client_id: Some("ghost".into()),
            })
            .await
            .into_result()
            .unwrap();
        assert_eq!(status["state"], "untracked");
        assert!(broker.registry().is_empty());
    }

    #[tokio::test]
    async fn ask_forwards_and_tracks_turns() {
        let dir = TempDir::new().unwrap();
        let broker = broker(&dir);
        attach_fake(&broker, "c1");

        let answer = broker.handle(ask("c1", "2+2?")).await.into_result().unwrap();
        assert_eq!(answer, "echo: 2+2?");

        let status = broker
            .handle(ClientCommand::Status {
                client_id: Some("c1".into()),
            })
            .await
            .into_result()
            .unwrap();
        assert_eq!(status["conversation_count"], 2);
        assert_eq!(status["state"], "active");
    }

    #[tokio::test]
    async fn sessions_do_not_share_config() {
        let dir = TempDir::new().unwrap();
        let broker = broker(&dir);
        attach_fake(&broker, "a");
        attach_fake(&broker, "b");

        broker
            .handle(ClientCommand::ConfigSet {
                client_id: "a".into(),
                profile: Profile::High,
            })
            .await
            .into_result()
            .unwrap();
        broker.handle(ask("a", "q")).await.into_result().unwrap();

        let a = broker
            .handle(ClientCommand::ConfigGet { client_id: "a".into() })
            .await
            .into_result()
            .unwrap();
        let b = broker
            .handle(ClientCommand::ConfigGet { client_id: "b".into() })
            .await
            .into_result()
            .unwrap();
        assert_eq!(a["profile"], "high");
        assert_eq!(b["profile"], "default");
        assert_eq!(b["output_format"], OutputFormat::FinalOnly.as_str());
        assert_eq!(broker.registry().snapshot("b").unwrap().conversation_count, 0);
    }

    #[tokio::test]
    async fn failed_spawn_is_reported_and_retryable() {
        let dir = TempDir::new().unwrap();
        let broker = broker(&dir);

        let err = broker.handle(ask("c1", "hi")).await.into_result().unwrap_err();
        assert!(err.contains("failed to spawn worker"), "{err}");
        let snapshot = broker.registry().snapshot("c1").unwrap();
        assert_eq!(snapshot.state, "idle");

        // The entry stays so the next request retries from scratch.
        assert!(broker.handle(ask("c1", "hi")).await.into_result().is_err());
        assert_eq!(broker.registry().len(), 1);
    }

    #[tokio::test]
    async fn failed_recovery_surfaces_once() {
        let dir = TempDir::new().unwrap();
        let broker = broker(&dir);
        broker.registry.get_or_create("c1", || broker.new_session("c1"));
        broker.registry.with_session("c1", |s| {
            s.phase = SessionPhase::Failed("replacement spawn failed".into())
        });

        let err = broker.handle(ask("c1", "hi")).await.into_result().unwrap_err();
        assert!(err.contains("replacement spawn failed"));
        assert_eq!(broker.registry().snapshot("c1").unwrap().state, "idle");
    }

    #[tokio::test]
    async fn request_during_stop_waits_for_the_old_worker() {
        let dir = TempDir::new().unwrap();
        let broker = Arc::new(broker(&dir));
        attach_fake(&broker, "c1");
        let exited = Arc::new(AtomicBool::new(false));
        broker.registry.with_session("c1", |s| {
            s.monitor = Some(MonitorHandle::lingering(
                Duration::from_millis(300),
                exited.clone(),
            ));
        });

        let stopping = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.stop_session("c1").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(broker.registry().snapshot("c1").is_some());

        // The worker program is missing, so the fresh start fails; what
        // matters is that it was not attempted before the old worker exited.
        let err = broker.handle(ask("c1", "racing")).await.into_result().unwrap_err();
        assert!(exited.load(Ordering::SeqCst), "started while the old worker was alive: {err}");
        assert!(stopping.await.unwrap());
    }

    #[tokio::test]
    async fn stop_and_shutdown() {
        let dir = TempDir::new().unwrap();
        let broker = broker(&dir);
        attach_fake(&broker, "a");
        attach_fake(&broker, "b");

        let stopped = broker
            .handle(ClientCommand::Stop { client_id: "a".into() })
            .await
            .into_result()
            .unwrap();
        assert_eq!(stopped, "stopped session for a");
        let again = broker
            .handle(ClientCommand::Stop { client_id: "a".into() })
            .await
            .into_result()
            .unwrap();
        assert_eq!(again, "no session for a");

        broker.handle(ClientCommand::Shutdown).await.into_result().unwrap();
        assert!(broker.registry().is_empty());
        assert!(broker.is_closing());
        let err = broker.handle(ask("b", "late")).await.into_result().unwrap_err();
        assert!(err.contains("shutting down"));
    }
}
