//! Daemon-side bookkeeping: one [`Session`] per client, behind one lock.
//!
//! The map itself is never handed out.  Callers get or create entries, run
//! short closures against one entry, remove entries, or take snapshots; the
//! lock is never held across an `.await`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use askd_core::RuntimeConfig;
use askd_exec::process::is_alive;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;

use crate::supervisor::MonitorHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionPhase {
    /// Tracked, no worker yet (fresh, or reset after a failure).
    Idle,
    Starting,
    Active,
    Recovering,
    /// The replacement spawn failed; reported to the next request.
    Failed(String),
}

impl SessionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Active => "active",
            Self::Recovering => "recovering",
            Self::Failed(_) => "failed",
        }
    }
}

pub struct Session {
    pub(crate) client_id: String,
    pub(crate) instance_id: String,
    pub(crate) socket_path: PathBuf,
    pub(crate) state_path: PathBuf,
    pub(crate) phase: SessionPhase,
    pub(crate) pid: Option<u32>,
    /// Bumped on every spawn so exit notices from replaced workers are ignored.
    pub(crate) generation: u64,
    pub(crate) config: RuntimeConfig,
    pub(crate) conversation_count: usize,
    pub(crate) last_activity: Instant,
    /// Forwarded requests still waiting on the worker.
    pub(crate) in_flight: usize,
    /// Serializes spawn, recovery, and stop for this client.
    pub(crate) gate: Arc<AsyncMutex<()>>,
    pub(crate) monitor: Option<MonitorHandle>,
}

impl Session {
    pub fn new(
        client_id: impl Into<String>,
        instance_id: impl Into<String>,
        socket_path: PathBuf,
        state_path: PathBuf,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            instance_id: instance_id.into(),
            socket_path,
            state_path,
            phase: SessionPhase::Idle,
            pid: None,
            generation: 0,
            config: RuntimeConfig::default(),
            conversation_count: 0,
            last_activity: Instant::now(),
            in_flight: 0,
            gate: Arc::new(AsyncMutex::new(())),
            monitor: None,
        }
    }

    /// True when the phase says a worker is serving but its process is gone.
    pub(crate) fn worker_lost(&self) -> bool {
        self.phase == SessionPhase::Active
            && (self.monitor.as_ref().is_none_or(MonitorHandle::is_finished)
                || self.pid.is_some_and(|pid| !is_alive(pid)))
    }

    /// No request in flight and nothing received for at least `threshold`.
    pub(crate) fn is_idle(&self, threshold: Duration) -> bool {
        self.in_flight == 0 && self.last_activity.elapsed() >= threshold
    }

    fn snapshot(&self) -> SessionSnapshot {
        let serving = matches!(self.phase, SessionPhase::Active | SessionPhase::Recovering);
        SessionSnapshot {
            client_id: self.client_id.clone(),
            instance_id: self.instance_id.clone(),
            state: self.phase.as_str(),
            error: match &self.phase {
                SessionPhase::Failed(reason) => Some(reason.clone()),
                _ => None,
            },
            profile: serving.then(|| self.config.profile.to_string()),
            show_reasoning: serving.then_some(self.config.show_reasoning),
            output_format: serving.then(|| self.config.output_format.to_string()),
            conversation_count: self.conversation_count,
            socket_path: serving.then(|| self.socket_path.display().to_string()),
            pid: self.pid,
            in_flight: self.in_flight,
            idle_secs: self.last_activity.elapsed().as_secs(),
        }
    }
}

/// Point-in-time copy of one session, safe to format after the lock is gone.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub client_id: String,
    pub instance_id: String,
    pub state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub show_reasoning: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_format: Option<String>,
    pub conversation_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub in_flight: usize,
    pub idle_secs: u64,
}

#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<HashMap<String, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up `client_id`, inserting `make()` when absent.  Returns the
    /// session gate and whether the entry was created by this call.
    pub fn get_or_create(
        &self,
        client_id: &str,
        make: impl FnOnce() -> Session,
    ) -> (Arc<AsyncMutex<()>>, bool) {
        let mut map = self.lock();
        let mut created = false;
        let session = map.entry(client_id.to_string()).or_insert_with(|| {
            created = true;
            make()
        });
        (session.gate.clone(), created)
    }

    pub fn gate(&self, client_id: &str) -> Option<Arc<AsyncMutex<()>>> {
        self.lock().get(client_id).map(|s| s.gate.clone())
    }

    /// Run `f` against one session under the lock.
    pub fn with_session<R>(&self, client_id: &str, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        self.lock().get_mut(client_id).map(f)
    }

    /// Count a request as handed to the worker.  Only entries still guarded
    /// by `gate` are touched.
    pub fn begin_request(&self, client_id: &str, gate: &Arc<AsyncMutex<()>>) -> bool {
        match self.lock().get_mut(client_id) {
            Some(session) if Arc::ptr_eq(&session.gate, gate) => {
                session.in_flight += 1;
                session.last_activity = Instant::now();
                true
            }
            _ => false,
        }
    }

    /// Undo [`SessionRegistry::begin_request`] once the worker answered or
    /// the call failed.
    pub fn finish_request(&self, client_id: &str, gate: &Arc<AsyncMutex<()>>) {
        if let Some(session) = self.lock().get_mut(client_id) {
            if Arc::ptr_eq(&session.gate, gate) {
                session.in_flight = session.in_flight.saturating_sub(1);
                session.last_activity = Instant::now();
            }
        }
    }

    /// Remove the entry only while it is still the one guarded by `gate`.
    pub fn remove_gated(&self, client_id: &str, gate: &Arc<AsyncMutex<()>>) -> Option<Session> {
        let mut map = self.lock();
        let same = map
            .get(client_id)
            .is_some_and(|s| Arc::ptr_eq(&s.gate, gate));
        if same { map.remove(client_id) } else { None }
    }

    pub fn idle_clients(&self, threshold: Duration) -> Vec<String> {
        self.lock()
            .values()
            .filter(|s| s.is_idle(threshold))
            .map(|s| s.client_id.clone())
            .collect()
    }

    pub fn client_ids(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn snapshot(&self, client_id: &str) -> Option<SessionSnapshot> {
        self.lock().get(client_id).map(Session::snapshot)
    }

    /// All sessions, sorted by client id.
    pub fn snapshot_all(&self) -> Vec<SessionSnapshot> {
        let mut all: Vec<_> = self.lock().values().map(Session::snapshot).collect();
        all.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        all
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
