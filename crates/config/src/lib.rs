use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

mod runtime_dir;

pub use runtime_dir::{resolve_runtime_dir, runtime_dir_candidates};

// ── Daemon ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Well-known broker socket.  Empty (the default) places it inside the
    /// resolved runtime directory as `askd.sock`.
    pub socket_path: String,
    /// Sessions with no client activity for this long are reclaimed.
    pub idle_timeout_secs: u64,
    /// How often the idle reaper sweeps the registry.
    pub reaper_interval_secs: u64,
    /// Upper bound for one broker → worker round trip.  Must stay larger than
    /// `backend.timeout_secs` so a slow backend is not mistaken for a hung
    /// worker.
    pub worker_request_timeout_secs: u64,
    /// Upper bound for reading a client request off an accepted connection.
    pub client_read_timeout_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: String::new(),
            idle_timeout_secs: 60,
            reaper_interval_secs: 15,
            worker_request_timeout_secs: 180,
            client_read_timeout_secs: 30,
        }
    }
}

// ── Worker ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Executable launched for each worker.  Empty (the default) re-executes
    /// the current binary with the hidden `worker` subcommand.
    pub program: String,
    /// Number of connect attempts before a freshly spawned worker is declared
    /// dead on arrival.
    pub ready_attempts: u32,
    pub ready_interval_ms: u64,
    /// Time a worker gets to checkpoint after SIGTERM before it is killed.
    pub stop_grace_ms: u64,
    /// Conversation window kept by each worker (oldest turns are evicted).
    pub max_turns: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: String::new(),
            ready_attempts: 50,
            ready_interval_ms: 100,
            stop_grace_ms: 3000,
            max_turns: 200,
        }
    }
}

// ── Backend ───────────────────────────────────────────────────────────────────

/// The external assistant command.  It receives the full prompt on stdin and
/// writes JSON events to stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub program: String,
    pub args: Vec<String>,
    pub timeout_secs: u64,
    /// Most recent turns serialized into each prompt.
    pub history_turns_in_prompt: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            program: "codex".to_string(),
            args: vec![
                "exec".to_string(),
                "--json".to_string(),
                "--skip-git-repo-check".to_string(),
                "-".to_string(),
            ],
            timeout_secs: 120,
            history_turns_in_prompt: 20,
        }
    }
}

// ── Store ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Explicit runtime directory.  Empty means "resolve": `$TMPDIR/askd-<user>`
    /// first, then `~/.askd_runtime`.
    pub runtime_dir: String,
    /// Force an fsync after every state write.  Off by default because it is
    /// slow on loaded disks.
    pub fsync: bool,
    /// Persisted state older than this is ignored on load.  `0` disables the
    /// age check.
    pub max_age_hours: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            runtime_dir: String::new(),
            fsync: false,
            max_age_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub daemon: DaemonConfig,
    pub worker: WorkerConfig,
    pub backend: BackendConfig,
    pub store: StoreConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }
        config.apply_env_overrides(|key| env::var(key).ok());
        Ok(config)
    }

    /// Environment overrides take precedence over the config file.  The
    /// lookup is injected so tests never have to touch the process env.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let present = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(dir) = present("ASKD_RUNTIME_DIR") {
            self.store.runtime_dir = dir;
        }
        if let Some(socket) = present("ASKD_SOCKET") {
            self.daemon.socket_path = socket;
        }
        if let Some(secs) = present("ASKD_IDLE_TIMEOUT").and_then(|v| v.trim().parse().ok()) {
            self.daemon.idle_timeout_secs = secs;
        }
        if let Some(secs) = present("ASKD_BACKEND_TIMEOUT").and_then(|v| v.trim().parse().ok()) {
            self.backend.timeout_secs = secs;
        }
        if let Some(flag) = present("ASKD_SYNC_STATE") {
            self.store.fsync = matches!(flag.trim().to_lowercase().as_str(), "1" | "true" | "yes");
        }
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    /// The explicit runtime directory override, if any.
    pub fn runtime_dir_override(&self) -> Option<PathBuf> {
        let trimmed = self.store.runtime_dir.trim();
        (!trimmed.is_empty()).then(|| PathBuf::from(trimmed))
    }

    /// Broker socket path, defaulting into `runtime_dir`.
    pub fn daemon_socket(&self, runtime_dir: &Path) -> PathBuf {
        let trimmed = self.daemon.socket_path.trim();
        if trimmed.is_empty() {
            runtime_dir.join("askd.sock")
        } else {
            PathBuf::from(trimmed)
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
