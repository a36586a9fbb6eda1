//! Per-instance worker state on a shared, partially-trusted filesystem.
//!
//! A state document is trusted only when its file is a regular file owned by
//! the current user with no group/other permission bits.  Anything else reads
//! as "no state": callers never see a hard failure from [`StateStore::load`].

use std::fs::{self, File, Metadata, OpenOptions, Permissions};
use std::io::{self, Read, Write};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use askd_core::{ConversationTurn, RuntimeConfig, current_uid};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Documents larger than this are rejected unread.
const MAX_DOCUMENT_BYTES: u64 = 32 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub instance_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<PathBuf>,
    #[serde(default)]
    pub conversation_history: Vec<ConversationTurn>,
    #[serde(default)]
    pub config: RuntimeConfig,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    pub saved_at: DateTime<Utc>,
}

impl PersistedState {
    pub fn new(instance_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            instance_id: instance_id.into(),
            client_id: None,
            parent_pid: None,
            socket_path: None,
            conversation_history: Vec::new(),
            config: RuntimeConfig::default(),
            created_at: now,
            saved_at: now,
        }
    }
}

/// What a loaded document must claim to be.
#[derive(Debug, Clone, Copy)]
pub struct Expected<'a> {
    pub instance_id: &'a str,
    /// When set, a document naming a different client is rejected.  A document
    /// without a client id is accepted.
    pub client_id: Option<&'a str>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("not a regular file")]
    NotRegular,
    #[error("owned by uid {found}, expected {expected}")]
    WrongOwner { found: u32, expected: u32 },
    #[error("permissions {0:o} allow group/other access")]
    LoosePermissions(u32),
    #[error("document too large")]
    TooLarge,
    #[error("malformed document: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("document belongs to instance {found}, expected {expected}")]
    InstanceMismatch { found: String, expected: String },
    #[error("document belongs to client {found}, expected {expected}")]
    ClientMismatch { found: String, expected: String },
    #[error("document saved {age_hours}h ago exceeds the {max_hours}h limit")]
    Stale { age_hours: i64, max_hours: i64 },
}

/// Verify ownership and file type of an open descriptor.
///
/// `require_private` additionally rejects any group/other mode bits; the save
/// path tightens those instead of failing.
pub fn check_metadata(meta: &Metadata, uid: u32, require_private: bool) -> Result<(), StoreError> {
    if !meta.file_type().is_file() {
        return Err(StoreError::NotRegular);
    }
    if meta.uid() != uid {
        return Err(StoreError::WrongOwner {
            found: meta.uid(),
            expected: uid,
        });
    }
    let mode = meta.mode() & 0o777;
    if require_private && mode & 0o077 != 0 {
        return Err(StoreError::LoosePermissions(mode));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct StateStore {
    fsync: bool,
    max_age: Option<Duration>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self {
            fsync: false,
            max_age: Some(Duration::hours(24)),
        }
    }
}

impl StateStore {
    /// `max_age_hours == 0` disables the age check.
    pub fn new(fsync: bool, max_age_hours: u64) -> Self {
        let max_age = (max_age_hours > 0)
            .then(|| Duration::try_hours(max_age_hours.min(i64::MAX as u64) as i64))
            .flatten();
        Self { fsync, max_age }
    }

    /// Atomically replace `path` with `state`.
    ///
    /// The payload goes to a `.tmp` sibling opened without following links,
    /// verified, written, then renamed over `path`.  Any failure removes the
    /// sibling and leaves `path` untouched.
    pub fn save(&self, path: &Path, state: &PersistedState) -> Result<(), StoreError> {
        let payload = serde_json::to_vec_pretty(state)?;
        let tmp_path = sibling_tmp(path);

        let written = self.write_private(&tmp_path, &payload);
        if let Err(err) = written {
            let _ = fs::remove_file(&tmp_path);
            return Err(err);
        }

        if let Err(err) = fs::rename(&tmp_path, path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(err.into());
        }

        debug!(
            path = %path.display(),
            turns = state.conversation_history.len(),
            "state saved"
        );
        Ok(())
    }

    fn write_private(&self, tmp_path: &Path, payload: &[u8]) -> Result<(), StoreError> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .custom_flags(libc::O_NOFOLLOW)
            .open(tmp_path)?;

        let meta = file.metadata()?;
        check_metadata(&meta, current_uid(), false)?;
        // A pre-existing file keeps its old mode through O_CREAT.
        if meta.mode() & 0o077 != 0 {
            file.set_permissions(Permissions::from_mode(0o600))?;
        }

        file.write_all(payload)?;
        file.flush()?;
        if self.fsync {
            file.sync_all()?;
        }
        Ok(())
    }

    /// Load and validate the document at `path`.  Every failure is logged and
    /// reported as `None`.
    pub fn load(&self, path: &Path, expected: Expected<'_>) -> Option<PersistedState> {
        match self.try_load(path, expected) {
            Ok(state) => {
                debug!(
                    path = %path.display(),
                    turns = state.conversation_history.len(),
                    "state loaded"
                );
                Some(state)
            }
            Err(StoreError::Io(err)) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no saved state");
                None
            }
            Err(err) => {
                warn!(path = %path.display(), %err, "ignoring saved state");
                None
            }
        }
    }

    pub fn try_load(&self, path: &Path, expected: Expected<'_>) -> Result<PersistedState, StoreError> {
        let file = open_no_follow(path)?;
        let meta = file.metadata()?;
        check_metadata(&meta, current_uid(), true)?;
        if meta.len() > MAX_DOCUMENT_BYTES {
            return Err(StoreError::TooLarge);
        }

        let mut raw = Vec::with_capacity(meta.len() as usize);
        file.take(MAX_DOCUMENT_BYTES).read_to_end(&mut raw)?;
        let state: PersistedState = serde_json::from_slice(&raw)?;

        if state.instance_id != expected.instance_id {
            return Err(StoreError::InstanceMismatch {
                found: state.instance_id,
                expected: expected.instance_id.to_string(),
            });
        }
        if let (Some(found), Some(want)) = (state.client_id.as_deref(), expected.client_id) {
            if found != want {
                return Err(StoreError::ClientMismatch {
                    found: found.to_string(),
                    expected: want.to_string(),
                });
            }
        }
        if let Some(max_age) = self.max_age {
            let age = Utc::now() - state.saved_at;
            if age > max_age {
                return Err(StoreError::Stale {
                    age_hours: age.num_hours(),
                    max_hours: max_age.num_hours(),
                });
            }
        }

        Ok(state)
    }
}

fn open_no_follow(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NOFOLLOW | libc::O_NONBLOCK)
        .open(path)
}

fn sibling_tmp(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|f| f.to_string_lossy().to_string())
        .unwrap_or_else(|| "state.json".to_string());
    path.with_file_name(format!("{name}.tmp"))
}

// ── Tests ────────────────────────────────────────────────────────────────────
