use std::env;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

/// Effective uid: the owner of every file this process creates.
pub fn current_uid() -> u32 {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() }
}

pub fn current_user() -> String {
    ["USER", "LOGNAME"]
        .iter()
        .filter_map(|key| env::var(key).ok())
        .find(|name| !name.trim().is_empty())
        .unwrap_or_else(|| format!("uid{}", current_uid()))
}

/// Stable instance identifier for `client_id` under `uid`.
///
/// Deterministic so a replacement worker finds the same socket path and state
/// file as the one it replaces.
pub fn derive_instance_id(uid: u32, client_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("askd:{uid}:{client_id}").as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..12].to_string()
}

/// `<user>@<host>:<parent pid>`: one logical client per calling shell.
pub fn default_client_id() -> String {
    let ppid = std::os::unix::process::parent_id();
    format!("{}@{}:{ppid}", current_user(), hostname())
}

fn hostname() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: the pointer and length describe `buf`, which outlives the call;
    // gethostname writes at most `buf.len()` bytes.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return "local".to_string();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let name = String::from_utf8_lossy(&buf[..end]).trim().to_string();
    if name.is_empty() { "local".to_string() } else { name }
}

/// File layout inside the runtime directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimePaths {
    dir: PathBuf,
}

impl RuntimePaths {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn worker_socket(&self, instance_id: &str) -> PathBuf {
        self.dir.join(format!("worker-{instance_id}.sock"))
    }

    pub fn state_file(&self, instance_id: &str) -> PathBuf {
        self.dir.join(format!("worker-{instance_id}-state.json"))
    }

    pub fn worker_log(&self, instance_id: &str) -> PathBuf {
        self.dir.join(format!("worker-{instance_id}.log"))
    }

    pub fn daemon_lock(&self) -> PathBuf {
        self.dir.join("askd.lock")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_id_is_deterministic_and_short() {
        let a = derive_instance_id(1000, "alice@box:42");
        let b = derive_instance_id(1000, "alice@box:42");
        assert_eq!(a, b);
        assert_eq!(a.len(), 12);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn new_files_are_owned_by_current_uid() {
        use std::os::unix::fs::MetadataExt;

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("owned");
        std::fs::write(&path, b"x").unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().uid(), current_uid());
    }

    #[test]
    fn instance_id_separates_clients_and_users() {
        let base = derive_instance_id(1000, "c1");
        assert_ne!(base, derive_instance_id(1000, "c2"));
        assert_ne!(base, derive_instance_id(1001, "c1"));
    }

    #[test]
    fn paths_share_the_instance_id() {
        let paths = RuntimePaths::new("/run/askd");
        assert_eq!(
            paths.worker_socket("abc"),
            PathBuf::from("/run/askd/worker-abc.sock")
        );
        assert_eq!(
            paths.state_file("abc"),
            PathBuf::from("/run/askd/worker-abc-state.json")
        );
        assert_eq!(paths.worker_log("abc"), PathBuf::from("/run/askd/worker-abc.log"));
    }

    #[test]
    fn default_client_id_has_user_host_and_ppid() {
        let id = default_client_id();
        let (user, rest) = id.split_once('@').unwrap();
        assert!(!user.is_empty());
        let (_, ppid) = rest.rsplit_once(':').unwrap();
        assert!(ppid.parse::<i32>().is_ok());
    }
}
