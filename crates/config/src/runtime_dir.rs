//! Runtime directory resolution.
//!
//! Every socket, state file and worker log lives under one private directory.
//! Candidates are tried in order; each must end up as a directory owned by the
//! current user with mode `0700`.

use std::env;
use std::fs;
use std::os::unix::fs::{DirBuilderExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use anyhow::{Result, bail};

/// Ordered candidate list: explicit override, then `<tmp>/askd-<user>`, then
/// `<home>/.askd_runtime`.
pub fn runtime_dir_candidates(explicit: Option<&Path>) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(dir) = explicit {
        candidates.push(dir.to_path_buf());
    }

    candidates.push(env::temp_dir().join(format!("askd-{}", user_tag())));

    if let Some(home) = env::var_os("HOME").filter(|h| !h.is_empty()) {
        candidates.push(PathBuf::from(home).join(".askd_runtime"));
    }

    candidates
}

/// Return the first usable candidate, creating it when missing.
///
/// Fails with every candidate's error listed when none qualifies.
pub fn resolve_runtime_dir(explicit: Option<&Path>) -> Result<PathBuf> {
    let mut failures = Vec::new();

    for candidate in runtime_dir_candidates(explicit) {
        match prepare_private_dir(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(err) => failures.push(format!("{}: {err}", candidate.display())),
        }
    }

    bail!(
        "no usable runtime directory; tried:\n  {}",
        failures.join("\n  ")
    )
}

fn prepare_private_dir(dir: &Path) -> Result<()> {
    if let Err(err) = fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
    {
        bail!("cannot create: {err}");
    }

    // symlink_metadata so a planted link to someone else's directory fails.
    let meta = fs::symlink_metadata(dir)?;
    if !meta.is_dir() {
        bail!("not a directory");
    }

    let uid = effective_uid();
    if meta.uid() != uid {
        bail!("owned by uid {} (expected {uid})", meta.uid());
    }

    if meta.mode() & 0o777 != 0o700 {
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    }

    Ok(())
}

fn user_tag() -> String {
    env::var("USER")
        .ok()
        .filter(|u| !u.is_empty() && u.chars().all(|c| c.is_ascii_alphanumeric() || "-_.".contains(c)))
        .unwrap_or_else(|| format!("uid{}", effective_uid()))
}

fn effective_uid() -> u32 {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() }
}
