//! Signal delivery by pid.

use std::io;

pub use libc::{SIGKILL, SIGTERM};

pub fn send_signal(pid: u32, signal: libc::c_int) -> io::Result<()> {
    // pid 0 and negative pids address process groups.
    let pid = libc::pid_t::try_from(pid)
        .ok()
        .filter(|p| *p > 0)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid pid"))?;

    // SAFETY: kill takes plain integers; `pid` is positive, so it names one
    // process and never a group.
    let rc = unsafe { libc::kill(pid, signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// True when a process with `pid` exists (including zombies not yet reaped).
pub fn is_alive(pid: u32) -> bool {
    match send_signal(pid, 0) {
        Ok(()) => true,
        Err(err) => err.raw_os_error() == Some(libc::EPERM),
    }
}
