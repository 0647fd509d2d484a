//! Session lock record and process identity helpers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of the process holding a session lock.
///
/// Written into the lock file on acquire so that a competing acquire can
/// report who holds the session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SessionInfo {
    /// Locked session id.
    pub session_id: String,
    /// Owning process id.
    pub pid: u32,
    /// Parent of the owning process.
    pub ppid: u32,
    /// When the lock was taken.
    pub start_time: DateTime<Utc>,
    /// Host the owner runs on.
    pub hostname: String,
    /// User the owner runs as.
    pub username: String,
}

impl SessionInfo {
    /// Capture the identity of the current process for `session_id`.
    #[must_use]
    pub fn capture(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_owned(),
            pid: std::process::id(),
            ppid: parent_pid(),
            start_time: Utc::now(),
            hostname: local_hostname(),
            username: current_username(),
        }
    }

    /// Whether the record was written on this host.
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.hostname == local_hostname()
    }

    /// Whether the owning process still exists.
    ///
    /// Records from another host cannot be probed and are reported alive.
    #[must_use]
    pub fn is_owner_alive(&self) -> bool {
        if !self.is_local() {
            return true;
        }
        is_process_running(self.pid)
    }
}

/// Parent process id of the current process (0 when unavailable).
#[must_use]
pub fn parent_pid() -> u32 {
    #[cfg(unix)]
    {
        u32::try_from(nix::unistd::getppid().as_raw()).unwrap_or(0)
    }
    #[cfg(not(unix))]
    {
        0
    }
}

/// Hostname of this machine.
#[must_use]
pub fn local_hostname() -> String {
    #[cfg(unix)]
    {
        if let Ok(name) = nix::unistd::gethostname() {
            if let Some(name) = name.to_str() {
                return name.to_owned();
            }
        }
    }
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_owned())
}

fn current_username() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_owned())
}

/// Check whether a process with the given id exists.
#[cfg(unix)]
#[must_use]
pub fn is_process_running(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) | Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Check whether a process with the given id exists.
///
/// Without a probe we only recognise our own process.
#[cfg(not(unix))]
#[must_use]
pub fn is_process_running(pid: u32) -> bool {
    pid == std::process::id()
}
