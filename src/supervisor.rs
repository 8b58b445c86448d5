//! Singleton daemon lifecycle: PID file, reference-count file, signal
//! handling. Every state transition is expressed as an atomic write to a
//! temp path followed by a rename, and the file itself (not an in-process
//! flag) is the source of truth, so the daemon survives a crash mid-write
//! without a torn read. Signal handling layers `SIGTERM` on top of the
//! usual `ctrl_c` path, since this daemon is normally stopped by the CLI's
//! `stop`/`code`-on-exit path, not interactively.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};

use crate::error::SupervisorError;

const PID_FILE_NAME: &str = "daemon.pid";
const REFCOUNT_FILE_NAME: &str = "daemon.refcount";
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub fn state_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".modelmux")
}

fn pid_file(dir: &Path) -> PathBuf {
    dir.join(PID_FILE_NAME)
}

fn refcount_file(dir: &Path) -> PathBuf {
    dir.join(REFCOUNT_FILE_NAME)
}

/// Write-to-temp-then-rename so concurrent readers never observe a torn
/// file.
fn atomic_write(path: &Path, contents: &str) -> Result<(), SupervisorError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(|source| SupervisorError::Io {
        path: dir.display().to_string(),
        source,
    })?;
    let tmp_path = dir.join(format!(".{}.tmp", path.file_name().unwrap().to_string_lossy()));
    fs::write(&tmp_path, contents).map_err(|source| SupervisorError::Io {
        path: tmp_path.display().to_string(),
        source,
    })?;
    fs::rename(&tmp_path, path).map_err(|source| SupervisorError::Io {
        path: path.display().to_string(),
        source,
    })?;
    Ok(())
}

fn read_optional(path: &Path) -> Result<Option<String>, SupervisorError> {
    match fs::read_to_string(path) {
        Ok(s) => Ok(Some(s.trim().to_string())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(SupervisorError::Io {
            path: path.display().to_string(),
            source,
        }),
    }
}

#[cfg(unix)]
fn process_is_alive(pid: u32) -> bool {
    // signal 0 performs no action but still reports ESRCH for a dead pid.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn process_is_alive(_pid: u32) -> bool {
    false
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaemonStatus {
    pub running: bool,
    pub pid: Option<u32>,
    pub refcount: u64,
}

pub struct Supervisor {
    dir: PathBuf,
}

impl Supervisor {
    pub fn new() -> Self {
        Supervisor { dir: state_dir() }
    }

    pub fn with_dir(dir: PathBuf) -> Self {
        Supervisor { dir }
    }

    /// Reads the PID file, reclaiming a stale one (dead process) rather
    /// than trusting it.
    pub fn live_pid(&self) -> Result<Option<u32>, SupervisorError> {
        let path = pid_file(&self.dir);
        let Some(raw) = read_optional(&path)? else { return Ok(None) };
        let pid: u32 = raw.parse().map_err(|_| SupervisorError::TornPidFile(raw.clone()))?;
        if process_is_alive(pid) {
            Ok(Some(pid))
        } else {
            fs::remove_file(&path).ok();
            Ok(None)
        }
    }

    pub fn status(&self) -> Result<DaemonStatus, SupervisorError> {
        let pid = self.live_pid()?;
        Ok(DaemonStatus {
            running: pid.is_some(),
            pid,
            refcount: self.read_refcount()?,
        })
    }

    pub fn read_refcount(&self) -> Result<u64, SupervisorError> {
        let path = refcount_file(&self.dir);
        match read_optional(&path)? {
            None => Ok(0),
            Some(raw) => raw.parse().map_err(|_| SupervisorError::TornRefcountFile(raw)),
        }
    }

    fn write_refcount(&self, value: u64) -> Result<(), SupervisorError> {
        atomic_write(&refcount_file(&self.dir), &format!("{value}\n"))
    }

    pub fn increment_refcount(&self) -> Result<u64, SupervisorError> {
        let next = self.read_refcount()?.saturating_add(1);
        self.write_refcount(next)?;
        Ok(next)
    }

    /// Never underflows past zero.
    pub fn decrement_refcount(&self) -> Result<u64, SupervisorError> {
        let next = self.read_refcount()?.saturating_sub(1);
        self.write_refcount(next)?;
        Ok(next)
    }

    /// Claims the singleton role for this process, or fails with
    /// `AlreadyRunning` if another live daemon holds it.
    pub fn claim(&self) -> Result<(), SupervisorError> {
        if let Some(pid) = self.live_pid()? {
            return Err(SupervisorError::AlreadyRunning(pid));
        }
        atomic_write(&pid_file(&self.dir), &format!("{}\n", std::process::id()))
    }

    pub fn release(&self) {
        fs::remove_file(pid_file(&self.dir)).ok();
        fs::remove_file(refcount_file(&self.dir)).ok();
    }

    /// Sends SIGTERM to the live daemon, if any. This is the CLI `stop`
    /// path.
    #[cfg(unix)]
    pub fn signal_shutdown(&self) -> Result<(), SupervisorError> {
        if let Some(pid) = self.live_pid()? {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
        Ok(())
    }

    /// Waits for `active_requests` to drain to zero, bounded by
    /// `DRAIN_TIMEOUT`.
    pub async fn drain(&self, active_requests: &Arc<AtomicUsize>) {
        let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
        while active_requests.load(Ordering::SeqCst) > 0 {
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!("shutdown drain timed out with requests still in flight");
                break;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves once either signal arrives. Mirrors bare
/// `tokio::signal::ctrl_c` usage, extended with `SIGTERM` since this
/// process is normally stopped by the CLI sending a signal, not by an
/// interactive Ctrl-C.
pub async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal(SignalKind::terminate())
            .expect("failed to install sigterm handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supervisor_in(tmp: &tempfile::TempDir) -> Supervisor {
        Supervisor::with_dir(tmp.path().to_path_buf())
    }

    #[test]
    fn claim_writes_pid_file_and_detects_self_as_live() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = supervisor_in(&tmp);
        sup.claim().unwrap();
        let status = sup.status().unwrap();
        assert!(status.running);
        assert_eq!(status.pid, Some(std::process::id()));
    }

    #[test]
    fn second_claim_fails_while_first_is_live() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = supervisor_in(&tmp);
        sup.claim().unwrap();
        let err = sup.claim().unwrap_err();
        assert!(matches!(err, SupervisorError::AlreadyRunning(_)));
    }

    #[test]
    fn stale_pid_is_reclaimed() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = supervisor_in(&tmp);
        // a pid essentially guaranteed not to be alive in the test sandbox
        atomic_write(&pid_file(&tmp.path().to_path_buf()), "999999\n").unwrap();
        let status = sup.status().unwrap();
        assert!(!status.running);
    }

    #[test]
    fn refcount_never_underflows_past_zero() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = supervisor_in(&tmp);
        assert_eq!(sup.decrement_refcount().unwrap(), 0);
        assert_eq!(sup.increment_refcount().unwrap(), 1);
        assert_eq!(sup.increment_refcount().unwrap(), 2);
        assert_eq!(sup.decrement_refcount().unwrap(), 1);
        assert_eq!(sup.decrement_refcount().unwrap(), 0);
        assert_eq!(sup.decrement_refcount().unwrap(), 0);
    }

    #[test]
    fn torn_refcount_file_is_a_named_error() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = supervisor_in(&tmp);
        atomic_write(&refcount_file(&tmp.path().to_path_buf()), "not-a-number\n").unwrap();
        let err = sup.read_refcount().unwrap_err();
        assert!(matches!(err, SupervisorError::TornRefcountFile(_)));
    }

    #[test]
    fn release_removes_both_files() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = supervisor_in(&tmp);
        sup.claim().unwrap();
        sup.increment_refcount().unwrap();
        sup.release();
        assert!(!pid_file(&tmp.path().to_path_buf()).exists());
        assert!(!refcount_file(&tmp.path().to_path_buf()).exists());
    }
}
