//! Process controller
//!
//! Liveness probes and signal delivery for arbitrary processes by pid:
//! - Probing whether a pid is alive (zombies count as dead)
//! - Delivering signals with `NotFound` / `PermissionDenied` mapping
//! - SIGTERM -> wait -> SIGKILL escalation
//! - Reading process identity to detect pid reuse

use std::time::{Duration, Instant};

use detach_core::domain::JobRecord;
use detach_core::{Error, Result};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill, killpg};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{Pid, getpgid};
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long to wait for the kernel to tear down a SIGKILLed process
const KILL_GRACE: Duration = Duration::from_secs(5);

/// How a process ended up terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The process was already gone
    AlreadyExited,
    /// The process exited after SIGTERM
    Graceful,
    /// SIGKILL was required
    Forced,
}

fn to_pid(pid: u32) -> Option<Pid> {
    i32::try_from(pid).ok().filter(|p| *p > 0).map(Pid::from_raw)
}

/// Non-destructive existence probe
///
/// Zombies are reported as dead but never reaped, so a parent waiting on
/// the pid still gets its exit status. A process we are not allowed to
/// signal still counts as alive.
pub fn is_alive(pid: u32) -> bool {
    let Some(target) = to_pid(pid) else {
        return false;
    };

    match kill(target, None) {
        Ok(()) => !is_zombie(pid),
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Collects the exit status of `pid` if it is an exited child of the caller
///
/// Long-lived launchers call this for jobs they spawned once the job is
/// settled; the status itself is not needed, the job reports through the
/// State Store.
pub fn reap(pid: u32) -> bool {
    let Some(target) = to_pid(pid) else {
        return false;
    };

    matches!(
        waitpid(target, Some(WaitPidFlag::WNOHANG)),
        Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..))
    )
}

/// Sends `signal` to `pid`
pub fn signal(pid: u32, signal: Signal) -> Result<()> {
    let target = to_pid(pid).ok_or(Error::ProcessNotFound(pid))?;

    match kill(target, signal) {
        Ok(()) => Ok(()),
        Err(Errno::ESRCH) => Err(Error::ProcessNotFound(pid)),
        Err(Errno::EPERM) => Err(Error::PermissionDenied(format!(
            "not allowed to send {signal} to pid {pid}"
        ))),
        Err(e) => Err(Error::Io(std::io::Error::from(e))),
    }
}

/// Gracefully terminates a process, escalating to SIGKILL after `timeout`
///
/// A process that is already gone is a success. When the target leads its
/// own process group (every detached executor does), the forced kill is
/// delivered to the whole group so workflow children do not linger.
pub async fn terminate(pid: u32, timeout: Duration) -> Result<Termination> {
    if !is_alive(pid) {
        return Ok(Termination::AlreadyExited);
    }

    let group_leader = to_pid(pid).is_some_and(|p| getpgid(Some(p)) == Ok(p));

    match signal(pid, Signal::SIGTERM) {
        Ok(()) => {}
        Err(Error::ProcessNotFound(_)) => return Ok(Termination::AlreadyExited),
        Err(e) => return Err(e),
    }
    debug!("Sent SIGTERM to pid {}", pid);

    if wait_for_exit(pid, timeout).await {
        info!("Process {} exited gracefully", pid);
        return Ok(Termination::Graceful);
    }

    warn!(
        "Process {} still alive after {:?}, sending SIGKILL",
        pid, timeout
    );
    let killed = match to_pid(pid) {
        Some(p) if group_leader => killpg(p, Signal::SIGKILL).map_err(|e| match e {
            Errno::ESRCH => Error::ProcessNotFound(pid),
            Errno::EPERM => Error::PermissionDenied(format!("not allowed to kill group {pid}")),
            other => Error::Io(std::io::Error::from(other)),
        }),
        _ => signal(pid, Signal::SIGKILL),
    };
    match killed {
        Ok(()) | Err(Error::ProcessNotFound(_)) => {}
        Err(e) => return Err(e),
    }

    if wait_for_exit(pid, KILL_GRACE).await {
        return Ok(Termination::Forced);
    }

    Err(Error::Timeout {
        pid,
        waited: timeout + KILL_GRACE,
    })
}

async fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !is_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Whether `record` still describes the process currently holding its pid
///
/// Records without a start time (or hosts without `/proc`) fall back to a
/// plain liveness check.
pub fn matches_record(record: &JobRecord) -> bool {
    if !is_alive(record.pid) {
        return false;
    }

    match (record.start_ticks, start_ticks(record.pid)) {
        (Some(expected), Some(actual)) if expected != actual => {
            warn!(
                "Pid {} of job {} was reused by another process",
                record.pid, record.job_id
            );
            false
        }
        _ => true,
    }
}

/// Process start time in clock ticks since boot (Linux only)
pub fn start_ticks(pid: u32) -> Option<u64> {
    // fields after the command name: state is field 3, starttime field 22
    stat_fields(pid)?.get(19)?.parse().ok()
}

fn is_zombie(pid: u32) -> bool {
    stat_fields(pid)
        .and_then(|fields| fields.first().cloned())
        .is_some_and(|state| state == "Z" || state == "X")
}

fn stat_fields(pid: u32) -> Option<Vec<String>> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // the command name may itself contain spaces and parentheses
    let rest = &stat[stat.rfind(')')? + 1..];
    Some(rest.split_whitespace().map(str::to_string).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use detach_core::domain::JobId;
    use std::process::{Command, Stdio};

    fn spawn(script: &str) -> std::process::Child {
        Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap()
    }

    #[test]
    fn test_is_alive_current_process() {
        assert!(is_alive(std::process::id()));
    }

    #[test]
    fn test_is_alive_invalid_pids() {
        assert!(!is_alive(0));
        assert!(!is_alive(u32::MAX));
    }

    #[test]
    fn test_is_alive_leaves_exit_status_to_the_parent() {
        let mut child = spawn("exit 3");
        let pid = child.id();
        std::thread::sleep(Duration::from_millis(300));

        assert!(!is_alive(pid));
        assert!(!is_alive(pid));
        assert_eq!(child.wait().unwrap().code(), Some(3));
    }

    #[test]
    fn test_reap_exited_child() {
        let mut child = spawn("exec sleep 30");
        let pid = child.id();
        assert!(!reap(pid));

        child.kill().unwrap();
        std::thread::sleep(Duration::from_millis(300));
        assert!(reap(pid));
        assert!(!reap(pid));
        assert!(!reap(std::process::id()));
    }

    #[test]
    fn test_signal_missing_process() {
        assert!(matches!(
            signal(0, Signal::SIGTERM),
            Err(Error::ProcessNotFound(0))
        ));
    }

    #[tokio::test]
    async fn test_terminate_already_exited() {
        let outcome = terminate(u32::MAX, Duration::from_secs(1)).await.unwrap();
        assert_eq!(outcome, Termination::AlreadyExited);
    }

    #[tokio::test]
    async fn test_terminate_graceful() {
        let child = spawn("exec sleep 30");
        let pid = child.id();
        assert!(is_alive(pid));

        let outcome = terminate(pid, Duration::from_secs(5)).await.unwrap();
        assert_eq!(outcome, Termination::Graceful);
        assert!(!is_alive(pid));
    }

    #[tokio::test]
    async fn test_terminate_forced_when_sigterm_ignored() {
        let child = spawn("trap '' TERM; while true; do sleep 0.1; done");
        let pid = child.id();
        std::thread::sleep(Duration::from_millis(200));

        let started = Instant::now();
        let outcome = terminate(pid, Duration::from_millis(500)).await.unwrap();
        assert_eq!(outcome, Termination::Forced);
        assert!(started.elapsed() < Duration::from_millis(500) + KILL_GRACE);
        assert!(!is_alive(pid));
    }

    #[test]
    fn test_start_ticks_identity() {
        let me = std::process::id();
        let record = JobRecord::new(JobId::new("self").unwrap(), me, Utc::now())
            .with_start_ticks(start_ticks(me));
        assert!(matches_record(&record));

        if let Some(ticks) = start_ticks(me) {
            let reused = record.clone().with_start_ticks(Some(ticks + 1));
            assert!(!matches_record(&reused));
        }
    }
}
