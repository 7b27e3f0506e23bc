//! Signal delivery to sandboxed process groups and async-safe shutdown flags.
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// What the termination protocol had to do
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct KillReport {
    pub term_sent: bool,
    pub kill_sent: bool,
    pub waited_ms: u64,
    pub notes: Vec<String>,
}

fn signal_group(pid: Pid, sig: Signal, report: &mut KillReport) {
    // The group may not exist yet if the child never reached setsid
    if signal::killpg(pid, sig).is_err() {
        if let Err(e) = signal::kill(pid, sig) {
            report
                .notes
                .push(format!("{} to pid {} failed: {}", sig, pid, e));
        } else {
            report.notes.push(format!("group {} fallback used", sig));
        }
    }
}

/// SIGTERM the process group, wait up to `grace`, SIGKILL, reap.
///
/// Returns the report and the leader's final wait status.
pub fn terminate_group(pid: Pid, grace: Duration) -> (KillReport, Option<WaitStatus>) {
    let mut report = KillReport::default();
    let start = Instant::now();

    signal_group(pid, Signal::SIGTERM, &mut report);
    report.term_sent = true;

    let mut status = None;
    while start.elapsed() < grace {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => std::thread::sleep(POLL_INTERVAL),
            Ok(ws @ WaitStatus::Exited(..)) | Ok(ws @ WaitStatus::Signaled(..)) => {
                status = Some(ws);
                break;
            }
            Ok(_) | Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                report.notes.push(format!("waitpid during grace: {}", e));
                break;
            }
        }
    }

    // Stragglers in the group get SIGKILL even when the leader already left
    if status.is_none() {
        signal_group(pid, Signal::SIGKILL, &mut report);
        report.kill_sent = true;
        status = reap(pid, &mut report);
    } else {
        let _ = signal::killpg(pid, Signal::SIGKILL);
    }

    report.waited_ms = start.elapsed().as_millis() as u64;
    log::debug!(
        "Terminated group {}: term={} kill={} waited={}ms",
        pid,
        report.term_sent,
        report.kill_sent,
        report.waited_ms
    );
    (report, status)
}

/// SIGKILL the group and reap the leader without a grace period
pub fn kill_group(pid: Pid) -> Option<WaitStatus> {
    let mut report = KillReport::default();
    signal_group(pid, Signal::SIGKILL, &mut report);
    reap(pid, &mut report)
}

fn reap(pid: Pid, report: &mut KillReport) -> Option<WaitStatus> {
    loop {
        match waitpid(pid, None) {
            Ok(ws @ WaitStatus::Exited(..)) | Ok(ws @ WaitStatus::Signaled(..)) => return Some(ws),
            Ok(_) | Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                report.notes.push(format!("waitpid after SIGKILL: {}", e));
                return None;
            }
        }
    }
}

/// Global shutdown flag (async-safe atomic)
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Global signal received (async-safe atomic)
static SIGNAL_RECEIVED: AtomicU32 = AtomicU32::new(0);

/// Records SIGINT/SIGTERM/SIGHUP so a front end can cancel running sandboxes
pub struct SignalHandler;

impl SignalHandler {
    /// Must be called early in main() before any threads are spawned
    pub fn init() -> Result<Self, String> {
        let sig_action = SigAction::new(
            SigHandler::Handler(Self::signal_handler),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );

        for sig in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP] {
            // SAFETY: the handler only stores to atomics.
            unsafe { signal::sigaction(sig, &sig_action) }
                .map_err(|e| format!("Failed to install {} handler: {}", sig, e))?;
        }

        log::debug!("Signal handlers installed (SIGINT, SIGTERM, SIGHUP)");
        Ok(Self)
    }

    /// Only performs atomic operations
    extern "C" fn signal_handler(signal: libc::c_int) {
        SIGNAL_RECEIVED.store(signal as u32, Ordering::SeqCst);
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
    }

    pub fn shutdown_requested(&self) -> bool {
        SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
    }

    /// Signal that was received (0 if none)
    pub fn get_signal(&self) -> u32 {
        SIGNAL_RECEIVED.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn test_terminate_group_kills_term_ignoring_child() {
        // `trap '' TERM` makes the shell ignore SIGTERM, forcing the SIGKILL path
        let child = Command::new("sh")
            .args(["-c", "trap '' TERM; sleep 30"])
            .spawn()
            .unwrap();
        let pid = Pid::from_raw(child.id() as i32);
        std::thread::sleep(Duration::from_millis(100));

        let (report, status) = terminate_group(pid, Duration::from_millis(200));
        assert!(report.term_sent);
        assert!(report.kill_sent);
        assert!(report.waited_ms >= 200);
        assert!(matches!(
            status,
            Some(WaitStatus::Signaled(_, Signal::SIGKILL, _))
        ));
    }

    #[test]
    fn test_terminate_group_stops_at_sigterm() {
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = Pid::from_raw(child.id() as i32);

        let (report, status) = terminate_group(pid, Duration::from_secs(5));
        assert!(report.term_sent);
        assert!(!report.kill_sent);
        assert!(matches!(
            status,
            Some(WaitStatus::Signaled(_, Signal::SIGTERM, _))
        ));
    }

    #[test]
    fn test_shutdown_flag() {
        let handler = SignalHandler::init().unwrap();
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
        assert!(handler.shutdown_requested());
        SHUTDOWN_REQUESTED.store(false, Ordering::SeqCst);
    }
}
