//! Launch and supervision of one sandboxed execution.
//!
//! The supervisor clones the child into its namespaces, performs the
//! host-side plan actions during a two-round handshake, then watches the
//! payload until the first of: wall-clock deadline, resource breach,
//! natural exit, or cancellation.

use crate::config::builder::SandboxConfig;
use crate::config::types::{CgroupLimits, JailError, Result};
use crate::core::cancel::CancellationToken;
use crate::core::types::{
    CapturedOutput, LimitKind, OutputIntegrity, SandboxCommand, SandboxProcess,
    SupervisionOutcome, SupervisorState,
};
use crate::exec::handshake::{read_report, wait_readable, write_raw, ChildReport, Pipe, GO};
use crate::exec::plan::{EnvironmentPlan, PlanAction, PlanPhase};
use crate::exec::preexec::{child_main, ChildContext, ChildFds};
use crate::kernel::cgroup::{create_cgroup_backend, CgroupBreach};
use crate::kernel::namespace::{write_id_maps, IdMapping};
use crate::kernel::network::clone_macvlan;
use crate::kernel::signal::{kill_group, terminate_group, KillReport};
use crate::observability::{EventSink, LogSink};
use crate::safety::cleanup::{default_staging_base, TeardownGuard};
use crossbeam_channel::{bounded, Receiver};
use nix::sched::{clone, CloneFlags};
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::ffi::CString;
use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const CHILD_STACK_SIZE: usize = 2 * 1024 * 1024;
/// Poll interval of the supervision loop
pub const DEFAULT_TICK: Duration = Duration::from_millis(10);
/// Extra wait, past the grace period, for output streams to close
const OUTPUT_DRAIN_SLACK: Duration = Duration::from_secs(1);

fn to_process_error(prefix: &str, err: impl std::fmt::Display) -> JailError {
    JailError::Process(format!("{prefix}: {err}"))
}

/// Drives executions. Cheap to clone and safe to share between threads.
#[derive(Clone)]
pub struct ProcessSupervisor {
    sink: Arc<dyn EventSink>,
    staging_base: PathBuf,
    cgroup_root: Option<PathBuf>,
    tick: Duration,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self {
            sink: Arc::new(LogSink),
            staging_base: default_staging_base(),
            cgroup_root: None,
            tick: DEFAULT_TICK,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_staging_base(mut self, base: impl Into<PathBuf>) -> Self {
        self.staging_base = base.into();
        self
    }

    pub fn with_cgroup_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.cgroup_root = Some(root.into());
        self
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Execute `plan` and run `command` inside it. Consumes the plan.
    ///
    /// Never fails: every problem ends up in the outcome's state.
    pub fn run(
        &self,
        config: &SandboxConfig,
        plan: EnvironmentPlan,
        command: &SandboxCommand,
        cancel: &CancellationToken,
    ) -> SupervisionOutcome {
        let instance_id = uuid::Uuid::new_v4().to_string();
        let fingerprint = plan.fingerprint();
        let mut process = SandboxProcess::new(
            instance_id.clone(),
            config.limits().clone(),
            cancel.clone(),
            self.sink.clone(),
        );
        let mut guard = TeardownGuard::new(instance_id.clone());
        let mut outcome = SupervisionOutcome {
            instance_id: instance_id.clone(),
            state: SupervisorState::Preparing,
            pid: None,
            exit_code: None,
            signal: None,
            duration: None,
            started_at: None,
            stdout: CapturedOutput::empty(),
            stderr: CapturedOutput::empty(),
            kill_report: None,
            diagnostics: Vec::new(),
            cleanup_warnings: Vec::new(),
            plan_fingerprint: fingerprint,
        };

        log::debug!("[{}] launching {:?}", instance_id, command.argv);
        match self.launch(config, &plan, command, &mut process, &mut guard, &mut outcome) {
            Ok(launched) => {
                self.supervise(&mut process, &guard, &mut outcome);
                collect_output(launched, drain_timeout(config), &mut outcome);
            }
            Err(e) => {
                let reason = match e {
                    JailError::Process(message) => message,
                    other => other.to_string(),
                };
                log::warn!("[{}] spawn failed: {}", instance_id, reason);
                let _ = process.transition(SupervisorState::SpawnFailed { reason }, None);
            }
        }

        outcome.state = process.state().clone();
        outcome.pid = process.pid();
        outcome.started_at = process.started_at();
        outcome.cleanup_warnings = guard.release();
        outcome
    }

    fn launch(
        &self,
        config: &SandboxConfig,
        plan: &EnvironmentPlan,
        command: &SandboxCommand,
        process: &mut SandboxProcess,
        guard: &mut TeardownGuard,
        outcome: &mut SupervisionOutcome,
    ) -> Result<Launched> {
        if command.argv.is_empty() {
            return Err(JailError::Process("empty command".to_string()));
        }
        if process.cancel_token().is_cancelled() {
            return Err(JailError::Process("cancelled before start".to_string()));
        }

        let argv = to_cstrings(command.argv.iter().map(String::as_str))?;
        let env = config.env().resolve(std::env::vars());
        let envp = to_cstrings(env.iter().map(|(k, v)| format!("{}={}", k, v)))?;

        let needs_root = plan
            .actions()
            .iter()
            .any(|a| matches!(a, PlanAction::MountRoot { .. }));
        let staging = if needs_root {
            guard.create_staging(&self.staging_base)?
        } else {
            PathBuf::new()
        };

        let go = Pipe::new()?;
        let status = Pipe::new()?;
        let stdin = Pipe::new()?;
        let stdout = Pipe::new()?;
        let stderr = Pipe::new()?;

        let fds = ChildFds {
            go_read: go.read.as_raw_fd(),
            status_write: status.write.as_raw_fd(),
            stdin: stdin.read.as_raw_fd(),
            stdout: stdout.write.as_raw_fd(),
            stderr: stderr.write.as_raw_fd(),
        };
        let child_plan = plan.clone();
        let working_dir = config.working_dir().to_path_buf();
        let strict_mode = config.strict();
        let pass_fds = config.pass_fds().to_vec();
        let skip_setsid = config.skip_setsid();
        let child_cb: Box<dyn FnMut() -> isize> = Box::new(move || {
            let ctx = ChildContext {
                plan: &child_plan,
                staging: &staging,
                working_dir: &working_dir,
                strict_mode,
                argv: &argv,
                envp: &envp,
                fds,
                pass_fds: &pass_fds,
                skip_setsid,
            };
            child_main(&ctx)
        });

        let mut stack = vec![0u8; CHILD_STACK_SIZE];
        let flags: CloneFlags = plan.clone_flags();
        // SAFETY: the callback owns all its data and ends in execve or _exit.
        let pid = unsafe { clone(child_cb, &mut stack, flags, Some(libc::SIGCHLD)) }
            .map_err(|e| to_process_error("clone(sandbox)", e))?;
        process.set_pid(pid.as_raw());
        log::debug!("[{}] cloned sandbox pid {} ({:?})", process.instance_id(), pid, flags);

        // Child ends now belong to the child only
        drop(go.read);
        drop(status.write);
        drop(stdin.read);
        drop(stdout.write);
        drop(stderr.write);

        let mut go_write = File::from(go.write);
        let mut status_read = File::from(status.read);
        spawn_stdin_writer(stdin.write, command.stdin.clone());
        let launched = Launched {
            stdout: spawn_reader(stdout.read, command.output_limit),
            stderr: spawn_reader(stderr.read, command.output_limit),
        };

        let strict = config.strict();
        let handshake = self
            .host_round(plan, PlanPhase::Namespaces, strict, pid, process, guard, outcome)
            .and_then(|()| release_child(&mut go_write, process))
            .and_then(|()| self.expect_report(&mut status_read, ChildReport::Ready, process))
            .and_then(|()| {
                self.host_round(plan, PlanPhase::Limits, strict, pid, process, guard, outcome)
            })
            .and_then(|()| release_child(&mut go_write, process))
            .and_then(|()| self.expect_report(&mut status_read, ChildReport::Closed, process));

        if let Err(e) = handshake {
            // The child exits by itself after a reported failure; SIGKILL
            // covers the case where it is still waiting on us
            drop(go_write);
            kill_group(pid);
            collect_output(launched, drain_timeout(config), outcome);
            return Err(e);
        }

        process
            .transition(SupervisorState::Running, None)
            .map_err(|e| JailError::Process(e.to_string()))?;
        Ok(launched)
    }

    /// Host-side plan actions of one phase, performed on the stopped child.
    fn host_round(
        &self,
        plan: &EnvironmentPlan,
        phase: PlanPhase,
        strict: bool,
        pid: Pid,
        process: &SandboxProcess,
        guard: &mut TeardownGuard,
        outcome: &mut SupervisionOutcome,
    ) -> Result<()> {
        for action in plan.host_actions(phase) {
            match action {
                PlanAction::WriteIdMaps {
                    inside_uid,
                    outside_uid,
                    inside_gid,
                    outside_gid,
                } => write_id_maps(
                    pid.as_raw(),
                    &IdMapping {
                        inside_uid: *inside_uid,
                        outside_uid: *outside_uid,
                        inside_gid: *inside_gid,
                        outside_gid: *outside_gid,
                    },
                )?,
                PlanAction::CloneMacvlan { spec } => {
                    clone_macvlan(spec, pid.as_raw(), process.instance_id())?
                }
                PlanAction::ApplyCgroupLimits { limits } => {
                    if let Err(e) = self.apply_cgroup(limits, strict, pid, process, guard) {
                        if strict {
                            return Err(e);
                        }
                        log::warn!("cgroup limits not applied (permissive mode): {}", e);
                        outcome
                            .diagnostics
                            .push(format!("cgroup limits not applied: {}", e));
                    }
                }
                other => log::debug!("no host work for {:?}", other),
            }
        }
        Ok(())
    }

    fn apply_cgroup(
        &self,
        limits: &CgroupLimits,
        strict: bool,
        pid: Pid,
        process: &SandboxProcess,
        guard: &mut TeardownGuard,
    ) -> Result<()> {
        let backend = create_cgroup_backend(self.cgroup_root.as_deref(), strict)?;
        backend.create(process.instance_id())?;
        guard.track_cgroup(backend);
        if let Some(backend) = guard.cgroup() {
            backend.apply_limits(process.instance_id(), limits)?;
            backend.attach_process(process.instance_id(), pid.as_raw() as u32)?;
        }
        Ok(())
    }

    /// Wait for the child's next report, one tick at a time, so a
    /// cancellation during setup is seen within a tick.
    fn expect_report(
        &self,
        status: &mut File,
        expected: ChildReport,
        process: &SandboxProcess,
    ) -> Result<()> {
        await_report(status, self.tick, process.cancel_token())
            .and_then(|report| check_report(report, expected))
    }

    fn supervise(
        &self,
        process: &mut SandboxProcess,
        guard: &TeardownGuard,
        outcome: &mut SupervisionOutcome,
    ) {
        let Some(raw_pid) = process.pid() else {
            return;
        };
        let pid = Pid::from_raw(raw_pid);
        let wall_limit = process.limits().wall_time();
        let grace = process.limits().grace_period();
        let breach = || -> Option<LimitKind> {
            let backend = guard.cgroup()?;
            match backend.breach(guard.instance_id()) {
                Ok(found) => found.map(|b| match b {
                    CgroupBreach::Memory => LimitKind::Memory,
                    CgroupBreach::Processes => LimitKind::Processes,
                }),
                Err(e) => {
                    log::debug!("cgroup breach check failed: {}", e);
                    None
                }
            }
        };
        let past_deadline = |process: &SandboxProcess| match (wall_limit, process.elapsed()) {
            (Some(limit), Some(elapsed)) => elapsed >= limit,
            _ => false,
        };

        let (next, detail) = loop {
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => {
                    if past_deadline(process) {
                        self.terminate(pid, grace, outcome);
                        break (SupervisorState::TimedOut, None);
                    }
                    if let Some(kind) = breach() {
                        self.terminate(pid, grace, outcome);
                        break (
                            SupervisorState::LimitExceeded { kind },
                            Some(format!("{} limit breached", kind)),
                        );
                    }
                    if process.cancel_token().wait(self.tick) {
                        self.terminate(pid, grace, outcome);
                        break (SupervisorState::Killed, Some("cancelled".to_string()));
                    }
                }
                Ok(status @ WaitStatus::Exited(..)) | Ok(status @ WaitStatus::Signaled(..)) => {
                    record_status(status, outcome);
                    // Stragglers left in the group
                    let _ = nix::sys::signal::killpg(pid, Signal::SIGKILL);

                    // A limit that fired in the same tick takes precedence
                    if past_deadline(process) {
                        break (SupervisorState::TimedOut, None);
                    }
                    if let Some(kind) = breach().or_else(|| rlimit_kind(outcome.signal)) {
                        break (
                            SupervisorState::LimitExceeded { kind },
                            Some(format!("{} limit breached", kind)),
                        );
                    }
                    break (
                        SupervisorState::Completed {
                            exit_code: outcome.exit_code,
                            signal: outcome.signal,
                        },
                        None,
                    );
                }
                Ok(_) | Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => {
                    outcome.diagnostics.push(format!("waitpid failed: {}", e));
                    break (
                        SupervisorState::Completed {
                            exit_code: None,
                            signal: None,
                        },
                        Some(format!("waitpid failed: {}", e)),
                    );
                }
            }
        };

        outcome.duration = process.elapsed();
        if let Err(e) = process.transition(next, detail) {
            outcome.diagnostics.push(e.to_string());
        }
    }

    fn terminate(&self, pid: Pid, grace: Duration, outcome: &mut SupervisionOutcome) {
        let (report, status): (KillReport, _) = terminate_group(pid, grace);
        if let Some(status) = status {
            record_status(status, outcome);
        }
        outcome.diagnostics.extend(report.notes.iter().cloned());
        outcome.kill_report = Some(report);
    }
}

fn record_status(status: WaitStatus, outcome: &mut SupervisionOutcome) {
    match status {
        WaitStatus::Exited(_, code) => outcome.exit_code = Some(code),
        WaitStatus::Signaled(_, sig, _) => outcome.signal = Some(sig as i32),
        _ => {}
    }
}

/// rlimit breaches show up as the kernel's dedicated signals
fn rlimit_kind(signal: Option<i32>) -> Option<LimitKind> {
    match signal {
        Some(libc::SIGXCPU) => Some(LimitKind::CpuTime),
        Some(libc::SIGXFSZ) => Some(LimitKind::FileSize),
        _ => None,
    }
}

fn to_cstrings<I, S>(items: I) -> Result<Vec<CString>>
where
    I: IntoIterator<Item = S>,
    S: Into<Vec<u8>>,
{
    items
        .into_iter()
        .map(|s| {
            CString::new(s).map_err(|_| JailError::Process("argument contains NUL byte".to_string()))
        })
        .collect()
}

fn release_child(go: &mut File, process: &SandboxProcess) -> Result<()> {
    if process.cancel_token().is_cancelled() {
        return Err(JailError::Process("cancelled before start".to_string()));
    }
    if !write_raw(go.as_raw_fd(), &[GO]) {
        return Err(to_process_error(
            "handshake write",
            std::io::Error::last_os_error(),
        ));
    }
    Ok(())
}

fn check_report(report: ChildReport, expected: ChildReport) -> Result<()> {
    match report {
        report if report == expected => Ok(()),
        ChildReport::Failed(message) => Err(JailError::Process(message)),
        ChildReport::Closed => Err(JailError::Process(
            "sandbox exited during setup".to_string(),
        )),
        ChildReport::Ready => Err(JailError::Process(
            "unexpected readiness report".to_string(),
        )),
    }
}

fn await_report(
    status: &mut File,
    tick: Duration,
    cancel: &CancellationToken,
) -> Result<ChildReport> {
    loop {
        if wait_readable(status.as_raw_fd(), tick)? {
            return read_report(status);
        }
        if cancel.is_cancelled() {
            return Err(JailError::Process("cancelled before start".to_string()));
        }
    }
}

/// Output readers attached to the payload
struct Launched {
    stdout: Receiver<CapturedOutput>,
    stderr: Receiver<CapturedOutput>,
}

/// Feed stdin from a detached thread; the pipe closes when it finishes.
fn spawn_stdin_writer(fd: OwnedFd, input: Option<Vec<u8>>) {
    thread::spawn(move || {
        let mut file = File::from(fd);
        if let Some(input) = input {
            // EPIPE when the payload never reads stdin
            if let Err(e) = file.write_all(&input) {
                log::debug!("stdin not fully delivered: {}", e);
            }
        }
    });
}

/// Drain `fd` to EOF, keeping at most `limit` bytes.
fn spawn_reader(fd: OwnedFd, limit: usize) -> Receiver<CapturedOutput> {
    let (tx, rx) = bounded(1);
    thread::spawn(move || {
        let mut file = File::from(fd);
        let mut out = Vec::new();
        let mut buf = [0u8; 8192];
        let mut integrity = OutputIntegrity::Complete;

        loop {
            match file.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let room = limit.saturating_sub(out.len());
                    if n > room {
                        // Keep draining so the payload never blocks on a full pipe
                        out.extend_from_slice(&buf[..room]);
                        integrity = OutputIntegrity::Truncated;
                    } else {
                        out.extend_from_slice(&buf[..n]);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => {
                    integrity = OutputIntegrity::ReadError;
                    break;
                }
            }
        }

        let _ = tx.send(CapturedOutput {
            data: out,
            integrity,
        });
    });
    rx
}

fn drain_timeout(config: &SandboxConfig) -> Duration {
    config.limits().grace_period() + OUTPUT_DRAIN_SLACK
}

fn collect_output(launched: Launched, timeout: Duration, outcome: &mut SupervisionOutcome) {
    let mut take = |rx: &Receiver<CapturedOutput>, name: &str| match rx
        .recv_timeout(timeout)
    {
        Ok(output) => output,
        Err(_) => {
            // A process that escaped the group still holds the pipe
            outcome
                .diagnostics
                .push(format!("{} still open after the payload exited", name));
            CapturedOutput {
                data: Vec::new(),
                integrity: OutputIntegrity::ReadError,
            }
        }
    };
    let stdout = take(&launched.stdout, "stdout");
    let stderr = take(&launched.stderr, "stderr");
    outcome.stdout = stdout;
    outcome.stderr = stderr;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rlimit_signals_map_to_limits() {
        assert_eq!(rlimit_kind(Some(libc::SIGXCPU)), Some(LimitKind::CpuTime));
        assert_eq!(rlimit_kind(Some(libc::SIGXFSZ)), Some(LimitKind::FileSize));
        assert_eq!(rlimit_kind(Some(libc::SIGKILL)), None);
        assert_eq!(rlimit_kind(None), None);
    }

    #[test]
    fn test_reader_truncates_but_drains() {
        let pipe = Pipe::new().unwrap();
        let rx = spawn_reader(pipe.read, 4);
        let mut writer = File::from(pipe.write);
        writer.write_all(b"hello world").unwrap();
        drop(writer);

        let output = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(output.data, b"hell");
        assert_eq!(output.integrity, OutputIntegrity::Truncated);
    }

    #[test]
    fn test_silent_child_yields_to_cancellation() {
        let pipe = Pipe::new().unwrap();
        let mut status = File::from(pipe.read);
        let cancel = CancellationToken::new();
        let remote = cancel.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            remote.cancel();
        });

        let started = std::time::Instant::now();
        let err = await_report(&mut status, DEFAULT_TICK, &cancel).unwrap_err();
        canceller.join().unwrap();
        assert!(err.to_string().contains("cancelled before start"));
        assert!(started.elapsed() < Duration::from_secs(2));
        drop(pipe.write);
    }

    #[test]
    fn test_report_is_read_once_available() {
        let pipe = Pipe::new().unwrap();
        assert!(write_raw(pipe.write.as_raw_fd(), &[crate::exec::handshake::READY]));
        let mut status = File::from(pipe.read);
        let report = await_report(&mut status, DEFAULT_TICK, &CancellationToken::new()).unwrap();
        assert_eq!(report, ChildReport::Ready);
        assert!(check_report(report, ChildReport::Ready).is_ok());
        assert!(check_report(ChildReport::Closed, ChildReport::Ready).is_err());
    }

    #[test]
    fn test_to_cstrings_rejects_nul() {
        assert!(to_cstrings(["ok", "also ok"]).is_ok());
        assert!(to_cstrings(["bad\0arg"]).is_err());
    }
}
