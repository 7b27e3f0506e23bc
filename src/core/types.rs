use crate::config::types::ResourceLimits;
use crate::core::cancel::CancellationToken;
use crate::kernel::signal::KillReport;
use crate::observability::{EventSink, LifecycleEvent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Default cap on captured bytes per output stream
pub const DEFAULT_OUTPUT_LIMIT: usize = 16 * 1024 * 1024;

/// The command to run inside the sandbox
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SandboxCommand {
    pub argv: Vec<String>,
    /// Bytes fed to the payload's stdin; empty stdin when absent
    pub stdin: Option<Vec<u8>>,
    /// Per-stream capture limit; output past it is drained and discarded
    pub output_limit: usize,
}

impl SandboxCommand {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            stdin: None,
            output_limit: DEFAULT_OUTPUT_LIMIT,
        }
    }

    pub fn with_stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn with_output_limit(mut self, limit: usize) -> Self {
        self.output_limit = limit;
        self
    }

    pub fn program(&self) -> Option<&str> {
        self.argv.first().map(String::as_str)
    }
}

/// Which ceiling stopped the process
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    CpuTime,
    FileSize,
    Memory,
    Processes,
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LimitKind::CpuTime => "cpu_time",
            LimitKind::FileSize => "file_size",
            LimitKind::Memory => "memory",
            LimitKind::Processes => "processes",
        })
    }
}

/// Supervisor state machine
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SupervisorState {
    Preparing,
    Running,
    Completed {
        exit_code: Option<i32>,
        signal: Option<i32>,
    },
    TimedOut,
    LimitExceeded {
        kind: LimitKind,
    },
    Killed,
    SpawnFailed {
        reason: String,
    },
}

impl SupervisorState {
    pub fn name(&self) -> &'static str {
        match self {
            SupervisorState::Preparing => "preparing",
            SupervisorState::Running => "running",
            SupervisorState::Completed { .. } => "completed",
            SupervisorState::TimedOut => "timed_out",
            SupervisorState::LimitExceeded { .. } => "limit_exceeded",
            SupervisorState::Killed => "killed",
            SupervisorState::SpawnFailed { .. } => "spawn_failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, SupervisorState::Preparing | SupervisorState::Running)
    }

    pub fn can_transition_to(&self, next: &SupervisorState) -> bool {
        match self {
            SupervisorState::Preparing => matches!(
                next,
                SupervisorState::Running | SupervisorState::SpawnFailed { .. }
            ),
            SupervisorState::Running => next.is_terminal() && !matches!(next, SupervisorState::SpawnFailed { .. }),
            _ => false,
        }
    }
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid supervisor transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: &'static str,
    pub to: &'static str,
}

/// Integrity of a captured output stream
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutputIntegrity {
    Complete,
    /// The stream exceeded the capture limit
    Truncated,
    /// Reading failed or the stream never closed
    ReadError,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CapturedOutput {
    pub data: Vec<u8>,
    pub integrity: OutputIntegrity,
}

impl CapturedOutput {
    pub fn empty() -> Self {
        Self {
            data: Vec::new(),
            integrity: OutputIntegrity::Complete,
        }
    }
}

/// One in-flight jailed execution. Only the supervisor mutates it.
pub struct SandboxProcess {
    instance_id: String,
    pid: Option<i32>,
    started: Option<Instant>,
    started_at: Option<DateTime<Utc>>,
    limits: ResourceLimits,
    cancel: CancellationToken,
    state: SupervisorState,
    sink: Arc<dyn EventSink>,
}

impl SandboxProcess {
    pub fn new(
        instance_id: String,
        limits: ResourceLimits,
        cancel: CancellationToken,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            instance_id,
            pid: None,
            started: None,
            started_at: None,
            limits,
            cancel,
            state: SupervisorState::Preparing,
            sink,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn pid(&self) -> Option<i32> {
        self.pid
    }

    pub fn state(&self) -> &SupervisorState {
        &self.state
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// Time since the payload started running
    pub fn elapsed(&self) -> Option<Duration> {
        self.started.map(|s| s.elapsed())
    }

    /// Record the payload pid once clone succeeded
    pub fn set_pid(&mut self, pid: i32) {
        self.pid = Some(pid);
    }

    /// Move to `next`. The first terminal state sticks.
    pub fn transition(
        &mut self,
        next: SupervisorState,
        detail: Option<String>,
    ) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(&next) {
            return Err(InvalidTransition {
                from: self.state.name(),
                to: next.name(),
            });
        }

        if next == SupervisorState::Running {
            self.started = Some(Instant::now());
            self.started_at = Some(Utc::now());
        }

        let mut event = LifecycleEvent::new(&self.instance_id, self.state.name(), next.name())
            .with_pid(self.pid);
        if let Some(detail) = detail {
            event = event.with_detail(detail);
        }
        self.state = next;
        self.sink.emit(&event);
        Ok(())
    }
}

/// Everything the supervisor learned about one execution
#[derive(Clone, Debug)]
pub struct SupervisionOutcome {
    pub instance_id: String,
    pub state: SupervisorState,
    pub pid: Option<i32>,
    /// Raw exit status of the payload, when it was reaped
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    /// Wall-clock time from Running to reap; absent if never started
    pub duration: Option<Duration>,
    pub started_at: Option<DateTime<Utc>>,
    pub stdout: CapturedOutput,
    pub stderr: CapturedOutput,
    pub kill_report: Option<KillReport>,
    pub diagnostics: Vec<String>,
    pub cleanup_warnings: Vec<String>,
    pub plan_fingerprint: String,
}
