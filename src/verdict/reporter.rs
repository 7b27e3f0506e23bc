/// Maps supervisor outcomes to execution results
use crate::core::types::{LimitKind, OutputIntegrity, SupervisionOutcome, SupervisorState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Exit code reported when the wall-clock limit fired
pub const EXIT_TIMED_OUT: i32 = 124;
/// Exit code reported when a resource ceiling stopped the payload
pub const EXIT_LIMIT_EXCEEDED: i32 = 137;
/// Exit code reported when the caller cancelled the execution
pub const EXIT_KILLED: i32 = 130;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TerminationCause {
    NaturalExit,
    TimedOut,
    LimitExceeded,
    Killed,
    SpawnFailed,
}

impl fmt::Display for TerminationCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TerminationCause::NaturalExit => "natural_exit",
            TerminationCause::TimedOut => "timed_out",
            TerminationCause::LimitExceeded => "limit_exceeded",
            TerminationCause::Killed => "killed",
            TerminationCause::SpawnFailed => "spawn_failed",
        })
    }
}

/// Final report of one execution
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionResult {
    pub instance_id: String,
    pub cause: TerminationCause,
    /// Payload exit code, or the synthetic code for supervisor-initiated
    /// terminations. Absent for spawn failures and signal deaths.
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub duration_ms: Option<u64>,
    pub limit_triggered: Option<LimitKind>,
    pub stdout: String,
    pub stderr: String,
    pub stdout_integrity: OutputIntegrity,
    pub stderr_integrity: OutputIntegrity,
    pub diagnostics: Vec<String>,
    pub spawn_error: Option<String>,
    pub cleanup_warnings: Vec<String>,
    pub plan_fingerprint: String,
    pub started_at: Option<DateTime<Utc>>,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        self.cause == TerminationCause::NaturalExit && self.exit_code == Some(0)
    }

    /// Exit status for a front end wrapping the payload
    pub fn process_exit_code(&self) -> i32 {
        match (self.exit_code, self.signal) {
            (Some(code), _) => code,
            (None, Some(sig)) => 128 + sig,
            (None, None) => 1,
        }
    }
}

pub struct ResultReporter;

impl ResultReporter {
    pub fn report(outcome: SupervisionOutcome) -> ExecutionResult {
        let mut spawn_error = None;
        let mut limit_triggered = None;

        let (cause, exit_code) = match &outcome.state {
            SupervisorState::Completed { exit_code, .. } => {
                (TerminationCause::NaturalExit, *exit_code)
            }
            SupervisorState::TimedOut => (TerminationCause::TimedOut, Some(EXIT_TIMED_OUT)),
            SupervisorState::LimitExceeded { kind } => {
                limit_triggered = Some(*kind);
                (TerminationCause::LimitExceeded, Some(EXIT_LIMIT_EXCEEDED))
            }
            SupervisorState::Killed => (TerminationCause::Killed, Some(EXIT_KILLED)),
            SupervisorState::SpawnFailed { reason } => {
                spawn_error = Some(reason.clone());
                (TerminationCause::SpawnFailed, None)
            }
            SupervisorState::Preparing | SupervisorState::Running => {
                log::error!(
                    "[{}] reporting a non-terminal state: {}",
                    outcome.instance_id,
                    outcome.state
                );
                spawn_error = Some(format!("execution ended in state {}", outcome.state));
                (TerminationCause::SpawnFailed, None)
            }
        };

        let (signal, duration_ms) = if cause == TerminationCause::SpawnFailed {
            (None, None)
        } else {
            (
                outcome.signal,
                outcome.duration.map(|d| d.as_millis() as u64),
            )
        };

        if !outcome.cleanup_warnings.is_empty() {
            log::warn!(
                "[{}] cleanup incomplete: {}",
                outcome.instance_id,
                outcome.cleanup_warnings.join("; ")
            );
        }

        ExecutionResult {
            instance_id: outcome.instance_id,
            cause,
            exit_code,
            signal,
            duration_ms,
            limit_triggered,
            stdout: String::from_utf8_lossy(&outcome.stdout.data).into_owned(),
            stderr: String::from_utf8_lossy(&outcome.stderr.data).into_owned(),
            stdout_integrity: outcome.stdout.integrity,
            stderr_integrity: outcome.stderr.integrity,
            diagnostics: outcome.diagnostics,
            spawn_error,
            cleanup_warnings: outcome.cleanup_warnings,
            plan_fingerprint: outcome.plan_fingerprint,
            started_at: outcome.started_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::CapturedOutput;
    use std::time::Duration;

    fn outcome(state: SupervisorState) -> SupervisionOutcome {
        SupervisionOutcome {
            instance_id: "r1".to_string(),
            state,
            pid: Some(42),
            exit_code: None,
            signal: None,
            duration: Some(Duration::from_millis(1500)),
            started_at: Some(Utc::now()),
            stdout: CapturedOutput {
                data: b"out".to_vec(),
                integrity: OutputIntegrity::Complete,
            },
            stderr: CapturedOutput::empty(),
            kill_report: None,
            diagnostics: Vec::new(),
            cleanup_warnings: Vec::new(),
            plan_fingerprint: "abc".to_string(),
        }
    }

    #[test]
    fn test_natural_exit_passes_code_through() {
        let result = ResultReporter::report(outcome(SupervisorState::Completed {
            exit_code: Some(3),
            signal: None,
        }));
        assert_eq!(result.cause, TerminationCause::NaturalExit);
        assert_eq!(result.exit_code, Some(3));
        assert_eq!(result.duration_ms, Some(1500));
        assert_eq!(result.stdout, "out");
        assert!(!result.succeeded());
    }

    #[test]
    fn test_supervisor_terminations_get_synthetic_codes() {
        let timed_out = ResultReporter::report(outcome(SupervisorState::TimedOut));
        assert_eq!(timed_out.exit_code, Some(EXIT_TIMED_OUT));

        let limited = ResultReporter::report(outcome(SupervisorState::LimitExceeded {
            kind: LimitKind::Memory,
        }));
        assert_eq!(limited.exit_code, Some(EXIT_LIMIT_EXCEEDED));
        assert_eq!(limited.limit_triggered, Some(LimitKind::Memory));

        let killed = ResultReporter::report(outcome(SupervisorState::Killed));
        assert_eq!(killed.cause, TerminationCause::Killed);
        assert_eq!(killed.exit_code, Some(EXIT_KILLED));
    }

    #[test]
    fn test_spawn_failure_has_no_code_or_duration() {
        let mut failed = outcome(SupervisorState::SpawnFailed {
            reason: "execvpe(/nope): ENOENT".to_string(),
        });
        failed.signal = Some(9);
        failed.cleanup_warnings.push("rmdir failed".to_string());

        let result = ResultReporter::report(failed);
        assert_eq!(result.cause, TerminationCause::SpawnFailed);
        assert_eq!(result.exit_code, None);
        assert_eq!(result.duration_ms, None);
        assert_eq!(result.signal, None);
        assert!(result.spawn_error.unwrap().contains("ENOENT"));
        // Cleanup trouble never replaces the primary cause
        assert_eq!(result.cleanup_warnings.len(), 1);
    }

    #[test]
    fn test_signal_death_exit_status() {
        let mut signaled = outcome(SupervisorState::Completed {
            exit_code: None,
            signal: Some(11),
        });
        signaled.signal = Some(11);
        let result = ResultReporter::report(signaled);
        assert_eq!(result.exit_code, None);
        assert_eq!(result.process_exit_code(), 139);
    }
}
