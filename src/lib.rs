//! jailbox: run untrusted commands inside a kernel-enforced sandbox
//!
//! An execution is a four-stage pipeline:
//!
//! 1. [`config`]: a [`SandboxConfig`] is built and validated once. Every
//!    violated constraint is reported together.
//! 2. [`exec::plan`]: the config is turned into an ordered
//!    [`EnvironmentPlan`] of setup actions. Planning only reads metadata.
//! 3. [`core::supervisor`]: the plan is executed around a cloned child and
//!    the payload is supervised until it exits, hits a limit, runs out of
//!    wall-clock time or is cancelled.
//! 4. [`verdict`]: the outcome is mapped to an [`ExecutionResult`].
//!
//! ## Kernel primitives ([`kernel`])
//! - [`kernel::namespace`]: namespace creation and user-namespace id maps
//! - [`kernel::mount`]: root assembly, bind/tmpfs/typed mounts, `/proc`
//! - [`kernel::cgroup`]: cgroup v2 limits and breach detection
//! - [`kernel::rlimit`]: rlimits and scheduling priority
//! - [`kernel::credentials`], [`kernel::capabilities`]: identity switch and
//!   capability reduction
//! - [`kernel::network`]: MACVLAN interfaces for the network namespace
//! - [`kernel::signal`]: process-group termination

// Kernel Primitives
pub mod kernel;

// Plan construction and the in-child pre-exec chain
pub mod exec;

// Process model and supervision
pub mod core;

// Result classification
pub mod verdict;

// Per-execution teardown
pub mod safety;

// Lifecycle events
pub mod observability;

// Configuration
pub mod config;

// CLI entrypoint wiring for the jailbox binary
pub mod cli;

pub use crate::config::builder::{SandboxConfig, SandboxConfigBuilder};
pub use crate::config::types::{ConfigError, JailError, PlanError, Result};
pub use crate::core::{CancellationToken, ProcessSupervisor, SandboxCommand};
pub use crate::exec::plan::{build_plan, EnvironmentPlan, PlanAction};
pub use crate::verdict::{ExecutionResult, ResultReporter, TerminationCause};

/// Plan, launch and supervise `command` under `config`.
///
/// Configuration and planning problems are returned as errors before
/// anything runs. Everything after that, including a failed spawn, is
/// described by the returned [`ExecutionResult`].
pub fn execute(
    config: &SandboxConfig,
    command: &SandboxCommand,
    cancel: &CancellationToken,
) -> Result<ExecutionResult> {
    let plan = build_plan(config)?;
    let outcome = ProcessSupervisor::new().run(config, plan, command, cancel);
    Ok(ResultReporter::report(outcome))
}
