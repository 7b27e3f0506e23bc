//! Process model and supervision.
//!
//! [`supervisor::ProcessSupervisor`] launches one sandboxed command per call
//! and reports a [`types::SupervisionOutcome`]; [`cancel::CancellationToken`]
//! lets another thread stop it.

pub mod cancel;
pub mod supervisor;
pub mod types;

pub use cancel::CancellationToken;
pub use supervisor::ProcessSupervisor;
pub use types::{
    CapturedOutput, LimitKind, OutputIntegrity, SandboxCommand, SupervisionOutcome,
    SupervisorState,
};
