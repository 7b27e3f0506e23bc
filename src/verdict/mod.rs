//! Result classification
//!
//! Turns a supervision outcome into the caller-facing [`ExecutionResult`].

pub mod reporter;

pub use reporter::{ExecutionResult, ResultReporter, TerminationCause};
