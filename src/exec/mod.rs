//! Execution control
//!
//! Builds the environment plan and carries out its sandbox side inside the
//! cloned child, with type-state enforced ordering.

pub mod handshake;
pub mod plan;
pub mod preexec;
