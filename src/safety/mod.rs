//! Safety and cleanup
//!
//! Per-execution resources are released by a scoped guard, even when the
//! payload had to be killed.

pub mod cleanup;

pub use cleanup::TeardownGuard;
