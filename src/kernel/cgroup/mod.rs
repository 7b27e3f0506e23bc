//! Cgroup resource governance
//!
//! Per-execution cgroup v2 directories carrying memory, pids and cpu limits.

pub mod backend;
pub mod v2;

pub use backend::{create_cgroup_backend, CgroupBackend, CgroupBreach};
pub use v2::CgroupV2;
