//! Cgroup backend abstraction.

use crate::config::types::{CgroupLimits, JailError, Result};
use std::path::{Path, PathBuf};

pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup/jailbox";

/// A cgroup limit the sandbox ran into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupBreach {
    /// memory.events reported an oom_kill
    Memory,
    /// pids.events reported a refused fork
    Processes,
}

pub trait CgroupBackend: Send + Sync {
    fn backend_name(&self) -> &str;
    fn create(&self, instance_id: &str) -> Result<()>;
    fn attach_process(&self, instance_id: &str, pid: u32) -> Result<()>;
    fn apply_limits(&self, instance_id: &str, limits: &CgroupLimits) -> Result<()>;
    /// First breach recorded by the kernel, if any
    fn breach(&self, instance_id: &str) -> Result<Option<CgroupBreach>>;
    fn cgroup_path(&self, instance_id: &str) -> PathBuf;
    fn remove(&self, instance_id: &str) -> Result<()>;
}

pub fn cgroup_v2_available() -> bool {
    Path::new("/sys/fs/cgroup/cgroup.controllers").exists()
}

/// Cgroup v2 backend rooted at `root` (or the default hierarchy).
pub fn create_cgroup_backend(
    root: Option<&Path>,
    strict_mode: bool,
) -> Result<Box<dyn CgroupBackend>> {
    if !cgroup_v2_available() {
        if strict_mode {
            return Err(JailError::Cgroup(
                "cgroup v2 is not mounted at /sys/fs/cgroup".to_string(),
            ));
        }
        log::warn!("cgroup v2 not available; limits will be attempted anyway (permissive mode)");
    }

    let root = root
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CGROUP_ROOT));
    Ok(Box::new(crate::kernel::cgroup::v2::CgroupV2::new(
        root,
        strict_mode,
    )))
}
