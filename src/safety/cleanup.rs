/// Scoped release of per-execution host resources
use crate::config::types::{JailError, Result};
use crate::kernel::cgroup::CgroupBackend;
use log::{debug, warn};
use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

/// Resource types that need cleanup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceType {
    Cgroup,
    TempDirectory,
}

#[derive(Debug, Clone)]
pub struct ResourceEntry {
    pub resource_type: ResourceType,
    pub path: PathBuf,
}

/// Default parent for staging roots, private to the calling user
pub fn default_staging_base() -> PathBuf {
    std::env::temp_dir().join(format!(
        "jailbox-uid-{}",
        nix::unistd::geteuid().as_raw()
    ))
}

/// Releases everything recorded for one execution, in reverse creation
/// order, exactly once. Dropping an unreleased guard releases it too.
pub struct TeardownGuard {
    instance_id: String,
    entries: Vec<ResourceEntry>,
    cgroup: Option<Box<dyn CgroupBackend>>,
    released: bool,
}

impl TeardownGuard {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            entries: Vec::new(),
            cgroup: None,
            released: false,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Create `<base>/<instance_id>/root` and record both directories.
    pub fn create_staging(&mut self, base: &Path) -> Result<PathBuf> {
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(base)
            .map_err(|e| {
                JailError::Mount(format!(
                    "Failed to create staging base {}: {}",
                    base.display(),
                    e
                ))
            })?;

        let instance_dir = base.join(&self.instance_id);
        let root = instance_dir.join("root");
        for dir in [&instance_dir, &root] {
            fs::DirBuilder::new().mode(0o755).create(dir).map_err(|e| {
                JailError::Mount(format!(
                    "Failed to create staging directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
            self.record(ResourceType::TempDirectory, dir.clone());
        }
        Ok(root)
    }

    /// Take ownership of a cgroup backend; its instance cgroup is removed
    /// on release.
    pub fn track_cgroup(&mut self, backend: Box<dyn CgroupBackend>) {
        let path = backend.cgroup_path(&self.instance_id);
        self.record(ResourceType::Cgroup, path);
        self.cgroup = Some(backend);
    }

    pub fn cgroup(&self) -> Option<&dyn CgroupBackend> {
        self.cgroup.as_deref()
    }

    fn record(&mut self, resource_type: ResourceType, path: PathBuf) {
        debug!("Recording resource {:?} {}", resource_type, path.display());
        self.entries.push(ResourceEntry {
            resource_type,
            path,
        });
    }

    /// Release all recorded resources. Idempotent; returns the problems met.
    pub fn release(&mut self) -> Vec<String> {
        if self.released {
            return Vec::new();
        }
        self.released = true;

        let mut warnings = Vec::new();
        for entry in self.entries.iter().rev() {
            let result = match entry.resource_type {
                ResourceType::Cgroup => match self.cgroup.as_ref() {
                    Some(backend) => backend.remove(&self.instance_id),
                    None => Ok(()),
                },
                // Never recursive: a directory that still has content was
                // written through a bind mount and belongs to the host
                ResourceType::TempDirectory => match fs::remove_dir(&entry.path) {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                    Err(e) => Err(JailError::Io(e)),
                },
            };

            if let Err(e) = result {
                let msg = format!(
                    "Failed to clean up {:?} {}: {}",
                    entry.resource_type,
                    entry.path.display(),
                    e
                );
                warn!("{}", msg);
                warnings.push(msg);
            }
        }
        self.entries.clear();
        warnings
    }
}

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        // Warnings are already logged by release()
        let _ = self.release();
    }
}
