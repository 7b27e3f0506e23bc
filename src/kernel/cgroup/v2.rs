/// Cgroup v2 backend implementation
use crate::config::types::{CgroupLimits, JailError, Result};
use crate::kernel::cgroup::backend::{CgroupBackend, CgroupBreach};
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

const CPU_PERIOD_USEC: u64 = 1_000_000;
const CONTROLLERS: [&str; 3] = ["memory", "pids", "cpu"];

pub struct CgroupV2 {
    base_path: PathBuf,
    strict_mode: bool,
}

impl CgroupV2 {
    pub fn new(base_path: PathBuf, strict_mode: bool) -> Self {
        CgroupV2 {
            base_path,
            strict_mode,
        }
    }

    fn instance_path(&self, instance_id: &str) -> PathBuf {
        self.base_path.join(instance_id)
    }

    fn write_control(&self, instance_id: &str, file: &str, value: &str) -> Result<()> {
        let path = self.instance_path(instance_id).join(file);
        fs::write(&path, value).map_err(|e| {
            JailError::Cgroup(format!("Failed to write {} to {}: {}", value, path.display(), e))
        })?;
        log::debug!("cgroup {}: {} = {}", instance_id, file, value);
        Ok(())
    }

    /// Enable the controllers we need for children of the base cgroup
    fn enable_controllers(&self) -> Result<()> {
        let control = self.base_path.join("cgroup.subtree_control");
        for controller in CONTROLLERS {
            if let Err(e) = fs::write(&control, format!("+{}", controller)) {
                let msg = format!(
                    "Failed to enable {} controller in {}: {}",
                    controller,
                    self.base_path.display(),
                    e
                );
                if self.strict_mode {
                    return Err(JailError::Cgroup(msg));
                }
                log::warn!("{} (permissive mode)", msg);
            }
        }
        Ok(())
    }
}

/// Value of `key` in a flat-keyed cgroup file such as memory.events
fn read_event_counter(path: &Path, key: &str) -> Result<u64> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => {
            return Err(JailError::Cgroup(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            )))
        }
    };

    Ok(content
        .lines()
        .filter_map(|line| line.split_once(' '))
        .find(|(name, _)| *name == key)
        .and_then(|(_, value)| value.trim().parse::<u64>().ok())
        .unwrap_or(0))
}

impl CgroupBackend for CgroupV2 {
    fn backend_name(&self) -> &str {
        "cgroup_v2"
    }

    fn create(&self, instance_id: &str) -> Result<()> {
        fs::create_dir_all(&self.base_path).map_err(|e| {
            JailError::Cgroup(format!(
                "Failed to create cgroup root {}: {}",
                self.base_path.display(),
                e
            ))
        })?;
        self.enable_controllers()?;

        let path = self.instance_path(instance_id);
        fs::create_dir_all(&path)
            .map_err(|e| JailError::Cgroup(format!("Failed to create cgroup: {}", e)))?;

        // Kill the whole group on OOM rather than one victim
        let oom_group_path = path.join("memory.oom.group");
        if oom_group_path.exists() {
            if let Err(e) = fs::write(&oom_group_path, "1") {
                if self.strict_mode {
                    return Err(JailError::Cgroup(format!(
                        "Failed to set memory.oom.group: {}",
                        e
                    )));
                }
                log::warn!("Failed to set memory.oom.group (permissive mode): {}", e);
            }
        }

        log::debug!("Created cgroup {}", path.display());
        Ok(())
    }

    fn attach_process(&self, instance_id: &str, pid: u32) -> Result<()> {
        self.write_control(instance_id, "cgroup.procs", &pid.to_string())
    }

    fn apply_limits(&self, instance_id: &str, limits: &CgroupLimits) -> Result<()> {
        if let Some(bytes) = limits.memory_max {
            self.write_control(instance_id, "memory.max", &bytes.to_string())?;
        }
        match (limits.memory_swap_max, limits.memory_max) {
            (Some(swap), _) => {
                self.write_control(instance_id, "memory.swap.max", &swap.to_string())?
            }
            // Without this, memory.max is bypassed through swap
            (None, Some(_)) => {
                if let Err(e) = self.write_control(instance_id, "memory.swap.max", "0") {
                    log::debug!("memory.swap.max not set: {}", e);
                }
            }
            (None, None) => {}
        }
        if let Some(pids) = limits.pids_max {
            self.write_control(instance_id, "pids.max", &pids.to_string())?;
        }
        if let Some(ms) = limits.cpu_ms_per_sec {
            let quota = ms as u64 * 1000;
            self.write_control(
                instance_id,
                "cpu.max",
                &format!("{} {}", quota, CPU_PERIOD_USEC),
            )?;
        }
        Ok(())
    }

    fn breach(&self, instance_id: &str) -> Result<Option<CgroupBreach>> {
        let path = self.instance_path(instance_id);
        if read_event_counter(&path.join("memory.events"), "oom_kill")? > 0 {
            return Ok(Some(CgroupBreach::Memory));
        }
        if read_event_counter(&path.join("pids.events"), "max")? > 0 {
            return Ok(Some(CgroupBreach::Processes));
        }
        Ok(None)
    }

    fn cgroup_path(&self, instance_id: &str) -> PathBuf {
        self.instance_path(instance_id)
    }

    fn remove(&self, instance_id: &str) -> Result<()> {
        let path = self.instance_path(instance_id);
        if !path.exists() {
            return Ok(());
        }

        // cgroup.kill exists from 5.14; older kernels rely on the group kill
        let kill = path.join("cgroup.kill");
        if kill.exists() {
            let _ = fs::write(&kill, "1");
        }

        // rmdir fails with EBUSY until the last member has been reaped
        let mut last_err = None;
        for _ in 0..50 {
            match fs::remove_dir(&path) {
                Ok(()) => {
                    log::debug!("Removed cgroup {}", path.display());
                    return Ok(());
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(e) => {
                    last_err = Some(e);
                    thread::sleep(Duration::from_millis(10));
                }
            }
        }

        Err(JailError::Cgroup(format!(
            "Failed to remove cgroup {}: {}",
            path.display(),
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("jailbox-cg-{}-{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn test_instance_path() {
        let cgroup = CgroupV2::new(PathBuf::from("/tmp/test_cgroup_v2"), false);
        let path = cgroup.instance_path("test_instance");
        assert_eq!(path, PathBuf::from("/tmp/test_cgroup_v2/test_instance"));
    }

    #[test]
    fn test_limits_written_as_control_values() {
        let root = scratch("limits");
        let cgroup = CgroupV2::new(root.clone(), false);
        cgroup.create("run1").unwrap();
        cgroup
            .apply_limits(
                "run1",
                &CgroupLimits {
                    memory_max: Some(64 << 20),
                    pids_max: Some(16),
                    cpu_ms_per_sec: Some(250),
                    memory_swap_max: None,
                },
            )
            .unwrap();

        let dir = root.join("run1");
        assert_eq!(fs::read_to_string(dir.join("memory.max")).unwrap(), "67108864");
        assert_eq!(fs::read_to_string(dir.join("memory.swap.max")).unwrap(), "0");
        assert_eq!(fs::read_to_string(dir.join("pids.max")).unwrap(), "16");
        assert_eq!(fs::read_to_string(dir.join("cpu.max")).unwrap(), "250000 1000000");
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_configured_swap_ceiling_is_written() {
        let root = scratch("swap");
        let cgroup = CgroupV2::new(root.clone(), false);
        cgroup.create("run3").unwrap();
        cgroup
            .apply_limits(
                "run3",
                &CgroupLimits {
                    memory_max: Some(32 << 20),
                    memory_swap_max: Some(16 << 20),
                    ..CgroupLimits::default()
                },
            )
            .unwrap();

        let dir = root.join("run3");
        assert_eq!(fs::read_to_string(dir.join("memory.swap.max")).unwrap(), "16777216");
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_breach_detection_from_event_files() {
        let root = scratch("breach");
        let cgroup = CgroupV2::new(root.clone(), false);
        cgroup.create("run2").unwrap();
        let dir = root.join("run2");

        assert_eq!(cgroup.breach("run2").unwrap(), None);

        fs::write(dir.join("pids.events"), "max 3\n").unwrap();
        assert_eq!(cgroup.breach("run2").unwrap(), Some(CgroupBreach::Processes));

        fs::write(
            dir.join("memory.events"),
            "low 0\nhigh 0\nmax 4\noom 1\noom_kill 1\n",
        )
        .unwrap();
        assert_eq!(cgroup.breach("run2").unwrap(), Some(CgroupBreach::Memory));
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_remove_missing_cgroup_is_ok() {
        let cgroup = CgroupV2::new(scratch("missing"), true);
        assert!(cgroup.remove("never-created").is_ok());
    }
}
