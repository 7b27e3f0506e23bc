// Configuration validation
// Pure checks over a builder: no filesystem access, so the same input always
// yields the same violations in the same order.

use crate::config::builder::SandboxConfigBuilder;
use crate::config::types::{
    is_contained_path, Capability, ConfigError, ConfigViolation, EnvMode, LimitValue, MountKind,
    NamespaceKind,
};
use std::path::Path;

/// Validation outcome with every violation and advisory warning
#[derive(Debug, Default)]
pub struct ValidationReport {
    pub violations: Vec<ConfigViolation>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_violation(&mut self, violation: ConfigViolation) {
        self.violations.push(violation);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn into_result(self) -> std::result::Result<Vec<String>, ConfigError> {
        if self.violations.is_empty() {
            Ok(self.warnings)
        } else {
            Err(ConfigError {
                violations: self.violations,
            })
        }
    }
}

/// Validate a builder. Check order is fixed.
pub fn validate(builder: &SandboxConfigBuilder) -> ValidationReport {
    let mut report = ValidationReport::new();

    validate_mount_namespace(builder, &mut report);
    validate_mount_table(builder, &mut report);
    validate_limits(builder, &mut report);
    validate_identity(builder, &mut report);
    validate_env(builder, &mut report);
    validate_capabilities(builder, &mut report);
    validate_paths(builder, &mut report);
    validate_network(builder, &mut report);
    validate_process(builder, &mut report);

    report
}

/// Filesystem customisation is meaningless without a private mount namespace
fn validate_mount_namespace(builder: &SandboxConfigBuilder, report: &mut ValidationReport) {
    if builder.namespaces.mount {
        return;
    }

    for mount in &builder.mounts {
        report.add_violation(ConfigViolation::MountWithoutMountNamespace {
            destination: mount.destination.clone(),
        });
    }
    for symlink in &builder.symlinks {
        report.add_violation(ConfigViolation::SymlinkWithoutMountNamespace {
            link: symlink.link.clone(),
        });
    }
    if builder.root.chroot.is_some() || builder.root.writable {
        report.add_violation(ConfigViolation::RootWithoutMountNamespace);
    }
}

fn validate_mount_table(builder: &SandboxConfigBuilder, report: &mut ValidationReport) {
    for mount in &builder.mounts {
        if !is_contained_path(&mount.destination) {
            report.add_violation(ConfigViolation::DestinationOutsideRoot {
                destination: mount.destination.clone(),
            });
        }

        match mount.kind {
            MountKind::Bind => {
                if mount.source.is_none() {
                    report.add_violation(ConfigViolation::MissingBindSource {
                        destination: mount.destination.clone(),
                    });
                }
            }
            MountKind::Typed => {
                if mount.fs_type.as_deref().map_or(true, str::is_empty) {
                    report.add_violation(ConfigViolation::MissingFilesystemType {
                        destination: mount.destination.clone(),
                    });
                }
            }
            MountKind::Tmpfs => {}
        }
    }

    for symlink in &builder.symlinks {
        if !is_contained_path(&symlink.link) {
            report.add_violation(ConfigViolation::DestinationOutsideRoot {
                destination: symlink.link.clone(),
            });
        }
    }
}

fn validate_limits(builder: &SandboxConfigBuilder, report: &mut ValidationReport) {
    let limits = &builder.limits;
    let max = libc::RLIM_INFINITY as u64;

    for (resource, value) in limits.entries() {
        if let LimitValue::Value(v) = value {
            if v >= max {
                report.add_violation(ConfigViolation::LimitOutOfRange {
                    resource,
                    value: v,
                    max: max - 1,
                });
            }
        }
    }

    if limits.wall_time_ms == Some(0) {
        report.add_violation(ConfigViolation::ZeroWallTime);
    }
    if limits.grace_period_ms == 0 {
        report.add_violation(ConfigViolation::ZeroGracePeriod);
    }

    if let Some(nice) = limits.nice_level {
        if !(-20..=19).contains(&nice) {
            report.add_violation(ConfigViolation::NiceOutOfRange(nice));
        }
    }

    if limits.max_cpus == Some(0) {
        report.add_violation(ConfigViolation::ZeroMaxCpus);
    }

    let cgroup = &limits.cgroup;
    if cgroup.memory_max == Some(0) {
        report.add_violation(ConfigViolation::CgroupLimitOutOfRange {
            name: "memory_max".to_string(),
            value: 0,
        });
    }
    if cgroup.pids_max == Some(0) {
        report.add_violation(ConfigViolation::CgroupLimitOutOfRange {
            name: "pids_max".to_string(),
            value: 0,
        });
    }
    if let Some(cpu) = cgroup.cpu_ms_per_sec {
        if !(1..=1_000_000).contains(&cpu) {
            report.add_violation(ConfigViolation::CgroupLimitOutOfRange {
                name: "cpu_ms_per_sec".to_string(),
                value: cpu as u64,
            });
        }
    }

    if let Some(LimitValue::Value(cpu_secs)) = limits.cpu_time {
        if let Some(wall_ms) = limits.wall_time_ms {
            if wall_ms < cpu_secs.saturating_mul(1000) {
                report.add_warning(format!(
                    "wall_time_ms ({}) is shorter than the CPU time limit ({}s); the wall clock will fire first",
                    wall_ms, cpu_secs
                ));
            }
        }
    }
}

fn validate_identity(builder: &SandboxConfigBuilder, report: &mut ValidationReport) {
    if builder.identity.hostname.is_some() && !builder.namespaces.uts {
        report.add_violation(ConfigViolation::HostnameWithoutUtsNamespace);
    }

    if (builder.identity.uid.is_some() || builder.identity.gid.is_some())
        && !builder.namespaces.user
    {
        report.add_warning(
            "uid/gid set without a user namespace: identity is switched on the host".to_string(),
        );
    }
}

fn validate_env(builder: &SandboxConfigBuilder, report: &mut ValidationReport) {
    let allow_list = match &builder.env.mode {
        EnvMode::AllowList(names) => names.as_slice(),
        EnvMode::InheritAll => &[],
    };
    let names = allow_list
        .iter()
        .chain(builder.env.overrides.iter().map(|(key, _)| key));

    for name in names {
        if name.is_empty() || name.contains('=') || name.contains('\0') {
            report.add_violation(ConfigViolation::InvalidEnvName { name: name.clone() });
        }
    }

    for (key, value) in &builder.env.overrides {
        if value.contains('\0') {
            report.add_violation(ConfigViolation::InvalidEnvName { name: key.clone() });
        }
    }
}

fn validate_capabilities(builder: &SandboxConfigBuilder, report: &mut ValidationReport) {
    for name in &builder.capabilities {
        if Capability::from_name(name).is_none() {
            report.add_violation(ConfigViolation::UnknownCapability { name: name.clone() });
        }
    }

    if !builder.capabilities.is_empty() && !builder.namespaces.user {
        report.add_warning(format!(
            "retaining {} capabilities without a user namespace grants them on the host",
            builder.capabilities.len()
        ));
    }
}

fn validate_paths(builder: &SandboxConfigBuilder, report: &mut ValidationReport) {
    require_absolute("working_dir", &builder.working_dir, report);

    if builder.proc_mount.enabled {
        require_absolute("proc.path", &builder.proc_mount.path, report);
    }

    if let Some(ref chroot) = builder.root.chroot {
        require_absolute("root.chroot", chroot, report);
    }
}

fn require_absolute(field: &str, path: &Path, report: &mut ValidationReport) {
    if !path.is_absolute() {
        report.add_violation(ConfigViolation::RelativePath {
            field: field.to_string(),
            path: path.to_path_buf(),
        });
    }
}

fn validate_network(builder: &SandboxConfigBuilder, report: &mut ValidationReport) {
    if let Some(ref macvlan) = builder.network.macvlan {
        if macvlan.interface.trim().is_empty() {
            report.add_violation(ConfigViolation::MacvlanWithoutInterface);
        }
    }
}

fn validate_process(builder: &SandboxConfigBuilder, report: &mut ValidationReport) {
    // stdio is always wired to the supervisor's pipes
    for &fd in builder.pass_fds.iter().filter(|fd| **fd <= 2) {
        report.add_violation(ConfigViolation::InvalidPassFd(fd));
    }
}

/// Report host facilities the engine needs but cannot find
pub fn check_system_support() -> Vec<String> {
    let mut missing = Vec::new();

    if !Path::new("/sys/fs/cgroup/cgroup.controllers").exists() {
        missing.push("cgroup v2 hierarchy not mounted at /sys/fs/cgroup".to_string());
    }

    for kind in NamespaceKind::ALL {
        let entry = Path::new("/proc/self/ns").join(kind.proc_name());
        if !entry.exists() {
            missing.push(format!("{} namespace not supported", kind));
        }
    }

    missing
}
