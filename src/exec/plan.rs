//! Environment planning
//!
//! Turns a validated [`SandboxConfig`] into an ordered list of setup actions.
//! Planning only reads filesystem metadata; executing the plan is the
//! supervisor's job.

use crate::config::builder::SandboxConfig;
use crate::config::types::{
    Capability, CgroupLimits, LimitResource, LimitValue, MacvlanSpec, MountKind, NamespaceKind,
    PlanError,
};
use nix::sched::CloneFlags;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Setup phases, in execution order
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PlanPhase {
    Namespaces,
    Root,
    Mounts,
    Proc,
    Limits,
    Identity,
}

/// Which side of the launch handshake performs an action
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionSide {
    /// Supervisor, acting on the child from outside
    Host,
    /// The child itself, before exec
    Sandbox,
}

/// One setup step
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PlanAction {
    CreateNamespace {
        kind: NamespaceKind,
    },
    /// uid_map/gid_map for the new user namespace
    WriteIdMaps {
        inside_uid: u32,
        outside_uid: u32,
        inside_gid: u32,
        outside_gid: u32,
    },
    SetHostname {
        hostname: String,
    },
    BringUpLoopback,
    CloneMacvlan {
        spec: MacvlanSpec,
    },
    MountRoot {
        source: Option<PathBuf>,
        writable: bool,
        pivot: bool,
    },
    BindMount {
        source: PathBuf,
        destination: PathBuf,
        read_only: bool,
    },
    MountTmpfs {
        destination: PathBuf,
        options: Option<String>,
        read_only: bool,
    },
    MountFilesystem {
        source: Option<PathBuf>,
        destination: PathBuf,
        fs_type: String,
        options: Option<String>,
        read_only: bool,
    },
    CreateSymlink {
        target: PathBuf,
        link: PathBuf,
    },
    MountProc {
        path: PathBuf,
        read_write: bool,
    },
    SetRlimit {
        resource: LimitResource,
        value: LimitValue,
    },
    SetNice {
        level: i32,
    },
    /// Keep only the first `max_cpus` CPUs of the inherited affinity mask
    SetCpuAffinity {
        max_cpus: u32,
    },
    ApplyCgroupLimits {
        limits: CgroupLimits,
    },
    SetIdentity {
        uid: Option<u32>,
        gid: Option<u32>,
    },
    DropCapabilities {
        retain: Vec<Capability>,
    },
    /// PR_SET_NO_NEW_PRIVS
    LockPrivileges,
}

impl PlanAction {
    pub fn phase(&self) -> PlanPhase {
        match self {
            PlanAction::CreateNamespace { .. }
            | PlanAction::WriteIdMaps { .. }
            | PlanAction::SetHostname { .. }
            | PlanAction::BringUpLoopback
            | PlanAction::CloneMacvlan { .. } => PlanPhase::Namespaces,
            PlanAction::MountRoot { .. } => PlanPhase::Root,
            PlanAction::BindMount { .. }
            | PlanAction::MountTmpfs { .. }
            | PlanAction::MountFilesystem { .. }
            | PlanAction::CreateSymlink { .. } => PlanPhase::Mounts,
            PlanAction::MountProc { .. } => PlanPhase::Proc,
            PlanAction::SetRlimit { .. }
            | PlanAction::SetNice { .. }
            | PlanAction::SetCpuAffinity { .. }
            | PlanAction::ApplyCgroupLimits { .. } => PlanPhase::Limits,
            PlanAction::SetIdentity { .. }
            | PlanAction::DropCapabilities { .. }
            | PlanAction::LockPrivileges => PlanPhase::Identity,
        }
    }

    pub fn side(&self) -> ActionSide {
        match self {
            PlanAction::WriteIdMaps { .. }
            | PlanAction::CloneMacvlan { .. }
            | PlanAction::ApplyCgroupLimits { .. } => ActionSide::Host,
            _ => ActionSide::Sandbox,
        }
    }
}

/// Ordered setup actions for one execution. Consumed by the supervisor.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct EnvironmentPlan {
    actions: Vec<PlanAction>,
}

impl EnvironmentPlan {
    pub fn actions(&self) -> &[PlanAction] {
        &self.actions
    }

    pub fn into_actions(self) -> Vec<PlanAction> {
        self.actions
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Namespaces requested at process creation
    pub fn namespaces(&self) -> Vec<NamespaceKind> {
        self.actions
            .iter()
            .filter_map(|action| match action {
                PlanAction::CreateNamespace { kind } => Some(*kind),
                _ => None,
            })
            .collect()
    }

    pub fn has_namespace(&self, kind: NamespaceKind) -> bool {
        self.namespaces().contains(&kind)
    }

    /// clone(2) flags for the namespaces that can be created at clone time.
    /// The time namespace only takes effect through unshare, so it is not
    /// part of this set.
    pub fn clone_flags(&self) -> CloneFlags {
        self.namespaces()
            .into_iter()
            .fold(CloneFlags::empty(), |flags, kind| {
                flags
                    | match kind {
                        NamespaceKind::User => CloneFlags::CLONE_NEWUSER,
                        NamespaceKind::Mount => CloneFlags::CLONE_NEWNS,
                        NamespaceKind::Pid => CloneFlags::CLONE_NEWPID,
                        NamespaceKind::Ipc => CloneFlags::CLONE_NEWIPC,
                        NamespaceKind::Uts => CloneFlags::CLONE_NEWUTS,
                        NamespaceKind::Net => CloneFlags::CLONE_NEWNET,
                        NamespaceKind::Cgroup => CloneFlags::CLONE_NEWCGROUP,
                        NamespaceKind::Time => CloneFlags::empty(),
                    }
            })
    }

    /// Actions carried out by the supervisor for a given phase
    pub fn host_actions(&self, phase: PlanPhase) -> impl Iterator<Item = &PlanAction> {
        self.actions
            .iter()
            .filter(move |a| a.phase() == phase && a.side() == ActionSide::Host)
    }

    /// SHA-256 over the serialized action list, hex encoded
    pub fn fingerprint(&self) -> String {
        let encoded = serde_json::to_vec(&self.actions).unwrap_or_default();
        let digest = Sha256::digest(&encoded);
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

/// Compute the environment plan for a configuration.
pub fn build_plan(config: &SandboxConfig) -> Result<EnvironmentPlan, PlanError> {
    build_plan_with(config, &HostProbe)
}

/// Read-only view of the host used while planning
pub trait PlanProbe {
    fn path_exists(&self, path: &Path) -> bool;
    fn namespace_supported(&self, kind: NamespaceKind) -> bool;
    fn effective_ids(&self) -> (u32, u32);
}

/// Probe backed by the running host
pub struct HostProbe;

impl PlanProbe for HostProbe {
    /// Follows symlinks: a dangling link is a missing source.
    fn path_exists(&self, path: &Path) -> bool {
        std::fs::metadata(path).is_ok()
    }

    fn namespace_supported(&self, kind: NamespaceKind) -> bool {
        Path::new("/proc/self/ns").join(kind.proc_name()).exists()
    }

    fn effective_ids(&self) -> (u32, u32) {
        (
            nix::unistd::geteuid().as_raw(),
            nix::unistd::getegid().as_raw(),
        )
    }
}

pub fn build_plan_with(
    config: &SandboxConfig,
    probe: &dyn PlanProbe,
) -> Result<EnvironmentPlan, PlanError> {
    let mut actions = Vec::new();
    let namespaces = config.namespaces();

    // Namespaces
    for kind in namespaces.enabled() {
        if !probe.namespace_supported(kind) {
            return Err(PlanError::NamespaceUnsupported(kind));
        }
        actions.push(PlanAction::CreateNamespace { kind });
    }

    let identity = config.identity();
    if namespaces.user {
        let (outside_uid, outside_gid) = probe.effective_ids();
        actions.push(PlanAction::WriteIdMaps {
            inside_uid: identity.uid.unwrap_or(outside_uid),
            outside_uid,
            inside_gid: identity.gid.unwrap_or(outside_gid),
            outside_gid,
        });
    }

    if let Some(ref hostname) = identity.hostname {
        actions.push(PlanAction::SetHostname {
            hostname: hostname.clone(),
        });
    }

    let network = config.network();
    if let Some(ref macvlan) = network.macvlan {
        if !namespaces.net {
            return Err(PlanError::MacvlanWithoutNetworkNamespace {
                interface: macvlan.interface.clone(),
            });
        }
    }
    if namespaces.net {
        if network.loopback {
            actions.push(PlanAction::BringUpLoopback);
        }
        if let Some(ref macvlan) = network.macvlan {
            actions.push(PlanAction::CloneMacvlan {
                spec: macvlan.clone(),
            });
        }
    }

    // Root, mounts and proc need a private mount namespace
    if namespaces.mount {
        let root = config.root();
        if let Some(ref chroot) = root.chroot {
            if !probe.path_exists(chroot) {
                return Err(PlanError::MissingChroot(chroot.clone()));
            }
        }
        actions.push(PlanAction::MountRoot {
            source: root.chroot.clone(),
            writable: root.writable,
            pivot: !root.no_pivot_root,
        });

        plan_mounts(config, probe, &mut actions)?;

        let proc_spec = config.proc_mount();
        if proc_spec.enabled {
            actions.push(PlanAction::MountProc {
                path: proc_spec.path.clone(),
                read_write: proc_spec.read_write,
            });
        }
    } else if config.proc_mount().enabled {
        log::info!("mount namespace disabled; the host proc filesystem stays visible");
    }

    // Limits
    let limits = config.limits();
    for (resource, value) in limits.entries() {
        actions.push(PlanAction::SetRlimit { resource, value });
    }
    if let Some(level) = limits.nice_level {
        actions.push(PlanAction::SetNice { level });
    }
    if let Some(max_cpus) = limits.max_cpus {
        actions.push(PlanAction::SetCpuAffinity { max_cpus });
    }
    if !limits.cgroup.is_empty() {
        actions.push(PlanAction::ApplyCgroupLimits {
            limits: limits.cgroup.clone(),
        });
    }

    // Identity, always last
    if namespaces.user || identity.uid.is_some() || identity.gid.is_some() {
        let (outside_uid, outside_gid) = probe.effective_ids();
        let (uid, gid) = if namespaces.user {
            (
                Some(identity.uid.unwrap_or(outside_uid)),
                Some(identity.gid.unwrap_or(outside_gid)),
            )
        } else {
            (identity.uid, identity.gid)
        };
        actions.push(PlanAction::SetIdentity { uid, gid });
    }
    actions.push(PlanAction::DropCapabilities {
        retain: config.capabilities().to_vec(),
    });
    if config.no_new_privs() {
        actions.push(PlanAction::LockPrivileges);
    }

    Ok(EnvironmentPlan { actions })
}

fn plan_mounts(
    config: &SandboxConfig,
    probe: &dyn PlanProbe,
    actions: &mut Vec<PlanAction>,
) -> Result<(), PlanError> {
    let mounts = config.mounts();

    for mount in mounts.iter().filter(|m| m.kind == MountKind::Bind) {
        if let Some(ref source) = mount.source {
            if !probe.path_exists(source) {
                return Err(PlanError::MissingMountSource {
                    path: source.clone(),
                    destination: mount.destination.clone(),
                });
            }
        }
    }

    let read_only_destinations: HashSet<&Path> = mounts
        .iter()
        .filter(|m| m.read_only)
        .map(|m| m.destination.as_path())
        .collect();
    if let Some(shadow) = mounts
        .iter()
        .find(|m| !m.read_only && read_only_destinations.contains(m.destination.as_path()))
    {
        return Err(PlanError::WidensReadOnlyMount {
            destination: shadow.destination.clone(),
        });
    }

    let read_only_binds = mounts
        .iter()
        .filter(|m| m.kind == MountKind::Bind && m.read_only);
    let read_write_binds = mounts
        .iter()
        .filter(|m| m.kind == MountKind::Bind && !m.read_only);

    for mount in read_only_binds.chain(read_write_binds) {
        if let Some(ref source) = mount.source {
            actions.push(PlanAction::BindMount {
                source: source.clone(),
                destination: mount.destination.clone(),
                read_only: mount.read_only,
            });
        }
    }

    for mount in mounts.iter().filter(|m| m.kind == MountKind::Tmpfs) {
        actions.push(PlanAction::MountTmpfs {
            destination: mount.destination.clone(),
            options: mount.options.clone(),
            read_only: mount.read_only,
        });
    }

    for mount in mounts.iter().filter(|m| m.kind == MountKind::Typed) {
        actions.push(PlanAction::MountFilesystem {
            source: mount.source.clone(),
            destination: mount.destination.clone(),
            fs_type: mount.fs_type.clone().unwrap_or_default(),
            options: mount.options.clone(),
            read_only: mount.read_only,
        });
    }

    for symlink in config.symlinks() {
        actions.push(PlanAction::CreateSymlink {
            target: symlink.target.clone(),
            link: symlink.link.clone(),
        });
    }

    Ok(())
}
