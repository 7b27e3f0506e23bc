//! Plan construction through the public API

use jailbox::config::types::{MacvlanSpec, MountSpec, NamespaceKind, NamespaceSet, PlanError};
use jailbox::exec::plan::{build_plan_with, PlanPhase, PlanProbe};
use jailbox::{build_plan, PlanAction, SandboxConfigBuilder};
use nix::sched::CloneFlags;
use std::path::{Path, PathBuf};

/// Every path exists and every namespace is supported
struct PermissiveProbe;

impl PlanProbe for PermissiveProbe {
    fn path_exists(&self, _path: &Path) -> bool {
        true
    }

    fn namespace_supported(&self, _kind: NamespaceKind) -> bool {
        true
    }

    fn effective_ids(&self) -> (u32, u32) {
        (1000, 100)
    }
}

fn names(actions: &[PlanAction]) -> Vec<&'static str> {
    actions
        .iter()
        .map(|a| match a {
            PlanAction::CreateNamespace { .. } => "namespace",
            PlanAction::WriteIdMaps { .. } => "id_maps",
            PlanAction::SetHostname { .. } => "hostname",
            PlanAction::BringUpLoopback => "loopback",
            PlanAction::CloneMacvlan { .. } => "macvlan",
            PlanAction::MountRoot { .. } => "root",
            PlanAction::BindMount { .. } => "bind",
            PlanAction::MountTmpfs { .. } => "tmpfs",
            PlanAction::MountFilesystem { .. } => "typed",
            PlanAction::CreateSymlink { .. } => "symlink",
            PlanAction::MountProc { .. } => "proc",
            PlanAction::SetRlimit { .. } => "rlimit",
            PlanAction::SetNice { .. } => "nice",
            PlanAction::SetCpuAffinity { .. } => "affinity",
            PlanAction::ApplyCgroupLimits { .. } => "cgroup",
            PlanAction::SetIdentity { .. } => "identity",
            PlanAction::DropCapabilities { .. } => "capabilities",
            PlanAction::LockPrivileges => "no_new_privs",
        })
        .collect()
}

#[test]
fn test_mount_phase_order() {
    let config = SandboxConfigBuilder::new()
        .symlink("/usr/bin", "/bin")
        .mount(MountSpec::typed("none", "/sys", "sysfs", None, true))
        .tmpfs("/tmp", Some("size=16m"))
        .bind_rw("/srv", "/srv")
        .bind_ro("/usr", "/usr")
        .build()
        .unwrap();
    let plan = build_plan_with(&config, &PermissiveProbe).unwrap();

    let mounts: Vec<&str> = names(plan.actions())
        .into_iter()
        .filter(|n| matches!(*n, "root" | "bind" | "tmpfs" | "typed" | "symlink" | "proc"))
        .collect();
    assert_eq!(
        mounts,
        vec!["root", "bind", "bind", "tmpfs", "typed", "symlink", "proc"]
    );
}

#[test]
fn test_privilege_reduction_is_last() {
    let config = SandboxConfigBuilder::new()
        .uid(1)
        .gid(1)
        .nice_level(5)
        .cgroup_memory_max(64 << 20)
        .retain_capability("CAP_NET_BIND_SERVICE")
        .build()
        .unwrap();
    let plan = build_plan_with(&config, &PermissiveProbe).unwrap();

    let names = names(plan.actions());
    assert_eq!(
        &names[names.len() - 3..],
        &["identity", "capabilities", "no_new_privs"]
    );
    let cgroup = names.iter().position(|n| *n == "cgroup").unwrap();
    let identity = names.iter().position(|n| *n == "identity").unwrap();
    assert!(cgroup < identity);
}

#[test]
fn test_no_new_privs_can_be_disabled() {
    let config = SandboxConfigBuilder::new()
        .no_new_privs(false)
        .build()
        .unwrap();
    let plan = build_plan_with(&config, &PermissiveProbe).unwrap();
    assert!(!plan.actions().contains(&PlanAction::LockPrivileges));
}

#[test]
fn test_host_actions_by_phase() {
    let config = SandboxConfigBuilder::new()
        .cgroup_pids_max(16)
        .macvlan(MacvlanSpec {
            interface: "eth0".to_string(),
            ip: Some("10.0.0.2".to_string()),
            netmask: None,
            gateway: None,
            mac: None,
            mode: Default::default(),
        })
        .build()
        .unwrap();
    let plan = build_plan_with(&config, &PermissiveProbe).unwrap();

    let namespaces: Vec<PlanAction> = plan.host_actions(PlanPhase::Namespaces).cloned().collect();
    assert_eq!(names(&namespaces), vec!["id_maps", "macvlan"]);
    let limits: Vec<&PlanAction> = plan.host_actions(PlanPhase::Limits).collect();
    assert_eq!(limits.len(), 1);
    assert_eq!(plan.host_actions(PlanPhase::Mounts).count(), 0);

    // Without a uid, the user namespace maps the caller onto itself
    assert!(plan.actions().contains(&PlanAction::WriteIdMaps {
        inside_uid: 1000,
        outside_uid: 1000,
        inside_gid: 100,
        outside_gid: 100,
    }));
}

#[test]
fn test_macvlan_requires_network_namespace() {
    let config = SandboxConfigBuilder::new()
        .namespace(NamespaceKind::Net, false)
        .macvlan(MacvlanSpec {
            interface: "eth0".to_string(),
            ip: None,
            netmask: None,
            gateway: None,
            mac: None,
            mode: Default::default(),
        })
        .build()
        .unwrap();
    assert_eq!(
        build_plan_with(&config, &PermissiveProbe).unwrap_err(),
        PlanError::MacvlanWithoutNetworkNamespace {
            interface: "eth0".to_string()
        }
    );
}

#[test]
fn test_shadowing_read_only_mount_rejected() {
    let config = SandboxConfigBuilder::new()
        .bind_ro("/usr", "/data")
        .bind_rw("/srv", "/data")
        .build()
        .unwrap();
    assert_eq!(
        build_plan_with(&config, &PermissiveProbe).unwrap_err(),
        PlanError::WidensReadOnlyMount {
            destination: PathBuf::from("/data")
        }
    );
}

#[test]
fn test_missing_chroot_on_host() {
    let config = SandboxConfigBuilder::new()
        .chroot("/nonexistent/jailbox-root")
        .build()
        .unwrap();
    let result = build_plan(&config);
    assert!(matches!(
        result,
        Err(PlanError::MissingChroot(_)) | Err(PlanError::NamespaceUnsupported(_))
    ));
}

#[test]
fn test_clone_flags_exclude_time() {
    let config = SandboxConfigBuilder::new()
        .namespaces(NamespaceSet::none())
        .namespace(NamespaceKind::Pid, true)
        .namespace(NamespaceKind::Time, true)
        .build()
        .unwrap();
    let plan = build_plan_with(&config, &PermissiveProbe).unwrap();

    assert!(plan.has_namespace(NamespaceKind::Time));
    assert_eq!(plan.clone_flags(), CloneFlags::CLONE_NEWPID);
}

#[test]
fn test_fingerprint_tracks_plan_content() {
    let base = SandboxConfigBuilder::new().tmpfs("/tmp", None);
    let a = build_plan_with(&base.clone().build().unwrap(), &PermissiveProbe).unwrap();
    let b = build_plan_with(&base.clone().build().unwrap(), &PermissiveProbe).unwrap();
    let c = build_plan_with(
        &base.tmpfs("/run", None).build().unwrap(),
        &PermissiveProbe,
    )
    .unwrap();

    assert_eq!(a.fingerprint(), b.fingerprint());
    assert_ne!(a.fingerprint(), c.fingerprint());
}

#[test]
fn test_dangling_symlink_source_is_missing() {
    let dir = std::env::temp_dir().join(format!("jailbox-dangling-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let link = dir.join("source");
    let _ = std::fs::remove_file(&link);
    std::os::unix::fs::symlink("/nonexistent/jailbox-target", &link).unwrap();

    let config = SandboxConfigBuilder::new()
        .namespaces(NamespaceSet::none())
        .namespace(NamespaceKind::Mount, true)
        .bind_ro(&link, "/data")
        .build()
        .unwrap();
    let result = build_plan(&config);
    let _ = std::fs::remove_dir_all(&dir);

    assert_eq!(
        result.unwrap_err(),
        PlanError::MissingMountSource {
            path: link,
            destination: PathBuf::from("/data")
        }
    );
}

#[test]
fn test_read_only_tmpfs_reaches_the_plan() {
    let config = SandboxConfigBuilder::new()
        .mount(MountSpec {
            read_only: true,
            ..MountSpec::tmpfs("/scratch", Some("size=1m"))
        })
        .build()
        .unwrap();
    let plan = build_plan_with(&config, &PermissiveProbe).unwrap();
    assert!(plan.actions().iter().any(|a| matches!(
        a,
        PlanAction::MountTmpfs { read_only: true, .. }
    )));
}
