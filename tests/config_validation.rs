//! Validation through the public builder and JSON loader

use jailbox::config::loader::parse_builder;
use jailbox::config::types::{ConfigViolation, LimitResource, LimitValue, NamespaceKind};
use jailbox::SandboxConfigBuilder;
use std::time::Duration;

#[test]
fn test_every_violation_is_reported_in_order() {
    let builder = SandboxConfigBuilder::new()
        .namespace(NamespaceKind::Mount, false)
        .namespace(NamespaceKind::Uts, false)
        .bind_ro("/usr", "/usr")
        .hostname("jail")
        .retain_capability("CAP_NOT_REAL")
        .working_dir("relative/dir");

    let err = builder.clone().build().unwrap_err();
    assert!(matches!(
        err.violations.as_slice(),
        [
            ConfigViolation::MountWithoutMountNamespace { .. },
            ConfigViolation::HostnameWithoutUtsNamespace,
            ConfigViolation::UnknownCapability { .. },
            ConfigViolation::RelativePath { .. },
        ]
    ));

    // Pure: validating again gives the same answer
    let again = builder.build().unwrap_err();
    assert_eq!(err, again);
}

#[test]
fn test_limit_ranges() {
    let err = SandboxConfigBuilder::new()
        .limit(LimitResource::FileSize, LimitValue::Value(libc::RLIM_INFINITY))
        .build()
        .unwrap_err();
    assert!(matches!(
        err.violations.as_slice(),
        [ConfigViolation::LimitOutOfRange {
            resource: LimitResource::FileSize,
            ..
        }]
    ));

    assert!(SandboxConfigBuilder::new()
        .limit(LimitResource::FileSize, LimitValue::Unbounded)
        .limit(LimitResource::CpuTime, LimitValue::Value(0))
        .build()
        .is_ok());
}

#[test]
fn test_zero_wall_time_rejected() {
    let err = SandboxConfigBuilder::new()
        .wall_time(Duration::ZERO)
        .build()
        .unwrap_err();
    assert_eq!(err.violations, vec![ConfigViolation::ZeroWallTime]);
}

#[test]
fn test_escaping_destination_rejected() {
    let err = SandboxConfigBuilder::new()
        .tmpfs("/tmp/../../etc", None)
        .build()
        .unwrap_err();
    assert!(matches!(
        err.violations.as_slice(),
        [ConfigViolation::DestinationOutsideRoot { .. }]
    ));
}

#[test]
fn test_json_document_builds() {
    let builder = parse_builder(
        r#"{
            "namespaces": {"net": false, "time": true},
            "limits": {"wall_time_ms": 1500, "processes": "unbounded"},
            "identity": {"hostname": "box"}
        }"#,
    )
    .unwrap();
    let config = builder.build().unwrap();

    assert!(config.namespaces().time);
    assert!(!config.namespaces().net);
    assert_eq!(config.limits().wall_time(), Some(Duration::from_millis(1500)));
    assert_eq!(config.limits().processes, Some(LimitValue::Unbounded));
    assert_eq!(config.identity().hostname.as_deref(), Some("box"));
}

#[test]
fn test_error_message_lists_problems() {
    let err = SandboxConfigBuilder::new()
        .wall_time(Duration::ZERO)
        .grace_period(Duration::ZERO)
        .build()
        .unwrap_err();
    let message = err.to_string();
    assert!(message.contains("2 problems"));
    assert!(message.contains("wall_time_ms cannot be zero"));
    assert!(message.contains("grace_period_ms cannot be zero"));
}
