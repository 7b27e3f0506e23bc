//! End-to-end supervision scenarios.
//!
//! Most scenarios disable every namespace so they run unprivileged; the
//! mount isolation scenario returns early unless running as root.

use jailbox::config::types::{LimitResource, LimitValue, NamespaceKind, NamespaceSet};
use jailbox::core::types::{LimitKind, OutputIntegrity};
use jailbox::observability::MemorySink;
use jailbox::verdict::reporter::{EXIT_KILLED, EXIT_LIMIT_EXCEEDED, EXIT_TIMED_OUT};
use jailbox::{
    build_plan, execute, CancellationToken, JailError, PlanError, ProcessSupervisor,
    ResultReporter, SandboxCommand, SandboxConfig, SandboxConfigBuilder, TerminationCause,
};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn unprivileged() -> SandboxConfigBuilder {
    SandboxConfigBuilder::new()
        .namespaces(NamespaceSet::none())
        .allow_env("PATH")
}

fn config(builder: SandboxConfigBuilder) -> SandboxConfig {
    builder.build().unwrap()
}

fn sh(script: &str) -> SandboxCommand {
    SandboxCommand::new(["sh", "-c", script])
}

#[test]
fn test_true_completes_with_zero() {
    let result = execute(
        &config(unprivileged()),
        &SandboxCommand::new(["true"]),
        &CancellationToken::new(),
    )
    .unwrap();

    assert_eq!(result.cause, TerminationCause::NaturalExit);
    assert_eq!(result.exit_code, Some(0));
    assert!(result.duration_ms.is_some());
    assert!(result.started_at.is_some());
    assert!(result.succeeded());
    assert_eq!(result.plan_fingerprint.len(), 64);
}

#[test]
fn test_exit_code_and_output_pass_through() {
    let result = execute(
        &config(unprivileged()),
        &sh("echo out; echo err >&2; exit 3"),
        &CancellationToken::new(),
    )
    .unwrap();

    assert_eq!(result.cause, TerminationCause::NaturalExit);
    assert_eq!(result.exit_code, Some(3));
    assert_eq!(result.stdout, "out\n");
    assert_eq!(result.stderr, "err\n");
    assert_eq!(result.stdout_integrity, OutputIntegrity::Complete);
}

#[test]
fn test_stdin_is_delivered() {
    let result = execute(
        &config(unprivileged()),
        &SandboxCommand::new(["cat"]).with_stdin("hello sandbox"),
        &CancellationToken::new(),
    )
    .unwrap();
    assert_eq!(result.stdout, "hello sandbox");
}

#[test]
fn test_wall_time_limit_times_out() {
    let started = Instant::now();
    let result = execute(
        &config(unprivileged().wall_time(Duration::from_secs(1))),
        &SandboxCommand::new(["sleep", "10"]),
        &CancellationToken::new(),
    )
    .unwrap();

    assert_eq!(result.cause, TerminationCause::TimedOut);
    assert_eq!(result.exit_code, Some(EXIT_TIMED_OUT));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(result.duration_ms.unwrap() >= 1000);
}

#[test]
fn test_cancel_before_start_is_spawn_failure() {
    let token = CancellationToken::new();
    token.cancel();

    let result = execute(
        &config(unprivileged()),
        &SandboxCommand::new(["true"]),
        &token,
    )
    .unwrap();

    assert_eq!(result.cause, TerminationCause::SpawnFailed);
    assert_eq!(result.exit_code, None);
    assert_eq!(result.duration_ms, None);
    assert!(result.spawn_error.unwrap().contains("cancelled"));
}

#[test]
fn test_cancel_while_running_kills() {
    let token = CancellationToken::new();
    let canceller = token.clone();
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(300));
        canceller.cancel();
    });

    let started = Instant::now();
    let result = execute(
        &config(unprivileged()),
        &SandboxCommand::new(["sleep", "10"]),
        &token,
    )
    .unwrap();
    handle.join().unwrap();

    assert_eq!(result.cause, TerminationCause::Killed);
    assert_eq!(result.exit_code, Some(EXIT_KILLED));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn test_missing_binary_is_spawn_failure() {
    let result = execute(
        &config(unprivileged()),
        &SandboxCommand::new(["/nonexistent/jailbox-payload"]),
        &CancellationToken::new(),
    )
    .unwrap();

    assert_eq!(result.cause, TerminationCause::SpawnFailed);
    assert_eq!(result.exit_code, None);
    assert!(result.spawn_error.unwrap().contains("execvpe"));
}

#[test]
fn test_output_past_limit_is_truncated() {
    let result = execute(
        &config(unprivileged()),
        &sh("i=0; while [ $i -lt 2000 ]; do echo 0123456789; i=$((i+1)); done")
            .with_output_limit(100),
        &CancellationToken::new(),
    )
    .unwrap();

    assert_eq!(result.cause, TerminationCause::NaturalExit);
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.stdout.len(), 100);
    assert_eq!(result.stdout_integrity, OutputIntegrity::Truncated);
}

#[test]
fn test_environment_is_filtered() {
    let result = execute(
        &config(unprivileged().env("JAILBOX_GREETING", "hi")),
        &SandboxCommand::new(["env"]),
        &CancellationToken::new(),
    )
    .unwrap();

    assert_eq!(result.cause, TerminationCause::NaturalExit);
    let names: Vec<&str> = result
        .stdout
        .lines()
        .filter_map(|line| line.split('=').next())
        .collect();
    assert!(names.contains(&"JAILBOX_GREETING"), "{:?}", names);
    assert!(
        names.iter().all(|n| *n == "PATH" || *n == "JAILBOX_GREETING"),
        "{:?}",
        names
    );
}

#[test]
fn test_lifecycle_events_are_emitted() {
    let sink = Arc::new(MemorySink::new());
    let supervisor = ProcessSupervisor::new().with_sink(sink.clone());
    let config = config(unprivileged());
    let plan = build_plan(&config).unwrap();

    let outcome = supervisor.run(
        &config,
        plan,
        &SandboxCommand::new(["true"]),
        &CancellationToken::new(),
    );
    let instance_id = outcome.instance_id.clone();
    let result = ResultReporter::report(outcome);
    assert_eq!(result.cause, TerminationCause::NaturalExit);

    assert_eq!(
        sink.transitions(&instance_id),
        vec![
            ("preparing".to_string(), "running".to_string()),
            ("running".to_string(), "completed".to_string()),
        ]
    );
}

#[test]
fn test_concurrent_executions_are_independent() {
    let config = Arc::new(config(unprivileged()));
    let handles: Vec<_> = (0..4)
        .map(|i| {
            let config = config.clone();
            thread::spawn(move || {
                execute(
                    &config,
                    &sh(&format!("echo {}; exit {}", i, i)),
                    &CancellationToken::new(),
                )
                .unwrap()
            })
        })
        .collect();

    for (i, handle) in handles.into_iter().enumerate() {
        let result = handle.join().unwrap();
        assert_eq!(result.exit_code, Some(i as i32));
        assert_eq!(result.stdout, format!("{}\n", i));
    }
}

#[test]
fn test_concurrent_mounts_are_isolated() {
    if !nix::unistd::geteuid().is_root() {
        return;
    }

    let mut builder = SandboxConfigBuilder::new()
        .namespaces(NamespaceSet::none())
        .namespace(NamespaceKind::Mount, true)
        .namespace(NamespaceKind::Pid, true)
        .allow_env("PATH")
        .tmpfs("/tmp", None);
    for dir in ["/bin", "/usr", "/lib", "/lib64"] {
        if Path::new(dir).exists() {
            builder = builder.bind_ro(dir, dir);
        }
    }
    let config = Arc::new(builder.build().unwrap());

    let handles: Vec<_> = (0..2)
        .map(|i| {
            let config = config.clone();
            thread::spawn(move || {
                execute(
                    &config,
                    &sh(&format!("echo {} > /tmp/marker && ls /tmp", i)),
                    &CancellationToken::new(),
                )
                .unwrap()
            })
        })
        .collect();

    for handle in handles {
        let result = handle.join().unwrap();
        assert_eq!(result.cause, TerminationCause::NaturalExit, "{:?}", result);
        assert_eq!(result.stdout, "marker\n");
        assert!(result.cleanup_warnings.is_empty(), "{:?}", result.cleanup_warnings);
    }
    assert!(!Path::new("/tmp/marker").exists());
}

#[test]
fn test_cpu_rlimit_is_limit_exceeded() {
    let started = Instant::now();
    let result = execute(
        &config(
            unprivileged()
                .limit(LimitResource::CpuTime, LimitValue::Value(1))
                .limit(LimitResource::Core, LimitValue::Value(0))
                .wall_time(Duration::from_secs(10)),
        ),
        &sh("while :; do :; done"),
        &CancellationToken::new(),
    )
    .unwrap();

    assert_eq!(result.cause, TerminationCause::LimitExceeded, "{:?}", result);
    assert_eq!(result.limit_triggered, Some(LimitKind::CpuTime));
    assert_eq!(result.exit_code, Some(EXIT_LIMIT_EXCEEDED));
    assert!(started.elapsed() < Duration::from_secs(8));
}

#[test]
fn test_missing_bind_source_fails_before_spawn() {
    let config = config(
        SandboxConfigBuilder::new()
            .namespaces(NamespaceSet::none())
            .namespace(NamespaceKind::Mount, true)
            .bind_ro("/nonexistent/jailbox-source", "/data"),
    );

    let err = execute(
        &config,
        &SandboxCommand::new(["true"]),
        &CancellationToken::new(),
    )
    .unwrap_err();
    match err {
        JailError::Plan(PlanError::MissingMountSource { path, destination }) => {
            assert_eq!(path, PathBuf::from("/nonexistent/jailbox-source"));
            assert_eq!(destination, PathBuf::from("/data"));
        }
        other => panic!("expected a missing mount source, got {:?}", other),
    }
}

#[test]
fn test_exit_at_the_deadline_is_timed_out() {
    let result = execute(
        &config(unprivileged().wall_time(Duration::from_secs(1))),
        &SandboxCommand::new(["sleep", "1.05"]),
        &CancellationToken::new(),
    )
    .unwrap();

    assert_eq!(result.cause, TerminationCause::TimedOut, "{:?}", result);
    assert_eq!(result.exit_code, Some(EXIT_TIMED_OUT));
}

#[test]
fn test_passed_fd_reaches_payload() {
    let path = std::env::temp_dir().join(format!("jailbox-passfd-{}", std::process::id()));
    std::fs::write(&path, "passed").unwrap();
    let file = std::fs::File::open(&path).unwrap();
    let fd = file.as_raw_fd();
    let read_fd = SandboxCommand::new(["cat".to_string(), format!("/proc/self/fd/{}", fd)]);

    let hidden = execute(&config(unprivileged()), &read_fd, &CancellationToken::new()).unwrap();
    assert_ne!(hidden.exit_code, Some(0));

    let passed = execute(
        &config(unprivileged().pass_fd(fd)),
        &read_fd,
        &CancellationToken::new(),
    )
    .unwrap();
    assert_eq!(passed.exit_code, Some(0), "{:?}", passed);
    assert_eq!(passed.stdout, "passed");

    drop(file);
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn test_skip_setsid_keeps_the_session() {
    let session = nix::unistd::getsid(None).unwrap().as_raw().to_string();
    let read_session = SandboxCommand::new(["cut", "-d", " ", "-f", "6", "/proc/self/stat"]);

    let own = execute(
        &config(unprivileged()),
        &read_session,
        &CancellationToken::new(),
    )
    .unwrap();
    assert_ne!(own.stdout.trim(), session);

    let shared = execute(
        &config(unprivileged().skip_setsid(true)),
        &read_session,
        &CancellationToken::new(),
    )
    .unwrap();
    assert_eq!(shared.stdout.trim(), session);
}
