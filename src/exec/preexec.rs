//! Pre-exec sequence run inside the cloned child.
//!
//! The setup is a type-state chain so steps cannot be reordered:
//!
//! FreshChild -> NamespacesReady -> RootMounted -> LimitsApplied ->
//! PrivsDropped -> ExecReady
//!
//! Each step consumes the prior state and executes the sandbox-side plan
//! actions of its phase. Host-side actions (id maps, MACVLAN, cgroup) are
//! carried out by the supervisor between the two handshake rounds. Only
//! `Sandbox<ExecReady>` can exec the payload.

use crate::config::types::{JailError, NamespaceKind, Result};
use crate::exec::handshake::{read_byte_raw, write_raw, FAILED, GO, READY};
use crate::exec::plan::{ActionSide, EnvironmentPlan, PlanAction, PlanPhase};
use crate::kernel::capabilities::{
    check_no_new_privs, reduce_capabilities, set_keep_caps, set_no_new_privs,
};
use crate::kernel::credentials::switch_identity;
use crate::kernel::mount::FilesystemSetup;
use crate::kernel::{namespace, rlimit};
use std::ffi::CString;
use std::marker::PhantomData;
use std::os::unix::io::RawFd;
use std::path::Path;

/// Descriptors the child works with, all close-on-exec
#[derive(Clone, Copy, Debug)]
pub struct ChildFds {
    pub go_read: RawFd,
    pub status_write: RawFd,
    pub stdin: RawFd,
    pub stdout: RawFd,
    pub stderr: RawFd,
}

/// Everything the child needs, prepared by the supervisor before clone
pub struct ChildContext<'a> {
    pub plan: &'a EnvironmentPlan,
    pub staging: &'a Path,
    pub working_dir: &'a Path,
    pub strict_mode: bool,
    pub argv: &'a [CString],
    pub envp: &'a [CString],
    pub fds: ChildFds,
    /// Host descriptors left open across exec
    pub pass_fds: &'a [RawFd],
    pub skip_setsid: bool,
}

impl ChildContext<'_> {
    fn sandbox_actions(&self, phase: PlanPhase) -> impl Iterator<Item = &PlanAction> {
        self.plan
            .actions()
            .iter()
            .filter(move |a| a.phase() == phase && a.side() == ActionSide::Sandbox)
    }

    fn wait_for_go(&self) -> Result<()> {
        match read_byte_raw(self.fds.go_read) {
            Some(GO) => Ok(()),
            _ => Err(JailError::Process(
                "supervisor abandoned the launch".to_string(),
            )),
        }
    }
}

/// Child entry point. Never returns to the caller's code path: either the
/// payload replaces the process or the child exits with 127.
pub fn child_main(ctx: &ChildContext<'_>) -> isize {
    if let Err(e) = run_chain(ctx) {
        let mut message = Vec::with_capacity(64);
        message.push(FAILED);
        message.extend_from_slice(e.to_string().as_bytes());
        let _ = write_raw(ctx.fds.status_write, &message);
    }
    // SAFETY: _exit skips atexit handlers and destructors copied from the parent.
    unsafe { libc::_exit(127) }
}

fn run_chain(ctx: &ChildContext<'_>) -> Result<()> {
    // Round one: host namespace actions (id maps, interfaces) are done
    ctx.wait_for_go()?;

    let sandbox = Sandbox::<FreshChild>::new(ctx)
        .enter_namespaces()?
        .assemble_root()?;

    if !write_raw(ctx.fds.status_write, &[READY]) {
        return Err(JailError::Process("failed to report readiness".to_string()));
    }
    // Round two: cgroup created and joined
    ctx.wait_for_go()?;

    sandbox
        .apply_limits()?
        .drop_privileges()?
        .ready_for_exec()
        .exec_payload()
}

/// Type-state marker: fresh child, nothing set up yet
pub struct FreshChild;
/// Type-state marker: session, namespaces, hostname and interfaces ready
pub struct NamespacesReady;
/// Type-state marker: inside the final root and working directory
pub struct RootMounted;
/// Type-state marker: rlimits and nice level applied
pub struct LimitsApplied;
/// Type-state marker: identity switched, capabilities reduced, privileges locked
pub struct PrivsDropped;
/// Type-state marker: ready for exec (all gates passed)
pub struct ExecReady;

pub struct Sandbox<'a, S> {
    ctx: &'a ChildContext<'a>,
    _state: PhantomData<S>,
}

impl<'a, S> Sandbox<'a, S> {
    fn advance<N>(self) -> Sandbox<'a, N> {
        Sandbox {
            ctx: self.ctx,
            _state: PhantomData,
        }
    }

    fn tolerate(&self, what: &str, result: Result<()>) -> Result<()> {
        match result {
            Err(e) if !self.ctx.strict_mode => {
                log::warn!("{} failed (permissive mode): {}", what, e);
                Ok(())
            }
            other => other,
        }
    }
}

impl<'a> Sandbox<'a, FreshChild> {
    pub fn new(ctx: &'a ChildContext<'a>) -> Self {
        Sandbox {
            ctx,
            _state: PhantomData,
        }
    }

    /// New session, parent-death signal and the sandbox side of the
    /// Namespaces phase.
    pub fn enter_namespaces(self) -> Result<Sandbox<'a, NamespacesReady>> {
        // Own process group so the supervisor can signal the whole tree.
        // Without it only the leader is signalled.
        if !self.ctx.skip_setsid {
            nix::unistd::setsid()
                .map_err(|e| JailError::Process(format!("setsid failed: {}", e)))?;
        }
        setup_parent_death_signal()?;

        for action in self.ctx.sandbox_actions(PlanPhase::Namespaces) {
            match action {
                PlanAction::CreateNamespace {
                    kind: NamespaceKind::Mount,
                } => namespace::harden_mount_propagation()?,
                PlanAction::CreateNamespace {
                    kind: NamespaceKind::Time,
                } => namespace::enter_time_namespace()?,
                PlanAction::CreateNamespace { .. } => {}
                PlanAction::SetHostname { hostname } => {
                    self.tolerate("hostname", namespace::set_hostname(hostname))?
                }
                PlanAction::BringUpLoopback => {
                    self.tolerate("loopback", namespace::bring_up_loopback())?
                }
                other => log::debug!("ignoring {:?} in namespaces step", other),
            }
        }

        Ok(self.advance())
    }
}

impl<'a> Sandbox<'a, NamespacesReady> {
    /// Root, Mounts and Proc phases, then switch into the new root.
    pub fn assemble_root(self) -> Result<Sandbox<'a, RootMounted>> {
        let ctx = self.ctx;
        let mut setup: Option<(FilesystemSetup, bool)> = None;

        let phases = [PlanPhase::Root, PlanPhase::Mounts, PlanPhase::Proc];
        for action in phases.iter().flat_map(move |phase| ctx.sandbox_actions(*phase)) {
            if let PlanAction::MountRoot {
                source,
                writable,
                pivot,
            } = action
            {
                let mut fs = FilesystemSetup::new(ctx.staging.to_path_buf(), ctx.strict_mode);
                fs.mount_root(source.as_deref(), *writable)?;
                setup = Some((fs, *pivot));
                continue;
            }

            let Some((fs, _)) = setup.as_mut() else {
                return Err(JailError::Mount(format!(
                    "{:?} planned without a root mount",
                    action
                )));
            };
            match action {
                PlanAction::BindMount {
                    source,
                    destination,
                    read_only,
                } => fs.bind(source, destination, *read_only)?,
                PlanAction::MountTmpfs {
                    destination,
                    options,
                    read_only,
                } => fs.tmpfs(destination, options.as_deref(), *read_only)?,
                PlanAction::MountFilesystem {
                    source,
                    destination,
                    fs_type,
                    options,
                    read_only,
                } => fs.typed(
                    source.as_deref(),
                    destination,
                    fs_type,
                    options.as_deref(),
                    *read_only,
                )?,
                PlanAction::CreateSymlink { target, link } => fs.symlink(target, link)?,
                PlanAction::MountProc { path, read_write } => fs.proc(path, *read_write)?,
                other => log::debug!("ignoring {:?} in root step", other),
            }
        }

        match setup {
            Some((fs, pivot)) => fs.enter_root(pivot, ctx.working_dir)?,
            None => nix::unistd::chdir(ctx.working_dir).map_err(|e| {
                JailError::Mount(format!(
                    "Failed to chdir to working directory {}: {}",
                    ctx.working_dir.display(),
                    e
                ))
            })?,
        }

        Ok(self.advance())
    }
}

impl<'a> Sandbox<'a, RootMounted> {
    pub fn apply_limits(self) -> Result<Sandbox<'a, LimitsApplied>> {
        let strict = self.ctx.strict_mode;
        for action in self.ctx.sandbox_actions(PlanPhase::Limits) {
            match action {
                PlanAction::SetRlimit { resource, value } => {
                    rlimit::apply_rlimit(*resource, *value, strict)?
                }
                PlanAction::SetNice { level } => rlimit::apply_nice(*level, strict)?,
                PlanAction::SetCpuAffinity { max_cpus } => {
                    rlimit::apply_cpu_affinity(*max_cpus, strict)?
                }
                other => log::debug!("ignoring {:?} in limits step", other),
            }
        }
        Ok(self.advance())
    }
}

impl<'a> Sandbox<'a, LimitsApplied> {
    /// setresgid/setresuid, capability reduction, then no_new_privs.
    pub fn drop_privileges(self) -> Result<Sandbox<'a, PrivsDropped>> {
        let strict = self.ctx.strict_mode;
        let mut locked = false;

        for action in self.ctx.sandbox_actions(PlanPhase::Identity) {
            match action {
                PlanAction::SetIdentity { uid, gid } => {
                    // Permitted capabilities must survive the uid switch so the
                    // bounding set can still be trimmed afterwards
                    self.tolerate("keep-caps", set_keep_caps())?;
                    let current_uid = nix::unistd::getuid().as_raw();
                    let current_gid = nix::unistd::getgid().as_raw();
                    switch_identity(
                        uid.unwrap_or(current_uid),
                        gid.unwrap_or(current_gid),
                        strict,
                    )?;
                }
                PlanAction::DropCapabilities { retain } => reduce_capabilities(retain, strict)?,
                PlanAction::LockPrivileges => {
                    set_no_new_privs()?;
                    locked = true;
                }
                other => log::debug!("ignoring {:?} in identity step", other),
            }
        }

        if locked && !check_no_new_privs() {
            return Err(JailError::Privilege(
                "PR_SET_NO_NEW_PRIVS verification failed".to_string(),
            ));
        }
        Ok(self.advance())
    }
}

impl<'a> Sandbox<'a, PrivsDropped> {
    pub fn ready_for_exec(self) -> Sandbox<'a, ExecReady> {
        self.advance()
    }
}

impl<'a> Sandbox<'a, ExecReady> {
    /// Wire stdio and exec the payload. Returns only on failure.
    pub fn exec_payload(self) -> Result<()> {
        let ctx = self.ctx;
        let Some(program) = ctx.argv.first() else {
            return Err(JailError::Process("Empty command for exec".to_string()));
        };

        wire_stdio(ctx.fds)?;
        mark_inherited_fds_cloexec();
        for &fd in ctx.pass_fds {
            self.tolerate("pass_fds", keep_open_across_exec(fd))?;
        }

        let err = nix::unistd::execvpe(program.as_c_str(), ctx.argv, ctx.envp).err();
        Err(JailError::Process(format!(
            "execvpe({}) failed: {}",
            program.to_string_lossy(),
            err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }
}

/// SIGKILL the child if the supervisor dies
pub fn setup_parent_death_signal() -> Result<()> {
    use nix::sys::prctl;
    use nix::sys::signal::Signal;

    prctl::set_pdeathsig(Signal::SIGKILL)
        .map_err(|e| JailError::Process(format!("Failed to set parent death signal: {}", e)))
}

fn wire_stdio(fds: ChildFds) -> Result<()> {
    for (source, target) in [(fds.stdin, 0), (fds.stdout, 1), (fds.stderr, 2)] {
        // dup2 onto itself keeps close-on-exec, so clear it explicitly
        let rc = if source == target {
            // SAFETY: fcntl on a descriptor we own.
            unsafe { libc::fcntl(target, libc::F_SETFD, 0) }
        } else {
            // SAFETY: dup2 between two valid descriptors.
            unsafe { libc::dup2(source, target) }
        };
        if rc < 0 {
            return Err(JailError::Process(format!(
                "Failed to wire fd {} to {}: {}",
                source,
                target,
                std::io::Error::last_os_error()
            )));
        }
    }
    Ok(())
}

/// Descriptors above stderr inherited from the host must not reach the payload.
fn mark_inherited_fds_cloexec() {
    const SYS_CLOSE_RANGE: libc::c_long = 436;
    const CLOSE_RANGE_CLOEXEC: libc::c_uint = 1 << 2;
    // SAFETY: close_range only flags descriptors of the calling process.
    let rc = unsafe {
        libc::syscall(
            SYS_CLOSE_RANGE,
            3 as libc::c_uint,
            libc::c_uint::MAX,
            CLOSE_RANGE_CLOEXEC,
        )
    };
    if rc == 0 {
        return;
    }

    // Kernels before 5.11: walk the soft descriptor limit
    let max_fd = nix::sys::resource::getrlimit(nix::sys::resource::Resource::RLIMIT_NOFILE)
        .map(|(soft, _)| soft.min(65536) as RawFd)
        .unwrap_or(1024);
    for fd in 3..max_fd {
        // SAFETY: F_SETFD on a closed descriptor just fails with EBADF.
        unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) };
    }
}

/// Clear close-on-exec so `fd` reaches the payload under the same number.
fn keep_open_across_exec(fd: RawFd) -> Result<()> {
    // SAFETY: fcntl on a descriptor number; a closed one fails with EBADF.
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFD, 0) };
    if rc < 0 {
        return Err(JailError::Process(format!(
            "Failed to pass fd {}: {}",
            fd,
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::builder::SandboxConfigBuilder;
    use crate::config::types::NamespaceSet;
    use crate::exec::plan::build_plan;

    #[test]
    fn test_sandbox_actions_exclude_host_side() {
        let config = SandboxConfigBuilder::new()
            .namespaces(NamespaceSet::none())
            .cgroup_pids_max(8)
            .build()
            .unwrap();
        let plan = build_plan(&config).unwrap();
        let ctx = ChildContext {
            plan: &plan,
            staging: Path::new("/tmp/unused"),
            working_dir: Path::new("/"),
            strict_mode: true,
            argv: &[],
            envp: &[],
            fds: ChildFds {
                go_read: -1,
                status_write: -1,
                stdin: -1,
                stdout: -1,
                stderr: -1,
            },
            pass_fds: &[],
            skip_setsid: false,
        };
        assert!(plan.host_actions(PlanPhase::Limits).count() == 1);
        assert_eq!(ctx.sandbox_actions(PlanPhase::Limits).count(), 0);
    }

    #[test]
    fn test_passed_fd_loses_cloexec() {
        use std::os::unix::io::AsRawFd;
        let pipe = crate::exec::handshake::Pipe::new().unwrap();
        let fd = pipe.read.as_raw_fd();
        keep_open_across_exec(fd).unwrap();
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        assert_eq!(flags & libc::FD_CLOEXEC, 0);

        assert!(keep_open_across_exec(1 << 20).is_err());
    }

    #[test]
    fn test_wait_for_go_fails_on_closed_pipe() {
        let pipe = crate::exec::handshake::Pipe::new().unwrap();
        use std::os::unix::io::AsRawFd;
        let go_read = pipe.read.as_raw_fd();
        drop(pipe.write);

        let plan = build_plan(
            &SandboxConfigBuilder::new()
                .namespaces(NamespaceSet::none())
                .build()
                .unwrap(),
        )
        .unwrap();
        let ctx = ChildContext {
            plan: &plan,
            staging: Path::new("/tmp/unused"),
            working_dir: Path::new("/"),
            strict_mode: true,
            argv: &[],
            envp: &[],
            fds: ChildFds {
                go_read,
                status_write: -1,
                stdin: -1,
                stdout: -1,
                stderr: -1,
            },
            pass_fds: &[],
            skip_setsid: false,
        };
        assert!(ctx.wait_for_go().is_err());
    }
}
