/// Sandbox configuration builder and the validated, immutable configuration
use crate::config::types::{
    Capability, ConfigError, EnvMode, EnvPolicy, Identity, LimitResource, LimitValue,
    MacvlanSpec, MountSpec, NamespaceKind, NamespaceSet, NetworkPolicy, ProcSpec, ResourceLimits,
    RootSpec, SymlinkSpec,
};
use crate::config::validator;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Mutable configuration draft. Deserializable from JSON; every field
/// falls back to its default when omitted.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct SandboxConfigBuilder {
    pub(crate) mounts: Vec<MountSpec>,
    pub(crate) symlinks: Vec<SymlinkSpec>,
    pub(crate) root: RootSpec,
    #[serde(rename = "proc")]
    pub(crate) proc_mount: ProcSpec,
    pub(crate) namespaces: NamespaceSet,
    pub(crate) limits: ResourceLimits,
    pub(crate) identity: Identity,
    pub(crate) env: EnvPolicy,
    pub(crate) capabilities: Vec<String>,
    pub(crate) network: NetworkPolicy,
    pub(crate) working_dir: PathBuf,
    pub(crate) strict: bool,
    pub(crate) no_new_privs: bool,
    /// Host descriptors handed to the payload under the same numbers
    pub(crate) pass_fds: Vec<i32>,
    /// Stay in the supervisor's session instead of starting a new one
    pub(crate) skip_setsid: bool,
}

impl Default for SandboxConfigBuilder {
    fn default() -> Self {
        Self {
            mounts: Vec::new(),
            symlinks: Vec::new(),
            root: RootSpec::default(),
            proc_mount: ProcSpec::default(),
            namespaces: NamespaceSet::default(),
            limits: ResourceLimits::default(),
            identity: Identity::default(),
            env: EnvPolicy::default(),
            capabilities: Vec::new(),
            network: NetworkPolicy::default(),
            working_dir: PathBuf::from("/"),
            strict: true,
            no_new_privs: true,
            pass_fds: Vec::new(),
            skip_setsid: false,
        }
    }
}

impl SandboxConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mount(mut self, mount: MountSpec) -> Self {
        self.mounts.push(mount);
        self
    }

    pub fn bind_ro(self, source: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        self.mount(MountSpec::bind_ro(source, destination))
    }

    pub fn bind_rw(self, source: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        self.mount(MountSpec::bind_rw(source, destination))
    }

    pub fn tmpfs(self, destination: impl Into<PathBuf>, options: Option<&str>) -> Self {
        self.mount(MountSpec::tmpfs(destination, options))
    }

    pub fn symlink(mut self, target: impl Into<PathBuf>, link: impl Into<PathBuf>) -> Self {
        self.symlinks.push(SymlinkSpec {
            target: target.into(),
            link: link.into(),
        });
        self
    }

    pub fn chroot(mut self, dir: impl Into<PathBuf>) -> Self {
        self.root.chroot = Some(dir.into());
        self
    }

    pub fn writable_root(mut self, writable: bool) -> Self {
        self.root.writable = writable;
        self
    }

    pub fn no_pivot_root(mut self, no_pivot: bool) -> Self {
        self.root.no_pivot_root = no_pivot;
        self
    }

    pub fn proc_mount(mut self, enabled: bool) -> Self {
        self.proc_mount.enabled = enabled;
        self
    }

    pub fn proc_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.proc_mount.path = path.into();
        self
    }

    pub fn proc_read_write(mut self, read_write: bool) -> Self {
        self.proc_mount.read_write = read_write;
        self
    }

    pub fn namespace(mut self, kind: NamespaceKind, enabled: bool) -> Self {
        self.namespaces.set(kind, enabled);
        self
    }

    pub fn namespaces(mut self, namespaces: NamespaceSet) -> Self {
        self.namespaces = namespaces;
        self
    }

    pub fn limit(mut self, resource: LimitResource, value: LimitValue) -> Self {
        self.limits.set(resource, Some(value));
        self
    }

    pub fn wall_time(mut self, limit: Duration) -> Self {
        self.limits.wall_time_ms = Some(u64::try_from(limit.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.limits.grace_period_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn nice_level(mut self, nice: i32) -> Self {
        self.limits.nice_level = Some(nice);
        self
    }

    pub fn cgroup_memory_max(mut self, bytes: u64) -> Self {
        self.limits.cgroup.memory_max = Some(bytes);
        self
    }

    pub fn cgroup_pids_max(mut self, pids: u32) -> Self {
        self.limits.cgroup.pids_max = Some(pids);
        self
    }

    pub fn cgroup_cpu_ms_per_sec(mut self, ms: u32) -> Self {
        self.limits.cgroup.cpu_ms_per_sec = Some(ms);
        self
    }

    pub fn cgroup_memory_swap_max(mut self, bytes: u64) -> Self {
        self.limits.cgroup.memory_swap_max = Some(bytes);
        self
    }

    pub fn max_cpus(mut self, count: u32) -> Self {
        self.limits.max_cpus = Some(count);
        self
    }

    pub fn uid(mut self, uid: u32) -> Self {
        self.identity.uid = Some(uid);
        self
    }

    pub fn gid(mut self, gid: u32) -> Self {
        self.identity.gid = Some(gid);
        self
    }

    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.identity.hostname = Some(hostname.into());
        self
    }

    pub fn inherit_env(mut self) -> Self {
        self.env.mode = EnvMode::InheritAll;
        self
    }

    /// Pass one host variable through. Ignored once `inherit_env` is set.
    pub fn allow_env(mut self, name: impl Into<String>) -> Self {
        if let EnvMode::AllowList(ref mut names) = self.env.mode {
            names.push(name.into());
        }
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.overrides.push((key.into(), value.into()));
        self
    }

    pub fn retain_capability(mut self, name: impl Into<String>) -> Self {
        self.capabilities.push(name.into());
        self
    }

    pub fn loopback(mut self, up: bool) -> Self {
        self.network.loopback = up;
        self
    }

    pub fn macvlan(mut self, spec: MacvlanSpec) -> Self {
        self.network.macvlan = Some(spec);
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn no_new_privs(mut self, enabled: bool) -> Self {
        self.no_new_privs = enabled;
        self
    }

    pub fn pass_fd(mut self, fd: i32) -> Self {
        if !self.pass_fds.contains(&fd) {
            self.pass_fds.push(fd);
        }
        self
    }

    pub fn skip_setsid(mut self, skip: bool) -> Self {
        self.skip_setsid = skip;
        self
    }

    /// Check without consuming; repeated calls return identical results.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        validator::validate(self).into_result().map(|_| ())
    }

    /// Validate and freeze the configuration.
    pub fn build(self) -> std::result::Result<SandboxConfig, ConfigError> {
        let warnings = validator::validate(&self).into_result()?;
        for warning in &warnings {
            log::warn!("config: {}", warning);
        }

        let mut capabilities: Vec<Capability> = self
            .capabilities
            .iter()
            .filter_map(|name| Capability::from_name(name))
            .collect();
        capabilities.sort();
        capabilities.dedup();

        Ok(SandboxConfig {
            mounts: self.mounts,
            symlinks: self.symlinks,
            root: self.root,
            proc_mount: self.proc_mount,
            namespaces: self.namespaces,
            limits: self.limits,
            identity: self.identity,
            env: self.env,
            capabilities,
            network: self.network,
            working_dir: self.working_dir,
            strict: self.strict,
            no_new_privs: self.no_new_privs,
            pass_fds: self.pass_fds,
            skip_setsid: self.skip_setsid,
        })
    }
}

/// Validated sandbox configuration. Immutable; shared by reference across
/// concurrent executions.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct SandboxConfig {
    mounts: Vec<MountSpec>,
    symlinks: Vec<SymlinkSpec>,
    root: RootSpec,
    #[serde(rename = "proc")]
    proc_mount: ProcSpec,
    namespaces: NamespaceSet,
    limits: ResourceLimits,
    identity: Identity,
    env: EnvPolicy,
    capabilities: Vec<Capability>,
    network: NetworkPolicy,
    working_dir: PathBuf,
    strict: bool,
    no_new_privs: bool,
    pass_fds: Vec<i32>,
    skip_setsid: bool,
}

impl SandboxConfig {
    pub fn builder() -> SandboxConfigBuilder {
        SandboxConfigBuilder::new()
    }

    /// Start a new draft from this configuration
    pub fn to_builder(&self) -> SandboxConfigBuilder {
        SandboxConfigBuilder {
            mounts: self.mounts.clone(),
            symlinks: self.symlinks.clone(),
            root: self.root.clone(),
            proc_mount: self.proc_mount.clone(),
            namespaces: self.namespaces.clone(),
            limits: self.limits.clone(),
            identity: self.identity.clone(),
            env: self.env.clone(),
            capabilities: self
                .capabilities
                .iter()
                .map(|cap| cap.name().to_string())
                .collect(),
            network: self.network.clone(),
            working_dir: self.working_dir.clone(),
            strict: self.strict,
            no_new_privs: self.no_new_privs,
            pass_fds: self.pass_fds.clone(),
            skip_setsid: self.skip_setsid,
        }
    }

    pub fn mounts(&self) -> &[MountSpec] {
        &self.mounts
    }

    pub fn symlinks(&self) -> &[SymlinkSpec] {
        &self.symlinks
    }

    pub fn root(&self) -> &RootSpec {
        &self.root
    }

    pub fn proc_mount(&self) -> &ProcSpec {
        &self.proc_mount
    }

    pub fn namespaces(&self) -> &NamespaceSet {
        &self.namespaces
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn env(&self) -> &EnvPolicy {
        &self.env
    }

    pub fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    pub fn network(&self) -> &NetworkPolicy {
        &self.network
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Fail instead of warn when a control cannot be applied
    pub fn strict(&self) -> bool {
        self.strict
    }

    pub fn no_new_privs(&self) -> bool {
        self.no_new_privs
    }

    pub fn pass_fds(&self) -> &[i32] {
        &self.pass_fds
    }

    pub fn skip_setsid(&self) -> bool {
        self.skip_setsid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_defaults() {
        let config = SandboxConfigBuilder::new().build().unwrap();
        assert!(config.strict());
        assert!(config.no_new_privs());
        assert!(config.proc_mount().enabled);
        assert!(!config.root().writable);
        assert!(config.namespaces().pid);
        assert!(!config.namespaces().time);
        assert_eq!(config.limits().grace_period(), Duration::from_millis(500));
        assert_eq!(config.working_dir(), Path::new("/"));
    }

    #[test]
    fn test_capabilities_are_normalised() {
        let config = SandboxConfigBuilder::new()
            .retain_capability("net_raw")
            .retain_capability("CAP_NET_RAW")
            .retain_capability("CAP_CHOWN")
            .build()
            .unwrap();
        let names: Vec<&str> = config.capabilities().iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["CAP_CHOWN", "CAP_NET_RAW"]);
    }

    #[test]
    fn test_to_builder_round_trips() {
        let config = SandboxConfigBuilder::new()
            .bind_ro("/usr", "/usr")
            .wall_time(Duration::from_secs(3))
            .build()
            .unwrap();
        let again = config.to_builder().build().unwrap();
        assert_eq!(config, again);
    }

    #[test]
    fn test_deserialize_partial_json() {
        let json = r#"{
            "mounts": [{"kind": "bind", "source": "/usr", "destination": "/usr", "read_only": true}],
            "namespaces": {"net": false},
            "limits": {"wall_time_ms": 2000, "cpu_time": {"value": 1}, "stack": "current_max"},
            "proc": {"enabled": false}
        }"#;
        let builder: SandboxConfigBuilder = serde_json::from_str(json).unwrap();
        let config = builder.build().unwrap();
        assert_eq!(config.mounts().len(), 1);
        assert!(!config.namespaces().net);
        assert!(config.namespaces().mount);
        assert_eq!(config.limits().cpu_time, Some(LimitValue::Value(1)));
        assert_eq!(config.limits().stack, Some(LimitValue::CurrentMax));
        assert_eq!(config.limits().wall_time(), Some(Duration::from_secs(2)));
        assert!(!config.proc_mount().enabled);
    }

    #[test]
    fn test_oversized_durations_saturate() {
        let builder = SandboxConfigBuilder::new()
            .wall_time(Duration::MAX)
            .grace_period(Duration::MAX);
        assert_eq!(builder.limits.wall_time_ms, Some(u64::MAX));
        assert_eq!(builder.limits.grace_period_ms, u64::MAX);
    }

    #[test]
    fn test_process_options_from_json() {
        let json = r#"{
            "pass_fds": [5, 7],
            "skip_setsid": true,
            "limits": {"max_cpus": 2, "msgqueue": {"value": 8192}, "cgroup": {"memory_swap_max": 0}}
        }"#;
        let builder: SandboxConfigBuilder = serde_json::from_str(json).unwrap();
        let config = builder.pass_fd(7).build().unwrap();
        assert_eq!(config.pass_fds(), &[5, 7]);
        assert!(config.skip_setsid());
        assert_eq!(config.limits().max_cpus, Some(2));
        assert_eq!(
            config.limits().get(LimitResource::Msgqueue),
            Some(LimitValue::Value(8192))
        );
        assert_eq!(config.limits().cgroup.memory_swap_max, Some(0));
        assert_eq!(config.to_builder().build().unwrap(), config);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result: std::result::Result<SandboxConfigBuilder, _> =
            serde_json::from_str(r#"{"seccomp": "default"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_allow_env_ignored_after_inherit() {
        let builder = SandboxConfigBuilder::new().inherit_env().allow_env("PATH");
        assert_eq!(builder.env.mode, EnvMode::InheritAll);
    }
}
