/// Core configuration types for the jailbox engine
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Kind of filesystem attachment inside the sandbox root
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MountKind {
    /// Bind a host path into the sandbox
    Bind,
    /// Fresh tmpfs instance
    Tmpfs,
    /// Arbitrary filesystem type (`mount -t <fs_type>`)
    Typed,
}

/// One mount table entry
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MountSpec {
    pub kind: MountKind,
    /// Host path (bind) or device/pseudo source (typed)
    #[serde(default)]
    pub source: Option<PathBuf>,
    /// Absolute path inside the sandbox root
    pub destination: PathBuf,
    #[serde(default)]
    pub fs_type: Option<String>,
    /// Filesystem-specific data string, e.g. `size=16m`
    #[serde(default)]
    pub options: Option<String>,
    #[serde(default)]
    pub read_only: bool,
}

impl MountSpec {
    pub fn bind_ro(source: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self {
            kind: MountKind::Bind,
            source: Some(source.into()),
            destination: destination.into(),
            fs_type: None,
            options: None,
            read_only: true,
        }
    }

    pub fn bind_rw(source: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self {
            read_only: false,
            ..Self::bind_ro(source, destination)
        }
    }

    pub fn tmpfs(destination: impl Into<PathBuf>, options: Option<&str>) -> Self {
        Self {
            kind: MountKind::Tmpfs,
            source: None,
            destination: destination.into(),
            fs_type: Some("tmpfs".to_string()),
            options: options.map(str::to_string),
            read_only: false,
        }
    }

    pub fn typed(
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        fs_type: &str,
        options: Option<&str>,
        read_only: bool,
    ) -> Self {
        Self {
            kind: MountKind::Typed,
            source: Some(source.into()),
            destination: destination.into(),
            fs_type: Some(fs_type.to_string()),
            options: options.map(str::to_string),
            read_only,
        }
    }

    /// Parse a bind specification in `source[:destination]` form.
    /// Without a destination the source path is reused inside the sandbox.
    pub fn parse_bind(spec: &str, read_only: bool) -> std::result::Result<Self, String> {
        let mut parts = spec.splitn(2, ':');
        let source = parts.next().unwrap_or_default().trim();
        if source.is_empty() {
            return Err(format!("Invalid bind mount '{}': empty source", spec));
        }
        let destination = match parts.next() {
            Some(dst) if !dst.trim().is_empty() => dst.trim(),
            Some(_) => return Err(format!("Invalid bind mount '{}': empty destination", spec)),
            None => source,
        };

        let mount = if read_only {
            Self::bind_ro(source, destination)
        } else {
            Self::bind_rw(source, destination)
        };
        Ok(mount)
    }

    /// Parse a typed mount in `source:destination:fs_type[:options]` form.
    pub fn parse_typed(spec: &str) -> std::result::Result<Self, String> {
        let parts: Vec<&str> = spec.splitn(4, ':').collect();
        if parts.len() < 3 {
            return Err(format!(
                "Invalid mount '{}'. Use: source:destination:fs_type[:options]",
                spec
            ));
        }
        let options = parts.get(3).copied().filter(|o| !o.is_empty());
        let read_only = options
            .map(|o| o.split(',').any(|opt| opt.trim() == "ro"))
            .unwrap_or(false);
        Ok(Self::typed(parts[0], parts[1], parts[2], options, read_only))
    }
}

/// Symbolic link created inside the sandbox root
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SymlinkSpec {
    /// What the link points to (interpreted inside the sandbox)
    pub target: PathBuf,
    /// Where the link is created
    pub link: PathBuf,
}

/// Root filesystem view
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RootSpec {
    /// Host directory used as the new root; an empty tmpfs when absent
    pub chroot: Option<PathBuf>,
    /// Root stays read-only unless this is set
    pub writable: bool,
    /// Use chroot(2) instead of pivot_root(2)
    pub no_pivot_root: bool,
}

/// Process-information filesystem mount
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProcSpec {
    pub enabled: bool,
    pub path: PathBuf,
    pub read_write: bool,
}

impl Default for ProcSpec {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from("/proc"),
            read_write: false,
        }
    }
}

/// Linux namespace kinds, in creation order
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum NamespaceKind {
    User,
    Mount,
    Pid,
    Ipc,
    Uts,
    Net,
    Cgroup,
    Time,
}

impl NamespaceKind {
    pub const ALL: [NamespaceKind; 8] = [
        NamespaceKind::User,
        NamespaceKind::Mount,
        NamespaceKind::Pid,
        NamespaceKind::Ipc,
        NamespaceKind::Uts,
        NamespaceKind::Net,
        NamespaceKind::Cgroup,
        NamespaceKind::Time,
    ];

    /// Entry name under `/proc/self/ns`
    pub fn proc_name(self) -> &'static str {
        match self {
            NamespaceKind::User => "user",
            NamespaceKind::Mount => "mnt",
            NamespaceKind::Pid => "pid",
            NamespaceKind::Ipc => "ipc",
            NamespaceKind::Uts => "uts",
            NamespaceKind::Net => "net",
            NamespaceKind::Cgroup => "cgroup",
            NamespaceKind::Time => "time",
        }
    }
}

impl fmt::Display for NamespaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.proc_name())
    }
}

/// Independent namespace toggles
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NamespaceSet {
    pub net: bool,
    pub user: bool,
    pub mount: bool,
    pub pid: bool,
    pub ipc: bool,
    pub uts: bool,
    pub cgroup: bool,
    pub time: bool,
}

impl Default for NamespaceSet {
    fn default() -> Self {
        Self {
            net: true,
            user: true,
            mount: true,
            pid: true,
            ipc: true,
            uts: true,
            cgroup: true,
            time: false,
        }
    }
}

impl NamespaceSet {
    /// Every namespace disabled; the payload shares the host's views.
    pub fn none() -> Self {
        Self {
            net: false,
            user: false,
            mount: false,
            pid: false,
            ipc: false,
            uts: false,
            cgroup: false,
            time: false,
        }
    }

    pub fn is_enabled(&self, kind: NamespaceKind) -> bool {
        match kind {
            NamespaceKind::User => self.user,
            NamespaceKind::Mount => self.mount,
            NamespaceKind::Pid => self.pid,
            NamespaceKind::Ipc => self.ipc,
            NamespaceKind::Uts => self.uts,
            NamespaceKind::Net => self.net,
            NamespaceKind::Cgroup => self.cgroup,
            NamespaceKind::Time => self.time,
        }
    }

    pub fn set(&mut self, kind: NamespaceKind, enabled: bool) {
        let slot = match kind {
            NamespaceKind::User => &mut self.user,
            NamespaceKind::Mount => &mut self.mount,
            NamespaceKind::Pid => &mut self.pid,
            NamespaceKind::Ipc => &mut self.ipc,
            NamespaceKind::Uts => &mut self.uts,
            NamespaceKind::Net => &mut self.net,
            NamespaceKind::Cgroup => &mut self.cgroup,
            NamespaceKind::Time => &mut self.time,
        };
        *slot = enabled;
    }

    /// Enabled namespaces in creation order
    pub fn enabled(&self) -> Vec<NamespaceKind> {
        NamespaceKind::ALL
            .iter()
            .copied()
            .filter(|kind| self.is_enabled(*kind))
            .collect()
    }
}

/// A resource limit value: concrete, or resolved from the launching process
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LimitValue {
    Value(u64),
    /// Current hard limit of the supervisor
    CurrentMax,
    /// Current soft limit of the supervisor
    CurrentSoft,
    Unbounded,
}

impl FromStr for LimitValue {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "max" | "hard" => Ok(LimitValue::CurrentMax),
            "def" | "soft" => Ok(LimitValue::CurrentSoft),
            "inf" | "unlimited" => Ok(LimitValue::Unbounded),
            other => other
                .parse::<u64>()
                .map(LimitValue::Value)
                .map_err(|_| format!("Invalid limit value: {}", other)),
        }
    }
}

/// rlimit-backed resources the engine can cap
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LimitResource {
    /// Seconds of CPU time (RLIMIT_CPU)
    CpuTime,
    /// Bytes of virtual memory (RLIMIT_AS)
    AddressSpace,
    /// Bytes per written file (RLIMIT_FSIZE)
    FileSize,
    /// Processes per uid (RLIMIT_NPROC)
    Processes,
    /// Open file descriptors (RLIMIT_NOFILE)
    OpenFiles,
    Stack,
    Core,
    /// Bytes of locked memory (RLIMIT_MEMLOCK)
    Memlock,
    /// Ceiling on real-time priority (RLIMIT_RTPRIO)
    Rtprio,
    /// Bytes in POSIX message queues (RLIMIT_MSGQUEUE)
    Msgqueue,
}

impl LimitResource {
    pub fn name(self) -> &'static str {
        match self {
            LimitResource::CpuTime => "RLIMIT_CPU",
            LimitResource::AddressSpace => "RLIMIT_AS",
            LimitResource::FileSize => "RLIMIT_FSIZE",
            LimitResource::Processes => "RLIMIT_NPROC",
            LimitResource::OpenFiles => "RLIMIT_NOFILE",
            LimitResource::Stack => "RLIMIT_STACK",
            LimitResource::Core => "RLIMIT_CORE",
            LimitResource::Memlock => "RLIMIT_MEMLOCK",
            LimitResource::Rtprio => "RLIMIT_RTPRIO",
            LimitResource::Msgqueue => "RLIMIT_MSGQUEUE",
        }
    }
}

impl fmt::Display for LimitResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// cgroup v2 ceilings for the whole process tree
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CgroupLimits {
    /// `memory.max` in bytes
    pub memory_max: Option<u64>,
    /// `pids.max`
    pub pids_max: Option<u32>,
    /// CPU milliseconds granted per wall-clock second (`cpu.max`)
    pub cpu_ms_per_sec: Option<u32>,
    /// `memory.swap.max` in bytes; swap is disabled when only `memory_max` is set
    pub memory_swap_max: Option<u64>,
}

impl CgroupLimits {
    pub fn is_empty(&self) -> bool {
        self.memory_max.is_none()
            && self.pids_max.is_none()
            && self.cpu_ms_per_sec.is_none()
            && self.memory_swap_max.is_none()
    }
}

/// Resource and time limits
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ResourceLimits {
    pub cpu_time: Option<LimitValue>,
    pub address_space: Option<LimitValue>,
    pub file_size: Option<LimitValue>,
    pub processes: Option<LimitValue>,
    pub open_files: Option<LimitValue>,
    pub stack: Option<LimitValue>,
    pub core: Option<LimitValue>,
    pub memlock: Option<LimitValue>,
    pub rtprio: Option<LimitValue>,
    pub msgqueue: Option<LimitValue>,
    /// Wall-clock limit enforced by the supervisor
    pub wall_time_ms: Option<u64>,
    /// Interval between SIGTERM and SIGKILL
    pub grace_period_ms: u64,
    pub nice_level: Option<i32>,
    /// Restrict the payload to this many of the CPUs it may run on
    pub max_cpus: Option<u32>,
    pub cgroup: CgroupLimits,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_time: None,
            address_space: None,
            file_size: None,
            processes: None,
            open_files: None,
            stack: None,
            core: None,
            memlock: None,
            rtprio: None,
            msgqueue: None,
            wall_time_ms: None,
            grace_period_ms: 500,
            nice_level: None,
            max_cpus: None,
            cgroup: CgroupLimits::default(),
        }
    }
}

impl ResourceLimits {
    pub fn get(&self, resource: LimitResource) -> Option<LimitValue> {
        match resource {
            LimitResource::CpuTime => self.cpu_time,
            LimitResource::AddressSpace => self.address_space,
            LimitResource::FileSize => self.file_size,
            LimitResource::Processes => self.processes,
            LimitResource::OpenFiles => self.open_files,
            LimitResource::Stack => self.stack,
            LimitResource::Core => self.core,
            LimitResource::Memlock => self.memlock,
            LimitResource::Rtprio => self.rtprio,
            LimitResource::Msgqueue => self.msgqueue,
        }
    }

    pub fn set(&mut self, resource: LimitResource, value: Option<LimitValue>) {
        let slot = match resource {
            LimitResource::CpuTime => &mut self.cpu_time,
            LimitResource::AddressSpace => &mut self.address_space,
            LimitResource::FileSize => &mut self.file_size,
            LimitResource::Processes => &mut self.processes,
            LimitResource::OpenFiles => &mut self.open_files,
            LimitResource::Stack => &mut self.stack,
            LimitResource::Core => &mut self.core,
            LimitResource::Memlock => &mut self.memlock,
            LimitResource::Rtprio => &mut self.rtprio,
            LimitResource::Msgqueue => &mut self.msgqueue,
        };
        *slot = value;
    }

    /// Configured rlimits in a fixed order
    pub fn entries(&self) -> Vec<(LimitResource, LimitValue)> {
        [
            LimitResource::CpuTime,
            LimitResource::AddressSpace,
            LimitResource::FileSize,
            LimitResource::Processes,
            LimitResource::OpenFiles,
            LimitResource::Stack,
            LimitResource::Core,
            LimitResource::Memlock,
            LimitResource::Rtprio,
            LimitResource::Msgqueue,
        ]
        .iter()
        .filter_map(|resource| self.get(*resource).map(|value| (*resource, value)))
        .collect()
    }

    pub fn wall_time(&self) -> Option<Duration> {
        self.wall_time_ms.map(Duration::from_millis)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

/// Identity the payload runs as
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Identity {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// Hostname inside the UTS namespace
    pub hostname: Option<String>,
}

/// How the payload environment is derived from the supervisor's
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EnvMode {
    InheritAll,
    /// Only the named variables are passed through
    AllowList(Vec<String>),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EnvPolicy {
    pub mode: EnvMode,
    /// Applied after inheritance; later entries win
    pub overrides: Vec<(String, String)>,
}

impl Default for EnvPolicy {
    fn default() -> Self {
        Self {
            mode: EnvMode::AllowList(Vec::new()),
            overrides: Vec::new(),
        }
    }
}

impl EnvPolicy {
    /// Resolve the payload environment against a host environment snapshot.
    pub fn resolve<I>(&self, host: I) -> Vec<(String, String)>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut env: BTreeMap<String, String> = match &self.mode {
            EnvMode::InheritAll => host.into_iter().collect(),
            EnvMode::AllowList(names) => host
                .into_iter()
                .filter(|(key, _)| names.iter().any(|name| name == key))
                .collect(),
        };
        for (key, value) in &self.overrides {
            env.insert(key.clone(), value.clone());
        }
        env.into_iter().collect()
    }
}

static CAPABILITY_NAMES: Lazy<HashMap<&'static str, u32>> = Lazy::new(|| {
    [
        ("CAP_CHOWN", 0),
        ("CAP_DAC_OVERRIDE", 1),
        ("CAP_DAC_READ_SEARCH", 2),
        ("CAP_FOWNER", 3),
        ("CAP_FSETID", 4),
        ("CAP_KILL", 5),
        ("CAP_SETGID", 6),
        ("CAP_SETUID", 7),
        ("CAP_SETPCAP", 8),
        ("CAP_LINUX_IMMUTABLE", 9),
        ("CAP_NET_BIND_SERVICE", 10),
        ("CAP_NET_BROADCAST", 11),
        ("CAP_NET_ADMIN", 12),
        ("CAP_NET_RAW", 13),
        ("CAP_IPC_LOCK", 14),
        ("CAP_IPC_OWNER", 15),
        ("CAP_SYS_MODULE", 16),
        ("CAP_SYS_RAWIO", 17),
        ("CAP_SYS_CHROOT", 18),
        ("CAP_SYS_PTRACE", 19),
        ("CAP_SYS_PACCT", 20),
        ("CAP_SYS_ADMIN", 21),
        ("CAP_SYS_BOOT", 22),
        ("CAP_SYS_NICE", 23),
        ("CAP_SYS_RESOURCE", 24),
        ("CAP_SYS_TIME", 25),
        ("CAP_SYS_TTY_CONFIG", 26),
        ("CAP_MKNOD", 27),
        ("CAP_LEASE", 28),
        ("CAP_AUDIT_WRITE", 29),
        ("CAP_AUDIT_CONTROL", 30),
        ("CAP_SETFCAP", 31),
        ("CAP_MAC_OVERRIDE", 32),
        ("CAP_MAC_ADMIN", 33),
        ("CAP_SYSLOG", 34),
        ("CAP_WAKE_ALARM", 35),
        ("CAP_BLOCK_SUSPEND", 36),
        ("CAP_AUDIT_READ", 37),
        ("CAP_PERFMON", 38),
        ("CAP_BPF", 39),
        ("CAP_CHECKPOINT_RESTORE", 40),
    ]
    .into_iter()
    .collect()
});

/// A Linux capability, always one of the known `CAP_*` names
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Capability {
    number: u32,
    name: String,
}

impl Capability {
    pub const LAST: u32 = 40;

    /// Accepts `CAP_NET_ADMIN` and `net_admin` spellings.
    pub fn from_name(name: &str) -> Option<Self> {
        let upper = name.trim().to_ascii_uppercase();
        let canonical = if upper.starts_with("CAP_") {
            upper
        } else {
            format!("CAP_{}", upper)
        };
        CAPABILITY_NAMES.get(canonical.as_str()).map(|number| Self {
            number: *number,
            name: canonical,
        })
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl TryFrom<String> for Capability {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        Capability::from_name(&value).ok_or_else(|| format!("Unknown capability: {}", value))
    }
}

impl From<Capability> for String {
    fn from(cap: Capability) -> String {
        cap.name
    }
}

/// MACVLAN operating mode
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MacvlanMode {
    #[default]
    Private,
    Vepa,
    Bridge,
    Passthru,
}

impl MacvlanMode {
    pub fn as_str(self) -> &'static str {
        match self {
            MacvlanMode::Private => "private",
            MacvlanMode::Vepa => "vepa",
            MacvlanMode::Bridge => "bridge",
            MacvlanMode::Passthru => "passthru",
        }
    }
}

/// Clone of a host interface moved into the sandbox network namespace
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MacvlanSpec {
    /// Host parent interface
    pub interface: String,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub netmask: Option<String>,
    #[serde(default)]
    pub gateway: Option<String>,
    #[serde(default)]
    pub mac: Option<String>,
    #[serde(default)]
    pub mode: MacvlanMode,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NetworkPolicy {
    /// Bring `lo` up inside the network namespace
    pub loopback: bool,
    pub macvlan: Option<MacvlanSpec>,
}

impl Default for NetworkPolicy {
    fn default() -> Self {
        Self {
            loopback: true,
            macvlan: None,
        }
    }
}

/// Violated configuration constraint
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigViolation {
    #[error("mount at {destination:?} requires the mount namespace")]
    MountWithoutMountNamespace { destination: PathBuf },

    #[error("symlink at {link:?} requires the mount namespace")]
    SymlinkWithoutMountNamespace { link: PathBuf },

    #[error("custom root filesystem requires the mount namespace")]
    RootWithoutMountNamespace,

    #[error("destination {destination:?} escapes the sandbox root")]
    DestinationOutsideRoot { destination: PathBuf },

    #[error("bind mount at {destination:?} has no source")]
    MissingBindSource { destination: PathBuf },

    #[error("typed mount at {destination:?} has no filesystem type")]
    MissingFilesystemType { destination: PathBuf },

    #[error("{resource} value {value} is outside [0, {max}]")]
    LimitOutOfRange {
        resource: LimitResource,
        value: u64,
        max: u64,
    },

    #[error("wall_time_ms cannot be zero")]
    ZeroWallTime,

    #[error("grace_period_ms cannot be zero")]
    ZeroGracePeriod,

    #[error("nice_level {0} is outside [-20, 19]")]
    NiceOutOfRange(i32),

    #[error("max_cpus cannot be zero")]
    ZeroMaxCpus,

    #[error("pass_fds entry {0} is not above stderr")]
    InvalidPassFd(i32),

    #[error("cgroup {name} value {value} is out of range")]
    CgroupLimitOutOfRange { name: String, value: u64 },

    #[error("unknown capability {name:?}")]
    UnknownCapability { name: String },

    #[error("invalid environment variable name {name:?}")]
    InvalidEnvName { name: String },

    #[error("hostname requires the UTS namespace")]
    HostnameWithoutUtsNamespace,

    #[error("{field} must be an absolute path: {path:?}")]
    RelativePath { field: String, path: PathBuf },

    #[error("macvlan requires a parent interface name")]
    MacvlanWithoutInterface,
}

/// Every constraint violated by a configuration, in check order
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub violations: Vec<ConfigViolation>,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid sandbox configuration ({} problems)", self.violations.len())?;
        for violation in &self.violations {
            write!(f, "\n  - {}", violation)?;
        }
        Ok(())
    }
}

/// Environment could not be planned; nothing was executed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("mount source {path:?} for {destination:?} does not exist")]
    MissingMountSource {
        path: PathBuf,
        destination: PathBuf,
    },

    #[error("chroot directory {0:?} does not exist")]
    MissingChroot(PathBuf),

    #[error("macvlan clone of {interface} requires the network namespace")]
    MacvlanWithoutNetworkNamespace { interface: String },

    #[error("{0} namespace is not supported by this kernel")]
    NamespaceUnsupported(NamespaceKind),

    #[error("writable mount at {destination:?} would shadow a read-only mount")]
    WidensReadOnlyMount { destination: PathBuf },
}

/// Custom error types for jailbox
#[derive(Error, Debug)]
pub enum JailError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Config source error: {0}")]
    ConfigSource(String),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Namespace isolation error: {0}")]
    Namespace(String),

    #[error("Mount error: {0}")]
    Mount(String),

    #[error("Privilege error: {0}")]
    Privilege(String),

    #[error("Cgroup error: {0}")]
    Cgroup(String),

    #[error("Resource limit error: {0}")]
    Limit(String),
}

impl From<nix::errno::Errno> for JailError {
    fn from(err: nix::errno::Errno) -> Self {
        JailError::Process(err.to_string())
    }
}

/// Result type alias for jailbox operations
pub type Result<T> = std::result::Result<T, JailError>;

/// `true` when `path` is absolute and cannot climb out of the root it is joined to.
pub fn is_contained_path(path: &Path) -> bool {
    path.is_absolute()
        && !path
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
}
