//! Sandbox request model.
//!
//! A [`SandboxRequest`] describes one invocation: the command, the mount root,
//! the target identity, extra bind entries and the enforcement tool. It is
//! assembled through [`RequestBuilder`] and validated once by
//! [`RequestBuilder::build`]; after that it is immutable.
//!
//! ## Example
//!
//! ```ignore
//! use jailrun::{MountEntry, SandboxRequest};
//!
//! let request = SandboxRequest::builder(["/bin/pwd"], "./root", 1000, "/usr/bin/policy-tool")
//!     .entry("./src:/tmp/lim".parse::<MountEntry>()?)
//!     .timeout(Duration::from_secs(10))
//!     .build()?;
//! ```
//!
//! ## Defaults
//!
//! | Field | Default |
//! |-------|---------|
//! | `timeout` | none |
//! | `workdir` | `/` |
//! | `hostname` | `jailrun-<session suffix>` |
//! | `network` | isolated (new network namespace) |
//! | `nofile` | 64 |
//! | `max_procs` | unlimited |
//! | `memory` | unlimited |
//! | `cgroup` | [`CgroupLimits::default`]: 1 GiB, 64 tasks, cpu weight 256, io weight 50 |
//! | `env` | `PATH`, `HOME`, `LANG`, `TERM` |

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::isolation::CgroupLimits;
use crate::validate::{ValidationError, normalize_guest, validate_cmd, validate_hostname};

/// A host directory exposed at a path inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    /// Directory on the host.
    pub host: PathBuf,
    /// Absolute path inside the sandbox.
    pub guest: PathBuf,
    /// Remount read-only after binding.
    pub read_only: bool,
}

impl MountEntry {
    /// Read-write bind entry.
    pub fn new(host: impl Into<PathBuf>, guest: impl Into<PathBuf>) -> Self {
        Self {
            host: host.into(),
            guest: guest.into(),
            read_only: false,
        }
    }

    /// Make the entry read-only.
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

impl FromStr for MountEntry {
    type Err = ValidationError;

    /// Parse `host:guest`, `host:guest:ro` or `host:guest:rw`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || ValidationError::MalformedEntry(s.into());
        let mut parts = s.split(':');
        let host = parts.next().filter(|p| !p.is_empty()).ok_or_else(malformed)?;
        let guest = parts.next().filter(|p| !p.is_empty()).ok_or_else(malformed)?;
        let read_only = match parts.next() {
            None | Some("rw") => false,
            Some("ro") => true,
            Some(_) => return Err(malformed()),
        };
        if parts.next().is_some() {
            return Err(malformed());
        }

        let entry = Self::new(host, guest);
        Ok(if read_only { entry.read_only() } else { entry })
    }
}

/// Resource limits applied in the child before the command starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// `RLIMIT_NOFILE`.
    pub nofile: u64,
    /// `RLIMIT_NPROC`, counted per real uid across the host.
    pub max_procs: Option<u64>,
    /// `RLIMIT_DATA` in bytes.
    pub memory: Option<u64>,
    /// Per-session cgroup; `None` runs without one.
    pub cgroup: Option<CgroupLimits>,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            nofile: 64,
            max_procs: None,
            memory: None,
            cgroup: Some(CgroupLimits::default()),
        }
    }
}

/// External enforcement tool and its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSpec {
    pub path: PathBuf,
    pub args: Vec<String>,
}

/// Validated, immutable description of one sandboxed invocation.
#[derive(Debug, Clone)]
pub struct SandboxRequest {
    argv: Vec<String>,
    mount_root: PathBuf,
    uid: u32,
    entries: Vec<MountEntry>,
    tool: ToolSpec,
    timeout: Option<Duration>,
    env: BTreeMap<String, String>,
    workdir: PathBuf,
    hostname: Option<String>,
    share_net: bool,
    limits: Limits,
}

impl SandboxRequest {
    /// Start building a request.
    pub fn builder(
        argv: impl IntoIterator<Item = impl Into<String>>,
        mount_root: impl Into<PathBuf>,
        uid: u32,
        tool: impl Into<PathBuf>,
    ) -> RequestBuilder {
        RequestBuilder {
            argv: argv.into_iter().map(Into::into).collect(),
            mount_root: mount_root.into(),
            uid,
            entries: Vec::new(),
            tool: ToolSpec {
                path: tool.into(),
                args: Vec::new(),
            },
            timeout: None,
            env: default_env(),
            workdir: PathBuf::from("/"),
            hostname: None,
            share_net: false,
            limits: Limits::default(),
        }
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn mount_root(&self) -> &Path {
        &self.mount_root
    }

    /// Target uid; the gid is the same number.
    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn entries(&self) -> &[MountEntry] {
        &self.entries
    }

    pub fn tool(&self) -> &ToolSpec {
        &self.tool
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Explicit hostname, if the caller set one.
    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    pub fn share_net(&self) -> bool {
        self.share_net
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }
}

/// Builder for [`SandboxRequest`].
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    argv: Vec<String>,
    mount_root: PathBuf,
    uid: u32,
    entries: Vec<MountEntry>,
    tool: ToolSpec,
    timeout: Option<Duration>,
    env: BTreeMap<String, String>,
    workdir: PathBuf,
    hostname: Option<String>,
    share_net: bool,
    limits: Limits,
}

impl RequestBuilder {
    pub fn entry(mut self, entry: MountEntry) -> Self {
        self.entries.push(entry);
        self
    }

    /// Add multiple entries from an iterator.
    pub fn entries(mut self, entries: impl IntoIterator<Item = MountEntry>) -> Self {
        self.entries.extend(entries);
        self
    }

    pub fn tool_arg(mut self, arg: impl Into<String>) -> Self {
        self.tool.args.push(arg.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = workdir.into();
        self
    }

    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Keep the host network namespace instead of an empty one.
    pub fn share_net(mut self, share: bool) -> Self {
        self.share_net = share;
        self
    }

    pub fn nofile(mut self, nofile: u64) -> Self {
        self.limits.nofile = nofile;
        self
    }

    pub fn max_procs(mut self, max: u64) -> Self {
        self.limits.max_procs = Some(max);
        self
    }

    pub fn memory(mut self, bytes: u64) -> Self {
        self.limits.memory = Some(bytes);
        self
    }

    /// Replace the cgroup limits, or run without a cgroup.
    pub fn cgroup(mut self, limits: Option<CgroupLimits>) -> Self {
        self.limits.cgroup = limits;
        self
    }

    /// Validate and freeze the request.
    pub fn build(self) -> Result<SandboxRequest, ValidationError> {
        let argv: Vec<&str> = self.argv.iter().map(String::as_str).collect();
        validate_cmd(&argv)?;

        for entry in &self.entries {
            normalize_guest(&entry.guest)?;
            if entry.host.as_os_str().is_empty() {
                return Err(ValidationError::EmptyPath);
            }
        }

        if !self.workdir.is_absolute() {
            return Err(ValidationError::RelativePath(
                self.workdir.to_string_lossy().into_owned(),
            ));
        }

        if let Some(name) = &self.hostname {
            validate_hostname(name)?;
        }

        for (key, value) in &self.env {
            if key.is_empty() || key.contains(['=', '\0']) || value.contains('\0') {
                return Err(ValidationError::Environment(format!("{key}={value}")));
            }
        }

        if let Some(cgroup) = &self.limits.cgroup {
            if cgroup.memory_max == 0 {
                return Err(ValidationError::Limit("cgroup memory"));
            }
            if cgroup.pids_max == 0 {
                return Err(ValidationError::Limit("cgroup pids"));
            }
            if !(1..=10_000).contains(&cgroup.cpu_weight) {
                return Err(ValidationError::Limit("cgroup cpu weight"));
            }
            if !(1..=10_000).contains(&cgroup.io_weight) {
                return Err(ValidationError::Limit("cgroup io weight"));
            }
        }

        if self.tool.path.as_os_str().is_empty() {
            return Err(ValidationError::EmptyPath);
        }

        Ok(SandboxRequest {
            argv: self.argv,
            mount_root: self.mount_root,
            uid: self.uid,
            entries: self.entries,
            tool: self.tool,
            timeout: self.timeout,
            env: self.env,
            workdir: self.workdir,
            hostname: self.hostname,
            share_net: self.share_net,
            limits: self.limits,
        })
    }
}

/// Split a `--command` string on ASCII whitespace.
pub fn split_command(command: &str) -> Vec<String> {
    command.split_ascii_whitespace().map(Into::into).collect()
}

fn default_env() -> BTreeMap<String, String> {
    let term = std::env::var("TERM").unwrap_or_else(|_| "dumb".into());
    BTreeMap::from([
        (
            "PATH".into(),
            "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".into(),
        ),
        ("HOME".into(), "/".into()),
        ("LANG".into(), "C.UTF-8".into()),
        ("TERM".into(), term),
    ])
}
