//! Common utilities for end-to-end tests.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use jailrun::isolation::{CGROUP_ROOT, cgroup2_mounted};
use jailrun::{MountEntry, RequestBuilder, SandboxRequest};
use tempfile::TempDir;

/// Unprivileged identity used for most runs.
pub const NOBODY: u32 = 65534;

pub fn jailrun_bin() -> &'static str {
    env!("CARGO_BIN_EXE_jailrun")
}

pub fn oracle_bin() -> &'static str {
    env!("CARGO_BIN_EXE_jailrun-oracle")
}

/// Root on a supported host; prints why not otherwise.
pub fn privileged() -> bool {
    if unsafe { libc::geteuid() } != 0 {
        eprintln!("Skipping: needs root");
        return false;
    }
    if let Err(reason) = host_supported() {
        eprintln!("Skipping: {reason}");
        return false;
    }
    true
}

/// Whether the kernel supports the sandbox, with the reason if not.
pub fn host_supported() -> Result<(), String> {
    // Launcher reports an unsupported system as a setup error before doing
    // anything else, so probing with an empty root is cheap.
    let probe = TempDir::new().map_err(|e| e.to_string())?;
    let request = SandboxRequest::builder(["/bin/true"], probe.path().join("absent"), 0, "/bin/cat")
        .build()
        .map_err(|e| e.to_string())?;
    match jailrun::Launcher::new().run(&request) {
        Err(jailrun::SandboxError::Setup(jailrun::SetupError::Unsupported(reason))) => Err(reason),
        _ => Ok(()),
    }
}

/// Whether runs can get a session cgroup here. Runs go without one if not.
pub fn cgroups_usable() -> bool {
    let root = Path::new(CGROUP_ROOT);
    cgroup2_mounted(root)
        && fs::read_to_string(root.join("cgroup.controllers")).is_ok_and(|controllers| {
            let controllers: Vec<&str> = controllers.split_whitespace().collect();
            controllers.contains(&"memory") && controllers.contains(&"pids")
        })
}

/// Host mount table, without the per-line ids that change on remount.
pub fn host_mounts() -> Vec<String> {
    let mut mounts: Vec<String> = fs::read_to_string("/proc/self/mountinfo")
        .unwrap()
        .lines()
        .map(|line| line.split_whitespace().skip(3).take(2).collect::<Vec<_>>().join(" "))
        .collect();
    mounts.sort();
    mounts
}

/// A mount root plus a world-writable scratch directory that the sandbox
/// sees at `/tmp/lim`. The root is empty unless built with
/// [`Fixture::with_proc`].
pub struct Fixture {
    pub root: TempDir,
    pub scratch: TempDir,
}

impl Fixture {
    /// A root with no `/proc`: the sandbox gets no procfs.
    pub fn new() -> Self {
        let root = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        fs::set_permissions(root.path(), fs::Permissions::from_mode(0o755)).unwrap();
        fs::set_permissions(scratch.path(), fs::Permissions::from_mode(0o777)).unwrap();
        Self { root, scratch }
    }

    /// A root with an empty `/proc`, where the sandbox mounts its procfs.
    pub fn with_proc() -> Self {
        let fixture = Self::new();
        let proc = fixture.root.path().join("proc");
        fs::create_dir(&proc).unwrap();
        fs::set_permissions(&proc, fs::Permissions::from_mode(0o555)).unwrap();
        fixture
    }

    pub fn has_proc(&self) -> bool {
        self.root.path().join("proc").is_dir()
    }

    /// System directories, read-only, and the scratch directory.
    pub fn entries(&self) -> Vec<MountEntry> {
        let mut entries: Vec<MountEntry> = ["/usr", "/bin", "/lib", "/lib64", "/sbin"]
            .into_iter()
            .filter(|dir| Path::new(dir).is_dir())
            .map(|dir| MountEntry::new(dir, dir).read_only())
            .collect();
        entries.push(MountEntry::new(self.scratch.path(), "/tmp/lim"));
        entries
    }

    pub fn request<'a>(
        &self,
        argv: impl IntoIterator<Item = &'a str>,
        uid: u32,
        tool_args: &[&str],
    ) -> RequestBuilder {
        let mut builder = SandboxRequest::builder(argv, self.root.path(), uid, oracle_bin())
            .entries(self.entries())
            .workdir("/tmp/lim");
        if !cgroups_usable() {
            builder = builder.cgroup(None);
        }
        for arg in tool_args {
            builder = builder.tool_arg(*arg);
        }
        builder
    }

    /// The same run through the `jailrun` binary.
    pub fn command(&self, cmdline: &str, uid: u32) -> Command {
        let mut cmd = Command::new(jailrun_bin());
        cmd.args(["-c", cmdline, "-t", oracle_bin(), "-u"])
            .arg(uid.to_string())
            .arg("-m")
            .arg(self.root.path());
        if !cgroups_usable() {
            cmd.arg("--no-cgroup");
        }
        for entry in self.entries() {
            let flag = if entry.read_only { ":ro" } else { "" };
            cmd.arg("-a").arg(format!(
                "{}:{}{flag}",
                entry.host.display(),
                entry.guest.display()
            ));
        }
        cmd
    }

    pub fn scratch_file(&self, name: &str) -> PathBuf {
        self.scratch.path().join(name)
    }

    pub fn read_scratch(&self, name: &str) -> String {
        fs::read_to_string(self.scratch_file(name)).unwrap()
    }

    /// Entries of the mount root left on the host, besides `/proc` when the
    /// fixture brought one.
    pub fn root_leftovers(&self) -> Vec<PathBuf> {
        let proc = self.root.path().join("proc");
        fs::read_dir(self.root.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|path| !(self.has_proc() && *path == proc))
            .collect()
    }
}
