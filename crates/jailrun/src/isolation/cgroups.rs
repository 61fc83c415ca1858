//! Cgroup v2 resource limits for one session.
//!
//! Every session gets `<root>/jailrun/<session id>`. The runner moves the
//! sandboxed child in right after the clone, before releasing it to exec,
//! so everything the command starts is accounted there.
//!
//! | File | Default | Controller |
//! |------|---------|------------|
//! | `memory.max` | 1 GiB | required |
//! | `pids.max` | 64 | required |
//! | `cpu.weight` | 256 | if available |
//! | `io.weight` | 50 | if available |
//!
//! Teardown kills whatever is left through `cgroup.kill` and removes the
//! directory. The shared `jailrun` parent stays.

use std::fs;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::SetupError;

/// Mount point of the unified hierarchy.
pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";

const PARENT: &str = "jailrun";
const CGROUP2_SUPER_MAGIC: i64 = 0x6367_7270;

/// How long a removal waits for the last tasks to leave.
const REMOVE_TIMEOUT: Duration = Duration::from_secs(2);

/// Limits written into the session's cgroup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CgroupLimits {
    /// `memory.max` in bytes.
    pub memory_max: u64,
    /// `pids.max`.
    pub pids_max: u64,
    /// `cpu.weight`, 1..=10000.
    pub cpu_weight: u32,
    /// `io.weight`, 1..=10000.
    pub io_weight: u32,
}

impl Default for CgroupLimits {
    fn default() -> Self {
        Self {
            memory_max: 1024 * 1024 * 1024,
            pids_max: 64,
            cpu_weight: 256,
            io_weight: 50,
        }
    }
}

/// Whether `root` is a cgroup2 mount.
pub fn cgroup2_mounted(root: &Path) -> bool {
    rustix::fs::statfs(root).is_ok_and(|st| st.f_type as i64 == CGROUP2_SUPER_MAGIC)
}

fn failed(path: &Path) -> impl FnOnce(io::Error) -> SetupError + '_ {
    move |source| SetupError::Cgroup {
        path: path.to_path_buf(),
        source,
    }
}

impl CgroupLimits {
    /// Create the session's cgroup under `root` and write the limits.
    pub fn create(&self, root: &Path, session: &str) -> Result<SessionCgroup, SetupError> {
        tracing::debug!(
            session,
            memory = self.memory_max,
            pids = self.pids_max,
            cpu = self.cpu_weight,
            io = self.io_weight,
            "creating cgroup"
        );

        let available = controllers(root)?;
        for required in ["memory", "pids"] {
            if !available.iter().any(|c| c == required) {
                return Err(SetupError::Cgroup {
                    path: root.to_path_buf(),
                    source: io::Error::other(format!("{required} controller unavailable")),
                });
            }
        }
        let wanted: Vec<&str> = ["memory", "pids", "cpu", "io"]
            .into_iter()
            .filter(|c| available.iter().any(|a| a == c))
            .collect();

        let parent = root.join(PARENT);
        match fs::create_dir(&parent) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(failed(&parent)(e)),
        }
        enable_controllers(root, &wanted)?;
        enable_controllers(&parent, &wanted)?;

        let path = parent.join(session);
        fs::create_dir(&path).map_err(failed(&path))?;
        let cgroup = SessionCgroup { path };

        cgroup.write("memory.max", self.memory_max)?;
        cgroup.write("pids.max", self.pids_max)?;
        if wanted.contains(&"cpu") {
            cgroup.write("cpu.weight", self.cpu_weight)?;
        }
        if wanted.contains(&"io") {
            cgroup.write("io.weight", self.io_weight)?;
        }
        Ok(cgroup)
    }
}

fn controllers(dir: &Path) -> Result<Vec<String>, SetupError> {
    let path = dir.join("cgroup.controllers");
    let text = fs::read_to_string(&path).map_err(failed(&path))?;
    Ok(text.split_whitespace().map(str::to_owned).collect())
}

fn enable_controllers(dir: &Path, wanted: &[&str]) -> Result<(), SetupError> {
    let path = dir.join("cgroup.subtree_control");
    let current = fs::read_to_string(&path).unwrap_or_default();
    let missing: Vec<String> = wanted
        .iter()
        .filter(|c| !current.split_whitespace().any(|have| have == **c))
        .map(|c| format!("+{c}"))
        .collect();
    if missing.is_empty() {
        return Ok(());
    }
    fs::write(&path, missing.join(" ")).map_err(failed(&path))
}

/// A session's cgroup directory.
#[derive(Debug)]
pub struct SessionCgroup {
    path: PathBuf,
}

impl SessionCgroup {
    #[cfg(test)]
    pub(crate) fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self, file: &str, value: impl ToString) -> Result<(), SetupError> {
        let path = self.path.join(file);
        fs::write(&path, value.to_string()).map_err(failed(&path))
    }

    /// Move process `pid` (and its future children) into the cgroup.
    pub fn add_process(&self, pid: u32) -> Result<(), SetupError> {
        tracing::debug!(cgroup = %self.path.display(), pid, "adding process to cgroup");
        self.write("cgroup.procs", pid)
    }

    /// `oom_kill` count from `memory.events`.
    pub fn oom_kills(&self) -> u64 {
        fs::read_to_string(self.path.join("memory.events"))
            .map(|text| oom_kill_count(&text))
            .unwrap_or(0)
    }

    /// Kill what is left and remove the directory.
    pub fn remove(self) -> io::Result<()> {
        tracing::debug!(cgroup = %self.path.display(), "removing cgroup");
        let killed = fs::OpenOptions::new()
            .write(true)
            .open(self.path.join("cgroup.kill"))
            .and_then(|mut file| file.write_all(b"1"));
        if let Err(e) = killed {
            tracing::debug!(error = %e, "cgroup.kill");
        }
        let deadline = Instant::now() + REMOVE_TIMEOUT;
        loop {
            match fs::remove_dir(&self.path) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
                Err(e) if e.raw_os_error() == Some(libc::EBUSY) && Instant::now() < deadline => {
                    thread::sleep(Duration::from_millis(10));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn oom_kill_count(events: &str) -> u64 {
    events
        .lines()
        .find_map(|line| line.strip_prefix("oom_kill "))
        .and_then(|count| count.trim().parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A directory shaped like a cgroup2 root offering `controllers`.
    fn fake_root(controllers: &str) -> tempfile::TempDir {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join("cgroup.controllers"), controllers).unwrap();
        fs::write(root.path().join("cgroup.subtree_control"), "").unwrap();
        root
    }

    fn read(path: &Path) -> String {
        fs::read_to_string(path).unwrap()
    }

    #[test]
    fn defaults() {
        let limits = CgroupLimits::default();
        assert_eq!(limits.memory_max, 1 << 30);
        assert_eq!(limits.pids_max, 64);
        assert_eq!(limits.cpu_weight, 256);
        assert_eq!(limits.io_weight, 50);
    }

    #[test]
    fn limits_written() {
        let root = fake_root("cpuset cpu io memory hugetlb pids rdma misc\n");
        let cgroup = CgroupLimits::default().create(root.path(), "0badcafe").unwrap();

        assert_eq!(cgroup.path(), root.path().join("jailrun/0badcafe"));
        assert_eq!(read(&cgroup.path().join("memory.max")), "1073741824");
        assert_eq!(read(&cgroup.path().join("pids.max")), "64");
        assert_eq!(read(&cgroup.path().join("cpu.weight")), "256");
        assert_eq!(read(&cgroup.path().join("io.weight")), "50");
        assert_eq!(
            read(&root.path().join("cgroup.subtree_control")),
            "+memory +pids +cpu +io"
        );

        cgroup.add_process(4242).unwrap();
        assert_eq!(read(&cgroup.path().join("cgroup.procs")), "4242");
    }

    #[test]
    fn optional_controllers_skipped() {
        let root = fake_root("memory pids\n");
        fs::write(root.path().join("cgroup.subtree_control"), "memory pids\n").unwrap();
        let cgroup = CgroupLimits::default().create(root.path(), "s").unwrap();
        assert!(!cgroup.path().join("cpu.weight").exists());
        assert!(!cgroup.path().join("io.weight").exists());
        // already enabled at the root
        assert_eq!(read(&root.path().join("cgroup.subtree_control")), "memory pids\n");
    }

    #[test]
    fn required_controller_missing() {
        let root = fake_root("cpu io memory\n");
        let err = CgroupLimits::default().create(root.path(), "s").unwrap_err();
        assert!(err.to_string().contains("pids controller unavailable"), "{err}");
        assert!(!root.path().join("jailrun/s").exists());
    }

    #[test]
    fn session_cgroup_is_not_reused() {
        let root = fake_root("memory pids\n");
        let _first = CgroupLimits::default().create(root.path(), "same").unwrap();
        assert!(matches!(
            CgroupLimits::default().create(root.path(), "same"),
            Err(SetupError::Cgroup { .. })
        ));
    }

    #[test]
    fn oom_kills_parsed() {
        let events = "low 0\nhigh 0\nmax 12\noom 2\noom_kill 1\noom_group_kill 0\n";
        assert_eq!(oom_kill_count(events), 1);
        assert_eq!(oom_kill_count("low 0\n"), 0);
    }

    #[test]
    fn not_a_cgroup_mount() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!cgroup2_mounted(dir.path()));
    }
}
