//! Mount view planning and bind reversal.
//!
//! Mount setup is split across the fork:
//!
//! - **Parent** ([`prepare`]): checks the mount root, resolves every guest path
//!   against the real tree (lexical normalization, then symlink
//!   canonicalization of each existing prefix), and creates missing mount
//!   points. Every directory it creates is recorded in the [`MountPlan`] and
//!   removed again at teardown, deepest first.
//! - **Child** ([`apply_binds`]): binds the root onto the staging directory and
//!   each entry beneath it, through a [`ReversalStack`]. If any bind fails, the
//!   binds already made are unmounted in reverse order before the error
//!   surfaces.
//!
//! Entries nested under an earlier entry's guest path are resolved inside that
//! entry's host directory, since that is what the guest sees at that point.

use std::fs;
use std::io;
use std::mem;
use std::path::{Component, Path, PathBuf};

use rustix::io::Errno;

use crate::error::MountError;
use crate::request::MountEntry;
use crate::validate::normalize_guest;

/// A bind resolved against the host tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedBind {
    /// Canonical host directory.
    pub host: PathBuf,
    /// Mount point relative to the sandbox root.
    pub target: PathBuf,
    pub read_only: bool,
    guest: PathBuf,
}

/// Parent-side result of mount planning.
#[derive(Debug, Default)]
pub struct MountPlan {
    root: PathBuf,
    binds: Vec<PreparedBind>,
    created: Vec<PathBuf>,
}

impl MountPlan {
    /// Canonical mount root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn binds(&self) -> &[PreparedBind] {
        &self.binds
    }

    /// Mount points created on the host, in creation order.
    pub fn created_dirs(&self) -> &[PathBuf] {
        &self.created
    }

    /// Remove every mount point this plan created, deepest first.
    ///
    /// Idempotent: the record is drained.
    pub fn remove_created_dirs(&mut self) {
        for dir in mem::take(&mut self.created).into_iter().rev() {
            if let Err(e) = fs::remove_dir(&dir) {
                tracing::warn!(path = %dir.display(), error = %e, "failed to remove mount point");
            } else {
                tracing::debug!(path = %dir.display(), "removed mount point");
            }
        }
    }

    fn add(&mut self, entry: &MountEntry) -> Result<(), MountError> {
        let host = fs::canonicalize(&entry.host)
            .ok()
            .filter(|p| p.is_dir())
            .ok_or_else(|| MountError::HostNotDirectory(entry.host.clone()))?;

        let guest = normalize_guest(&entry.guest)
            .map_err(|_| MountError::GuestEscape(entry.guest.clone()))?;

        // The innermost earlier entry whose guest path contains this one.
        let parent = self
            .binds
            .iter()
            .rev()
            .find(|b| guest != b.guest && guest.starts_with(&b.guest));

        let (base, prefix, rel) = match parent {
            Some(b) => (
                b.host.clone(),
                b.target.clone(),
                guest.strip_prefix(&b.guest).map(Path::to_path_buf).unwrap_or_default(),
            ),
            None => (self.root.clone(), PathBuf::new(), guest.clone()),
        };

        let (existing, missing) = resolve_existing(&base, &rel, &entry.guest)?;
        let mut target = prefix.join(existing.strip_prefix(&base).unwrap_or(Path::new("")));

        let mut dir = existing;
        for name in missing {
            dir.push(&name);
            target.push(&name);
            fs::create_dir(&dir).map_err(|source| MountError::CreateMountPoint {
                path: dir.clone(),
                source,
            })?;
            tracing::debug!(path = %dir.display(), "created mount point");
            self.created.push(dir.clone());
        }

        self.binds.push(PreparedBind {
            host,
            target,
            read_only: entry.read_only,
            guest,
        });
        Ok(())
    }
}

/// Check the mount root and resolve every entry against the host tree.
///
/// On failure, mount points created so far are removed before returning.
pub fn prepare(root: &Path, entries: &[MountEntry]) -> Result<MountPlan, MountError> {
    let meta = fs::metadata(root).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => MountError::RootMissing(root.to_path_buf()),
        _ => MountError::Io(e),
    })?;
    if !meta.is_dir() {
        return Err(MountError::RootNotDirectory(root.to_path_buf()));
    }

    let mut plan = MountPlan {
        root: fs::canonicalize(root)?,
        ..MountPlan::default()
    };

    for entry in entries {
        if let Err(e) = plan.add(entry) {
            plan.remove_created_dirs();
            return Err(e);
        }
    }
    Ok(plan)
}

/// Walk `rel` below `base`, canonicalizing each existing prefix.
///
/// Returns the deepest existing directory and the names still missing.
fn resolve_existing(
    base: &Path,
    rel: &Path,
    guest: &Path,
) -> Result<(PathBuf, Vec<PathBuf>), MountError> {
    let mut existing = base.to_path_buf();
    let mut components = rel.components();

    while let Some(component) = components.next() {
        let Component::Normal(name) = component else {
            return Err(MountError::GuestEscape(guest.to_path_buf()));
        };
        let candidate = existing.join(name);
        match fs::symlink_metadata(&candidate) {
            Ok(_) => {
                let canonical = fs::canonicalize(&candidate)
                    .map_err(|_| MountError::GuestNotDirectory(guest.to_path_buf()))?;
                if !canonical.starts_with(base) {
                    return Err(MountError::GuestEscape(guest.to_path_buf()));
                }
                existing = canonical;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if !existing.is_dir() {
                    return Err(MountError::GuestNotDirectory(guest.to_path_buf()));
                }
                let mut missing = vec![PathBuf::from(name)];
                missing.extend(components.by_ref().map(|c| PathBuf::from(c.as_os_str())));
                return Ok((existing, missing));
            }
            Err(e) if e.raw_os_error() == Some(libc::ENOTDIR) => {
                return Err(MountError::GuestNotDirectory(guest.to_path_buf()));
            }
            Err(e) => return Err(MountError::Io(e)),
        }
    }

    if !existing.is_dir() {
        return Err(MountError::GuestNotDirectory(guest.to_path_buf()));
    }
    Ok((existing, Vec::new()))
}

/// Kernel mount operations, abstracted so rollback can be exercised without
/// privilege.
pub trait MountOps {
    fn bind(&mut self, host: &Path, target: &Path, read_only: bool) -> Result<(), Errno>;
    fn unmount(&mut self, target: &Path) -> Result<(), Errno>;
}

/// Stack of active binds, unwound in reverse on drop unless committed.
pub struct ReversalStack<'a, O: MountOps> {
    ops: &'a mut O,
    active: Vec<PathBuf>,
}

impl<'a, O: MountOps> ReversalStack<'a, O> {
    pub fn new(ops: &'a mut O) -> Self {
        Self {
            ops,
            active: Vec::new(),
        }
    }

    /// Bind and push the reversal on success.
    pub fn bind(&mut self, host: &Path, target: &Path, read_only: bool) -> Result<(), Errno> {
        self.ops.bind(host, target, read_only)?;
        self.active.push(target.to_path_buf());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Unmount every active bind, most recent first.
    pub fn unwind(&mut self) {
        while let Some(target) = self.active.pop() {
            if let Err(e) = self.ops.unmount(&target) {
                tracing::warn!(target = %target.display(), error = %e, "failed to reverse bind");
            }
        }
    }

    /// Keep the binds. Returns their targets in bind order.
    pub fn commit(mut self) -> Vec<PathBuf> {
        mem::take(&mut self.active)
    }
}

impl<O: MountOps> Drop for ReversalStack<'_, O> {
    fn drop(&mut self) {
        self.unwind();
    }
}

/// Bind the mount root onto `staging`, then every planned entry beneath it.
///
/// The returned stack is still armed: the caller commits it once the view is
/// in place.
pub fn apply_binds<'a, O: MountOps>(
    ops: &'a mut O,
    staging: &Path,
    plan: &MountPlan,
) -> Result<ReversalStack<'a, O>, MountError> {
    let mut stack = ReversalStack::new(ops);

    stack
        .bind(plan.root(), staging, false)
        .map_err(|errno| MountError::Bind {
            host: plan.root().to_path_buf(),
            guest: PathBuf::from("/"),
            errno,
        })?;

    for bind in plan.binds() {
        let target = staging.join(&bind.target);
        stack
            .bind(&bind.host, &target, bind.read_only)
            .map_err(|errno| MountError::Bind {
                host: bind.host.clone(),
                guest: Path::new("/").join(&bind.guest),
                errno,
            })?;
    }

    Ok(stack)
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::symlink;

    use tempfile::TempDir;

    use super::*;

    #[derive(Default)]
    struct FakeMounts {
        fail_on: Option<usize>,
        bound: Vec<PathBuf>,
        unmounted: Vec<PathBuf>,
    }

    impl MountOps for FakeMounts {
        fn bind(&mut self, _host: &Path, target: &Path, _ro: bool) -> Result<(), Errno> {
            if self.fail_on == Some(self.bound.len()) {
                return Err(Errno::PERM);
            }
            self.bound.push(target.to_path_buf());
            Ok(())
        }

        fn unmount(&mut self, target: &Path) -> Result<(), Errno> {
            self.unmounted.push(target.to_path_buf());
            Ok(())
        }
    }

    struct Fixture {
        _dir: TempDir,
        root: PathBuf,
        host: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("root");
        let host = dir.path().join("src");
        fs::create_dir_all(root.join("tmp")).unwrap();
        fs::create_dir_all(&host).unwrap();
        Fixture {
            root: fs::canonicalize(root).unwrap(),
            host: fs::canonicalize(host).unwrap(),
            _dir: dir,
        }
    }

    fn plan_created_nothing(root: &Path) -> bool {
        let mut names: Vec<_> = fs::read_dir(root)
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        names.sort();
        names == ["etc-link", "tmp"]
    }

    #[test]
    fn root_missing() {
        let err = prepare(Path::new("/nonexistent/jailrun-root"), &[]).unwrap_err();
        assert!(matches!(err, MountError::RootMissing(_)));
    }

    #[test]
    fn root_not_directory() {
        let fx = fixture();
        let file = fx.root.join("file");
        fs::write(&file, b"x").unwrap();
        assert!(matches!(
            prepare(&file, &[]).unwrap_err(),
            MountError::RootNotDirectory(_)
        ));
    }

    #[test]
    fn creates_and_records_mount_points() {
        let fx = fixture();
        let entries = [MountEntry::new(&fx.host, "/tmp/lim/deep")];
        let mut plan = prepare(&fx.root, &entries).unwrap();

        assert_eq!(
            plan.created_dirs(),
            &[fx.root.join("tmp/lim"), fx.root.join("tmp/lim/deep")]
        );
        assert_eq!(plan.binds()[0].target, PathBuf::from("tmp/lim/deep"));
        assert!(fx.root.join("tmp/lim/deep").is_dir());

        plan.remove_created_dirs();
        assert!(!fx.root.join("tmp/lim").exists());
        assert!(fx.root.join("tmp").is_dir());
        // Second call is a no-op.
        plan.remove_created_dirs();
    }

    #[test]
    fn existing_mount_point_not_recorded() {
        let fx = fixture();
        let plan = prepare(&fx.root, &[MountEntry::new(&fx.host, "/tmp")]).unwrap();
        assert!(plan.created_dirs().is_empty());
        assert_eq!(plan.binds()[0].target, PathBuf::from("tmp"));
    }

    #[test]
    fn symlink_escape_rejected() {
        let fx = fixture();
        symlink("/etc", fx.root.join("etc-link")).unwrap();
        let err = prepare(&fx.root, &[MountEntry::new(&fx.host, "/etc-link/sub")]).unwrap_err();
        assert!(matches!(err, MountError::GuestEscape(_)));
        assert!(plan_created_nothing(&fx.root));
    }

    #[test]
    fn symlink_within_root_followed() {
        let fx = fixture();
        symlink("tmp", fx.root.join("scratch")).unwrap();
        let plan = prepare(&fx.root, &[MountEntry::new(&fx.host, "/scratch/lim")]).unwrap();
        assert_eq!(plan.binds()[0].target, PathBuf::from("tmp/lim"));
    }

    #[test]
    fn dotdot_escape_rejected() {
        let fx = fixture();
        let err = prepare(&fx.root, &[MountEntry::new(&fx.host, "/tmp/../../x")]).unwrap_err();
        assert!(matches!(err, MountError::GuestEscape(_)));
    }

    #[test]
    fn missing_host_rejected() {
        let fx = fixture();
        let err = prepare(&fx.root, &[MountEntry::new("/nonexistent/src", "/tmp/x")]).unwrap_err();
        assert!(matches!(err, MountError::HostNotDirectory(_)));
    }

    #[test]
    fn failed_entry_removes_earlier_mount_points() {
        let fx = fixture();
        let entries = [
            MountEntry::new(&fx.host, "/tmp/a"),
            MountEntry::new("/nonexistent/src", "/tmp/b"),
        ];
        assert!(prepare(&fx.root, &entries).is_err());
        assert!(!fx.root.join("tmp/a").exists());
    }

    #[test]
    fn nested_entry_resolved_in_outer_host() {
        let fx = fixture();
        let entries = [
            MountEntry::new(&fx.host, "/tmp/lim"),
            MountEntry::new(&fx.host, "/tmp/lim/inner"),
        ];
        let mut plan = prepare(&fx.root, &entries).unwrap();
        assert_eq!(plan.binds()[1].target, PathBuf::from("tmp/lim/inner"));
        assert!(fx.host.join("inner").is_dir());
        assert!(!fx.root.join("tmp/lim/inner").exists());
        plan.remove_created_dirs();
        assert!(!fx.host.join("inner").exists());
    }

    #[test]
    fn third_of_five_binds_fails_and_unwinds() {
        let fx = fixture();
        let entries: Vec<MountEntry> = (1..=5)
            .map(|i| MountEntry::new(&fx.host, format!("/tmp/e{i}")))
            .collect();
        let plan = prepare(&fx.root, &entries).unwrap();
        let staging = Path::new("/staging");

        // Index 0 is the root bind; entry 3 is the fourth bind call.
        let mut ops = FakeMounts {
            fail_on: Some(3),
            ..FakeMounts::default()
        };
        let err = apply_binds(&mut ops, staging, &plan).err().unwrap();
        assert!(matches!(err, MountError::Bind { .. }));

        assert_eq!(
            ops.unmounted,
            vec![
                staging.join("tmp/e2"),
                staging.join("tmp/e1"),
                staging.to_path_buf(),
            ]
        );
    }

    #[test]
    fn committed_stack_keeps_binds() {
        let fx = fixture();
        let plan = prepare(&fx.root, &[MountEntry::new(&fx.host, "/tmp/x")]).unwrap();
        let mut ops = FakeMounts::default();
        let stack = apply_binds(&mut ops, Path::new("/s"), &plan).unwrap();
        assert_eq!(stack.len(), 2);
        let targets = stack.commit();
        assert_eq!(targets, vec![PathBuf::from("/s"), PathBuf::from("/s/tmp/x")]);
        assert!(ops.unmounted.is_empty());
    }
}
