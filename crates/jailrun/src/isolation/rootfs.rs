//! Root filesystem switch for the sandboxed child.
//!
//! Runs inside the child's fresh mount namespace:
//!
//! 1. Remount `/` recursively private so nothing propagates back to the host
//! 2. Bind the mount root onto the staging directory, then each entry
//!    (see [`crate::mounts::apply_binds`])
//! 3. `pivot_root` into the staging directory and detach the old root
//! 4. Mount a fresh `proc` at `/proc` when the directory exists
//!
//! ## Filesystem Layout (after `pivot_root`)
//!
//! ```text
//! /            → caller's mount root (bind)
//! ├── proc/    → fresh procfs for the new PID namespace (if present in root)
//! └── <guest>  → one bind per entry, read-only or read-write
//! ```

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use jailrun_sys::last_errno;
use rustix::io::Errno;
use rustix::process::pivot_root;

use crate::error::MountError;
use crate::mounts::{MountOps, MountPlan, apply_binds};

/// Mount operations backed by `mount(2)`.
#[derive(Debug, Default)]
pub struct KernelMounts;

impl MountOps for KernelMounts {
    fn bind(&mut self, host: &Path, target: &Path, read_only: bool) -> Result<(), Errno> {
        bind_mount(host, target, read_only)
    }

    fn unmount(&mut self, target: &Path) -> Result<(), Errno> {
        unmount(target)
    }
}

/// Build the isolated view and switch into it.
pub fn enter_view(plan: &MountPlan, staging: &Path) -> Result<(), MountError> {
    make_rprivate().map_err(|errno| MountError::Step {
        step: "make / private",
        errno,
    })?;

    let mut ops = KernelMounts;
    let stack = apply_binds(&mut ops, staging, plan)?;

    // Binds stay armed until the pivot succeeds.
    pivot_root_into(staging).map_err(|errno| MountError::Step {
        step: "pivot_root",
        errno,
    })?;
    stack.commit();

    detach_old_root().map_err(|errno| MountError::Step {
        step: "detach old root",
        errno,
    })?;

    if Path::new("/proc").is_dir() {
        mount_proc(Path::new("/proc")).map_err(|errno| MountError::Step {
            step: "mount /proc",
            errno,
        })?;
    }
    Ok(())
}

/// Make all mounts private recursively.
pub fn make_rprivate() -> Result<(), Errno> {
    let ret = unsafe {
        libc::mount(
            std::ptr::null(),
            c"/".as_ptr(),
            std::ptr::null(),
            libc::MS_REC | libc::MS_PRIVATE,
            std::ptr::null(),
        )
    };
    if ret != 0 { Err(last_errno()) } else { Ok(()) }
}

/// Mount a fresh proc filesystem for the current PID namespace.
pub fn mount_proc(target: &Path) -> Result<(), Errno> {
    let target_c = path_to_cstring(target)?;
    let ret = unsafe {
        libc::mount(
            c"proc".as_ptr(),
            target_c.as_ptr(),
            c"proc".as_ptr(),
            libc::MS_NOSUID | libc::MS_NODEV | libc::MS_NOEXEC,
            std::ptr::null(),
        )
    };
    if ret != 0 { Err(last_errno()) } else { Ok(()) }
}

/// Bind mount a path, optionally remounting it read-only.
///
/// If the read-only remount fails, the bind is undone before returning.
pub fn bind_mount(source: &Path, target: &Path, readonly: bool) -> Result<(), Errno> {
    let source_c = path_to_cstring(source)?;
    let target_c = path_to_cstring(target)?;

    let ret = unsafe {
        libc::mount(
            source_c.as_ptr(),
            target_c.as_ptr(),
            std::ptr::null(),
            libc::MS_BIND | libc::MS_REC,
            std::ptr::null(),
        )
    };
    if ret != 0 {
        return Err(last_errno());
    }

    if readonly {
        let ret = unsafe {
            libc::mount(
                std::ptr::null(),
                target_c.as_ptr(),
                std::ptr::null(),
                libc::MS_BIND | libc::MS_REMOUNT | libc::MS_RDONLY,
                std::ptr::null(),
            )
        };
        if ret != 0 {
            let errno = last_errno();
            unsafe { libc::umount2(target_c.as_ptr(), libc::MNT_DETACH) };
            return Err(errno);
        }
    }

    Ok(())
}

/// Lazily unmount a path.
pub fn unmount(target: &Path) -> Result<(), Errno> {
    let target_c = path_to_cstring(target)?;
    if unsafe { libc::umount2(target_c.as_ptr(), libc::MNT_DETACH) } != 0 {
        Err(last_errno())
    } else {
        Ok(())
    }
}

/// `pivot_root` into `new_root`, which must already be a mount point.
///
/// Uses `pivot_root(".", ".")`: the old root ends up stacked on top of the new
/// one, so no directory has to be created inside the caller's tree.
fn pivot_root_into(new_root: &Path) -> Result<(), Errno> {
    let new_root_c = path_to_cstring(new_root)?;
    if unsafe { libc::chdir(new_root_c.as_ptr()) } != 0 {
        return Err(last_errno());
    }
    pivot_root(c".", c".")
}

/// Detach the old root stacked on `/` after `pivot_root`.
fn detach_old_root() -> Result<(), Errno> {
    if unsafe { libc::umount2(c".".as_ptr(), libc::MNT_DETACH) } != 0 {
        return Err(last_errno());
    }
    if unsafe { libc::chdir(c"/".as_ptr()) } != 0 {
        return Err(last_errno());
    }
    Ok(())
}

#[inline]
fn path_to_cstring(path: &Path) -> Result<CString, Errno> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| Errno::INVAL)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_to_cstring_valid() {
        let cstr = path_to_cstring(Path::new("/tmp/test")).unwrap();
        assert_eq!(cstr.as_bytes(), b"/tmp/test");
    }

    #[test]
    fn path_to_cstring_rejects_nul() {
        use std::ffi::OsStr;
        let path = Path::new(OsStr::from_bytes(b"/tmp/a\0b"));
        assert_eq!(path_to_cstring(path), Err(Errno::INVAL));
    }
}
