//! Process hardening applied in the child before exec.
//!
//! ## Bounding set
//!
//! Capabilities that could undo the isolation (or are useless inside it) are
//! dropped from the bounding set while `CAP_SETPCAP` is still held, i.e.
//! before the identity transition. Ambient capabilities are cleared.
//!
//! ## Resource limits
//!
//! | Limit | Value |
//! |-------|-------|
//! | `RLIMIT_NOFILE` | [`Limits::nofile`] |
//! | `RLIMIT_NPROC` | [`Limits::max_procs`], if set |
//! | `RLIMIT_DATA` | [`Limits::memory`], if set |
//! | `RLIMIT_CORE` | 0 |
//!
//! `RLIMIT_AS` is left alone: runtimes that reserve large virtual ranges would
//! fail under it, and `RLIMIT_DATA` tracks committed memory instead.

use jailrun_sys::last_errno;
use rustix::io::Errno;

use crate::request::Limits;

/// Capabilities removed from the bounding set.
pub const DROPPED_CAPABILITIES: [(u32, &str); 21] = [
    (30, "CAP_AUDIT_CONTROL"),
    (37, "CAP_AUDIT_READ"),
    (29, "CAP_AUDIT_WRITE"),
    (36, "CAP_BLOCK_SUSPEND"),
    (2, "CAP_DAC_READ_SEARCH"),
    (1, "CAP_DAC_OVERRIDE"),
    (4, "CAP_FSETID"),
    (14, "CAP_IPC_LOCK"),
    (33, "CAP_MAC_ADMIN"),
    (32, "CAP_MAC_OVERRIDE"),
    (27, "CAP_MKNOD"),
    (31, "CAP_SETFCAP"),
    (34, "CAP_SYSLOG"),
    (21, "CAP_SYS_ADMIN"),
    (22, "CAP_SYS_BOOT"),
    (16, "CAP_SYS_MODULE"),
    (23, "CAP_SYS_NICE"),
    (17, "CAP_SYS_RAWIO"),
    (24, "CAP_SYS_RESOURCE"),
    (25, "CAP_SYS_TIME"),
    (35, "CAP_WAKE_ALARM"),
];

/// Drop [`DROPPED_CAPABILITIES`] from the bounding set and clear ambient caps.
///
/// A capability unknown to the running kernel (`EINVAL`) is skipped.
pub fn drop_bounding_caps() -> Result<(), Errno> {
    unsafe {
        libc::prctl(
            libc::PR_CAP_AMBIENT,
            libc::PR_CAP_AMBIENT_CLEAR_ALL,
            0,
            0,
            0,
        );
    }
    for (cap, _) in DROPPED_CAPABILITIES {
        let ret = unsafe { libc::prctl(libc::PR_CAPBSET_DROP, cap as libc::c_ulong, 0, 0, 0) };
        if ret != 0 {
            let errno = last_errno();
            if errno != Errno::INVAL {
                return Err(errno);
            }
        }
    }
    Ok(())
}

/// Apply resource limits.
pub fn apply_rlimits(limits: &Limits) -> Result<(), Errno> {
    set_rlimit(libc::RLIMIT_NOFILE, limits.nofile)?;
    if let Some(procs) = limits.max_procs {
        set_rlimit(libc::RLIMIT_NPROC, procs)?;
    }
    if let Some(bytes) = limits.memory {
        set_rlimit(libc::RLIMIT_DATA, bytes)?;
    }
    set_rlimit(libc::RLIMIT_CORE, 0)?;
    Ok(())
}

#[inline]
fn set_rlimit(resource: libc::__rlimit_resource_t, limit: u64) -> Result<(), Errno> {
    let rlim = libc::rlimit {
        rlim_cur: limit,
        rlim_max: limit,
    };
    // SAFETY: rlim is valid, resource is a valid constant.
    if unsafe { libc::setrlimit(resource, &rlim) } != 0 {
        Err(last_errno())
    } else {
        Ok(())
    }
}

/// Close every file descriptor above stderr.
pub fn close_extra_fds() {
    unsafe {
        libc::syscall(libc::SYS_close_range, 3u32, u32::MAX, 0u32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropped_capabilities_unique() {
        let mut caps: Vec<u32> = DROPPED_CAPABILITIES.iter().map(|(c, _)| *c).collect();
        caps.sort_unstable();
        caps.dedup();
        assert_eq!(caps.len(), DROPPED_CAPABILITIES.len());
    }

    #[test]
    fn setpcap_and_setuid_kept() {
        // CAP_SETGID, CAP_SETUID and CAP_SETPCAP are needed after the drop.
        for kept in [6, 7, 8] {
            assert!(DROPPED_CAPABILITIES.iter().all(|(c, _)| *c != kept));
        }
    }

    #[test]
    fn get_current_nofile() {
        let mut rlim = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        assert_eq!(
            unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) },
            0
        );
        assert!(rlim.rlim_cur > 0);
    }
}
