//! Seccomp user notification (`SECCOMP_RET_USER_NOTIF`) support.
//!
//! Seccomp user notification lets a supervisor halt a sandboxed thread at a
//! monitored syscall and decide on its behalf.
//!
//! ## Architecture
//!
//! 1. Child installs a seccomp filter with `SECCOMP_FILTER_FLAG_NEW_LISTENER`
//! 2. This returns a "listener fd" which is passed to the parent via `SCM_RIGHTS`
//! 3. Parent polls the listener fd; when readable, calls `SECCOMP_IOCTL_NOTIF_RECV`
//! 4. Parent inspects the syscall and either:
//!    - Performs it on the child's behalf and returns the result
//!    - Injects a file descriptor it opened with `SECCOMP_IOCTL_NOTIF_ADDFD`
//!    - Returns `SECCOMP_USER_NOTIF_FLAG_CONTINUE` to let it proceed
//!    - Returns an error code to make it fail in the child
//!
//! ## TOCTOU
//!
//! Pointer arguments live in memory the child shares with its other threads.
//! A sibling can rewrite a path after the supervisor has read it, so a
//! `CONTINUE` response makes the kernel re-read memory the supervisor never
//! inspected. Only the supervisor's own copy of the arguments is trustworthy:
//! perform the operation from that copy and return the result instead of
//! continuing.
//!
//! `SECCOMP_IOCTL_NOTIF_ID_VALID` only proves the thread is still waiting on the
//! same notification, so that the pid behind `/proc/<tid>/mem` was not reused.
//! It says nothing about the memory contents.

use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

use rustix::io::Errno;

use crate::last_errno;
use crate::seccomp::{SockFilter, SockFprog};

const SECCOMP_SET_MODE_FILTER: u32 = 1;
pub const SECCOMP_FILTER_FLAG_NEW_LISTENER: u32 = 1 << 3;

/// Let the syscall proceed as-is (supervisor approves).
pub const SECCOMP_USER_NOTIF_FLAG_CONTINUE: u32 = 1;

// ioctl numbers for seccomp notify (x86_64 values from kernel headers)
// SECCOMP_IOCTL_NOTIF_RECV = SECCOMP_IOWR(0, struct seccomp_notif)
// SECCOMP_IOCTL_NOTIF_SEND = SECCOMP_IOWR(1, struct seccomp_notif_resp)
// SECCOMP_IOCTL_NOTIF_ID_VALID = SECCOMP_IOW(2, __u64)

/// ioctl to receive a notification from the seccomp listener fd.
pub const SECCOMP_IOCTL_NOTIF_RECV: u64 = 0xc050_2100;
/// ioctl to send a response to a seccomp notification.
pub const SECCOMP_IOCTL_NOTIF_SEND: u64 = 0xc018_2101;
/// ioctl to check if a notification ID is still valid.
pub const SECCOMP_IOCTL_NOTIF_ID_VALID: u64 = 0x4008_2102;
/// ioctl to install a supervisor fd into the notifying process.
/// SECCOMP_IOCTL_NOTIF_ADDFD = SECCOMP_IOW(3, struct seccomp_notif_addfd)
pub const SECCOMP_IOCTL_NOTIF_ADDFD: u64 = 0x4018_2103;

/// Install the fd and answer the notification with its number, atomically.
pub const SECCOMP_ADDFD_FLAG_SEND: u32 = 1 << 1;
/// Install at `newfd` instead of the lowest free slot.
pub const SECCOMP_ADDFD_FLAG_SETFD: u32 = 1 << 0;

/// Seccomp notification data (mirrors kernel `struct seccomp_data`).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SeccompData {
    /// Syscall number.
    pub nr: i32,
    /// Architecture (`AUDIT_ARCH_*`).
    pub arch: u32,
    /// Instruction pointer at time of syscall.
    pub instruction_pointer: u64,
    /// Syscall arguments.
    pub args: [u64; 6],
}

/// Seccomp notification received from the child (mirrors kernel `struct seccomp_notif`).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SeccompNotif {
    /// Unique notification ID.
    pub id: u64,
    /// Thread id of the notifying thread (in the supervisor's PID namespace).
    pub pid: u32,
    /// Flags (currently unused, must be 0).
    pub flags: u32,
    /// The syscall data.
    pub data: SeccompData,
}

impl Default for SeccompNotif {
    fn default() -> Self {
        // SAFETY: SeccompNotif is a plain C struct with no invariants.
        unsafe { std::mem::zeroed() }
    }
}

/// Response to a seccomp notification (mirrors kernel `struct seccomp_notif_resp`).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeccompNotifResp {
    /// Must match the notification ID.
    pub id: u64,
    /// Return value for the syscall.
    pub val: i64,
    /// Negated errno, or 0.
    pub error: i32,
    /// Flags (e.g., `SECCOMP_USER_NOTIF_FLAG_CONTINUE`).
    pub flags: u32,
}

impl SeccompNotifResp {
    /// Resume the syscall unchanged.
    pub const fn continue_syscall(id: u64) -> Self {
        Self {
            id,
            val: 0,
            error: 0,
            flags: SECCOMP_USER_NOTIF_FLAG_CONTINUE,
        }
    }

    /// Complete the syscall without running it, returning `val`.
    pub const fn succeed(id: u64, val: i64) -> Self {
        Self {
            id,
            val,
            error: 0,
            flags: 0,
        }
    }

    /// Fail the syscall in the child with `errno`.
    pub const fn fail(id: u64, errno: i32) -> Self {
        Self {
            id,
            val: 0,
            error: -errno,
            flags: 0,
        }
    }
}

/// Fd injection request (mirrors kernel `struct seccomp_notif_addfd`).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeccompNotifAddfd {
    /// Notification ID.
    pub id: u64,
    /// `SECCOMP_ADDFD_FLAG_*`.
    pub flags: u32,
    /// Supervisor-side fd to duplicate into the child.
    pub srcfd: u32,
    /// Target fd number, only with `SECCOMP_ADDFD_FLAG_SETFD`.
    pub newfd: u32,
    /// Flags for the new fd (only `O_CLOEXEC` is accepted).
    pub newfd_flags: u32,
}

impl SeccompNotifAddfd {
    /// Inject `srcfd` and complete the syscall with the new fd number.
    pub const fn send(id: u64, srcfd: u32, cloexec: bool) -> Self {
        Self {
            id,
            flags: SECCOMP_ADDFD_FLAG_SEND,
            srcfd,
            newfd: 0,
            newfd_flags: if cloexec { libc::O_CLOEXEC as u32 } else { 0 },
        }
    }
}

/// Install `filter` with `SECCOMP_FILTER_FLAG_NEW_LISTENER`.
///
/// Sets `PR_SET_NO_NEW_PRIVS` first. Returns the listener fd which can be used
/// to receive notifications.
///
/// # Safety
///
/// The filter must be a valid BPF program. This permanently restricts
/// syscalls for this thread and every descendant.
///
/// # Errors
///
/// Returns `Errno` if the filter cannot be installed.
pub unsafe fn install_listener(filter: &[SockFilter]) -> Result<OwnedFd, Errno> {
    let fprog = SockFprog::new(filter);
    unsafe {
        let ret = libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0);
        if ret != 0 {
            return Err(last_errno());
        }

        let ret = libc::syscall(
            libc::SYS_seccomp,
            SECCOMP_SET_MODE_FILTER,
            SECCOMP_FILTER_FLAG_NEW_LISTENER,
            &fprog as *const SockFprog,
        );
        if ret < 0 {
            Err(last_errno())
        } else {
            // SAFETY: On success, ret is a valid listener file descriptor.
            Ok(OwnedFd::from_raw_fd(ret as i32))
        }
    }
}

/// Receive a notification from the seccomp listener fd.
///
/// Blocks until a notification is available (or poll first).
///
/// # Errors
///
/// Returns `Errno` on failure (e.g., `ENOENT` if the target died).
pub fn notif_recv(listener: BorrowedFd<'_>) -> Result<SeccompNotif, Errno> {
    let mut notif = SeccompNotif::default();
    let ret = unsafe {
        libc::ioctl(
            listener.as_raw_fd(),
            SECCOMP_IOCTL_NOTIF_RECV,
            &mut notif as *mut SeccompNotif,
        )
    };
    if ret < 0 { Err(last_errno()) } else { Ok(notif) }
}

/// Send a response to a seccomp notification.
///
/// # Errors
///
/// Returns `Errno` on failure. `ENOENT` means the thread is gone or was
/// interrupted; the caller should treat the event as settled.
pub fn notif_send(listener: BorrowedFd<'_>, resp: &SeccompNotifResp) -> Result<(), Errno> {
    let ret = unsafe {
        libc::ioctl(
            listener.as_raw_fd(),
            SECCOMP_IOCTL_NOTIF_SEND,
            resp as *const SeccompNotifResp,
        )
    };
    if ret < 0 { Err(last_errno()) } else { Ok(()) }
}

/// Duplicate a supervisor fd into the notifying process.
///
/// With `SECCOMP_ADDFD_FLAG_SEND` the notification is answered by the same
/// call; no `notif_send` follows. Returns the fd number in the child.
///
/// # Errors
///
/// Returns `Errno::NOENT` if the notification is gone, `EMFILE` if the child
/// has no free descriptor slot.
pub fn notif_addfd(listener: BorrowedFd<'_>, addfd: &SeccompNotifAddfd) -> Result<i32, Errno> {
    let ret = unsafe {
        libc::ioctl(
            listener.as_raw_fd(),
            SECCOMP_IOCTL_NOTIF_ADDFD,
            addfd as *const SeccompNotifAddfd,
        )
    };
    if ret < 0 { Err(last_errno()) } else { Ok(ret) }
}

/// Check if a notification ID is still valid.
///
/// Must be called after reading from the child's `/proc/<tid>/mem`, before
/// trusting that the bytes belong to the notifying thread.
///
/// # Errors
///
/// Returns `Errno::NOENT` if the notification is no longer valid.
pub fn notif_id_valid(listener: BorrowedFd<'_>, id: u64) -> Result<(), Errno> {
    let ret = unsafe {
        libc::ioctl(
            listener.as_raw_fd(),
            SECCOMP_IOCTL_NOTIF_ID_VALID,
            &id as *const u64,
        )
    };
    if ret < 0 { Err(last_errno()) } else { Ok(()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn struct_sizes() {
        assert_eq!(size_of::<SeccompData>(), 64);
        assert_eq!(size_of::<SeccompNotif>(), 80);
        assert_eq!(size_of::<SeccompNotifResp>(), 24);
        assert_eq!(size_of::<SeccompNotifAddfd>(), 24);
    }

    #[test]
    fn addfd_send_request() {
        let addfd = SeccompNotifAddfd::send(11, 5, true);
        assert_eq!(addfd.flags, SECCOMP_ADDFD_FLAG_SEND);
        assert_eq!(addfd.srcfd, 5);
        assert_eq!(addfd.newfd, 0);
        assert_eq!(addfd.newfd_flags, libc::O_CLOEXEC as u32);
        assert_eq!(SeccompNotifAddfd::send(11, 5, false).newfd_flags, 0);
    }

    #[test]
    fn default_notif_is_zeroed() {
        let notif = SeccompNotif::default();
        assert_eq!(notif.id, 0);
        assert_eq!(notif.pid, 0);
        assert_eq!(notif.data.nr, 0);
    }

    #[test]
    fn response_constructors() {
        let resp = SeccompNotifResp::continue_syscall(7);
        assert_eq!(resp.id, 7);
        assert_eq!(resp.flags, SECCOMP_USER_NOTIF_FLAG_CONTINUE);
        assert_eq!(resp.error, 0);

        let resp = SeccompNotifResp::fail(9, libc::EPERM);
        assert_eq!(resp.error, -libc::EPERM);
        assert_eq!(resp.flags, 0);
    }
}
