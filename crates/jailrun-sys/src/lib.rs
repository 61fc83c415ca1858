//! Low-level Linux syscall wrappers for jailrun.
//!
//! Thin wrappers around the security syscalls the sandbox runner needs that
//! neither rustix nor libc expose in a usable form. For standard syscalls, use
//! rustix.
//!
//! ## Modules
//!
//! - **seccomp** - BPF program builder for the mediation + hardening filter
//! - **seccomp_notify** - `SECCOMP_RET_USER_NOTIF` listener and ioctls
//! - **check** - Runtime system capability detection
//!
//! ## Mediation filter
//!
//! The filter built by [`seccomp::build_mediation_filter`] sorts every syscall
//! into one of four buckets:
//!
//! - refused outright with `EPERM` (kernel keyring, io_uring, file handles, ...)
//! - answered with `ENOSYS` (`clone3` and path syscalls newer than the filter)
//! - forwarded to the supervisor through the notify listener
//! - allowed
//!
//! x32 syscall numbers and foreign architectures kill the process.
//!
//! # Safety
//!
//! This crate contains raw syscall wrappers. Casts between integer types
//! are unavoidable when interfacing with the kernel ABI.

#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod check;
pub mod seccomp;
pub mod seccomp_notify;

pub use check::{CheckError, SystemInfo, check};

#[inline]
pub fn last_errno() -> rustix::io::Errno {
    // SAFETY: __errno_location always returns valid thread-local pointer.
    rustix::io::Errno::from_raw_os_error(unsafe { *libc::__errno_location() })
}
