//! Namespace creation for the sandboxed child.
//!
//! The child is created with a raw `clone(2)` (no new stack, fork semantics)
//! directly into fresh namespaces:
//!
//! | Flag | Why |
//! |------|-----|
//! | `CLONE_NEWNS` | private mount table for the isolated view |
//! | `CLONE_NEWPID` | the command is PID 1 of its own tree; killing it kills the tree |
//! | `CLONE_NEWIPC` | no SysV IPC shared with the host |
//! | `CLONE_NEWUTS` | hostname can be set without touching the host |
//! | `CLONE_NEWCGROUP` | cgroup paths rooted at the child's cgroup |
//! | `CLONE_NEWNET` | empty network namespace, unless `share_net` |
//!
//! No user namespace is created: the runner is expected to hold real
//! `CAP_SYS_ADMIN`, and the identity drop happens in the initial user namespace.

use jailrun_sys::last_errno;
use rustix::io::Errno;

/// Namespace flags for a sandboxed child.
pub fn clone_flags(share_net: bool) -> libc::c_int {
    let mut flags = libc::CLONE_NEWNS
        | libc::CLONE_NEWPID
        | libc::CLONE_NEWIPC
        | libc::CLONE_NEWUTS
        | libc::CLONE_NEWCGROUP;
    if !share_net {
        flags |= libc::CLONE_NEWNET;
    }
    flags
}

/// Fork into new namespaces.
///
/// Returns `Some(pid)` in the parent and `None` in the child.
///
/// # Safety
///
/// Same contract as `fork(2)`: the caller must be single-threaded, and the
/// child may only run code that does not depend on locks held by other
/// threads at the time of the call.
pub unsafe fn clone_into_namespaces(flags: libc::c_int) -> Result<Option<libc::pid_t>, Errno> {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_clone,
            (flags | libc::SIGCHLD) as libc::c_ulong,
            std::ptr::null_mut::<libc::c_void>(),
            std::ptr::null_mut::<libc::c_int>(),
            std::ptr::null_mut::<libc::c_int>(),
            0 as libc::c_ulong,
        )
    };
    match ret {
        r if r < 0 => Err(last_errno()),
        0 => Ok(None),
        pid => Ok(Some(pid as libc::pid_t)),
    }
}

/// Ask the kernel to SIGKILL this process when the runner dies.
pub fn kill_with_parent() -> Result<(), Errno> {
    let ret = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL, 0, 0, 0) };
    if ret != 0 { Err(last_errno()) } else { Ok(()) }
}

/// Set the hostname.
pub fn set_hostname(name: &str) -> Result<(), Errno> {
    let ret = unsafe { libc::sethostname(name.as_ptr().cast::<libc::c_char>(), name.len()) };
    if ret != 0 { Err(last_errno()) } else { Ok(()) }
}

/// Default hostname for a session.
pub fn default_hostname(session: &str) -> String {
    let suffix: String = session.chars().take(12).collect();
    format!("jailrun-{suffix}")
}
