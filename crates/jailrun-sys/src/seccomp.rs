//! Seccomp-BPF program for syscall mediation.
//!
//! A single filter is installed in the sandboxed child right before `execve`.
//! It runs on every syscall and picks one of five outcomes:
//!
//! 1. Wrong architecture or x32 syscall number → kill the process
//! 2. Hardening refusal → `ERRNO(EPERM)`, never reaches the supervisor
//! 3. Syscall too new to be inspected → `ERRNO(ENOSYS)`
//! 4. Monitored operation → `USER_NOTIF`, the supervisor decides
//! 5. Anything else → allow
//!
//! ## Filter Structure
//!
//! ```text
//! [0-2]   arch check (kill on mismatch)
//! [3]     load syscall number
//! [4-5]   x32 bit check (kill when set)
//! [6..]   conditional dispatch: chmod/fchmod/fchmodat/unshare/clone/ioctl/sendto -> handler
//! [..]    unavailable syscalls -> ENOSYS
//! [..]    refused syscalls -> ERRNO
//! [..]    monitored syscalls -> NOTIFY
//! [T+0]   RET ALLOW
//! [T+1]   RET ERRNO(EPERM)
//! [T+2]   RET USER_NOTIF
//! [T+3]   RET ERRNO(ENOSYS)
//! [H..]   argument handlers
//! ```
//!
//! ## Conditional refusals
//!
//! | Syscall | Argument | Refused when |
//! |---------|----------|--------------|
//! | `chmod`, `fchmod` | 1 | mode has `S_ISUID` or `S_ISGID` |
//! | `fchmodat` | 2 | mode has `S_ISUID` or `S_ISGID` |
//! | `unshare`, `clone` | 0 | flags contain `CLONE_NEWUSER` |
//! | `ioctl` | 1 | request is `TIOCSTI` |
//!
//! A conditional syscall that passes its handler falls through to `USER_NOTIF`
//! when it is also monitored, otherwise to `ALLOW`.
//!
//! `sendto` is the one handler that notifies instead of refusing: a call with
//! a destination address (argument 4, checked as a full 64-bit pointer) goes to
//! the supervisor, a call on a connected socket is allowed.
//!
//! ## Security Notes
//!
//! - Filter is permanent - cannot be removed once applied
//! - Requires `PR_SET_NO_NEW_PRIVS` first (done by the listener installer)
//! - `clone3` cannot be inspected (flags live behind a pointer); it returns
//!   `ENOSYS` so glibc falls back to `clone`, which is inspected. Path
//!   syscalls newer than the monitored set (`fchmodat2`, `setxattrat`,
//!   `removexattrat`) get the same treatment.
//! - Syscall numbers with the x32 bit set pass the `AUDIT_ARCH_X86_64` check,
//!   so they are killed explicitly.
//! - io_uring performs file and socket operations without syscalls and is
//!   refused.

use rustix::io::Errno;

// Seccomp return actions
pub const SECCOMP_RET_KILL_PROCESS: u32 = 0x8000_0000;
pub const SECCOMP_RET_USER_NOTIF: u32 = 0x7fc0_0000;
pub const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;
const SECCOMP_RET_ERRNO: u32 = 0x0005_0000;

pub const SECCOMP_RET_ERRNO_EPERM: u32 = SECCOMP_RET_ERRNO | libc::EPERM as u32;
pub const SECCOMP_RET_ERRNO_ENOSYS: u32 = SECCOMP_RET_ERRNO | libc::ENOSYS as u32;

// BPF instruction classes
const BPF_LD: u16 = 0x00;
const BPF_JMP: u16 = 0x05;
const BPF_RET: u16 = 0x06;

// BPF ld/ldx fields
const BPF_W: u16 = 0x00;
const BPF_ABS: u16 = 0x20;

// BPF alu/jmp fields
const BPF_JEQ: u16 = 0x10;
const BPF_JSET: u16 = 0x40;
const BPF_K: u16 = 0x00;

pub const AUDIT_ARCH_X86_64: u32 = 0xc000_003e;

// seccomp_data offsets (x86_64, little endian: +0 low word, +4 high word)
const OFFSET_SYSCALL_NR: u32 = 0;
const OFFSET_ARCH: u32 = 4;
const OFFSET_ARGS: u32 = 16;

/// Set in every x32 ABI syscall number.
pub const X32_SYSCALL_BIT: u32 = 0x4000_0000;

const S_ISUID: u32 = 0o4000;
const S_ISGID: u32 = 0o2000;
const CLONE_NEWUSER: u32 = 0x1000_0000;
const TIOCSTI: u32 = 0x5412;

pub const SYS_FCHMODAT2: i64 = 452;
pub const SYS_SETXATTRAT: i64 = 463;
pub const SYS_REMOVEXATTRAT: i64 = 466;

/// Syscalls refused unconditionally with `EPERM`.
///
/// Kernel keyring access, NUMA memory policy, `userfaultfd` and
/// `perf_event_open` are common kernel exploitation primitives. io_uring and
/// file handles reach files and sockets without a monitored syscall.
pub const REFUSED_SYSCALLS: &[i64] = &[
    libc::SYS_keyctl,
    libc::SYS_add_key,
    libc::SYS_request_key,
    libc::SYS_mbind,
    libc::SYS_migrate_pages,
    libc::SYS_move_pages,
    libc::SYS_set_mempolicy,
    libc::SYS_userfaultfd,
    libc::SYS_perf_event_open,
    libc::SYS_io_uring_setup,
    libc::SYS_io_uring_enter,
    libc::SYS_io_uring_register,
    libc::SYS_open_by_handle_at,
    libc::SYS_name_to_handle_at,
];

/// Syscalls answered with `ENOSYS` so libc falls back to an inspectable one.
pub const UNAVAILABLE_SYSCALLS: &[i64] = &[
    libc::SYS_clone3,
    SYS_FCHMODAT2,
    SYS_SETXATTRAT,
    SYS_REMOVEXATTRAT,
];

/// Security-relevant operations forwarded to the enforcement tool.
pub const MONITORED_SYSCALLS: &[i64] = &[
    // === Open / create ===
    libc::SYS_open,
    libc::SYS_openat,
    libc::SYS_openat2,
    libc::SYS_creat,
    // === Program execution ===
    libc::SYS_execve,
    libc::SYS_execveat,
    // === Namespace mutation ===
    libc::SYS_unlink,
    libc::SYS_unlinkat,
    libc::SYS_rmdir,
    libc::SYS_rename,
    libc::SYS_renameat,
    libc::SYS_renameat2,
    libc::SYS_mkdir,
    libc::SYS_mkdirat,
    libc::SYS_link,
    libc::SYS_linkat,
    libc::SYS_symlink,
    libc::SYS_symlinkat,
    libc::SYS_mknod,
    libc::SYS_mknodat,
    // === Metadata ===
    libc::SYS_chmod,
    libc::SYS_fchmodat,
    libc::SYS_chown,
    libc::SYS_lchown,
    libc::SYS_fchownat,
    libc::SYS_truncate,
    libc::SYS_utime,
    libc::SYS_utimes,
    libc::SYS_futimesat,
    libc::SYS_utimensat,
    libc::SYS_setxattr,
    libc::SYS_lsetxattr,
    libc::SYS_removexattr,
    libc::SYS_lremovexattr,
    // === Network ===
    libc::SYS_connect,
    libc::SYS_bind,
    libc::SYS_sendmsg,
    libc::SYS_sendmmsg,
];

/// Maximum number of direct dispatch entries (BPF jump offsets are u8).
const MAX_DISPATCH_SIZE: usize = 200;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SockFilter {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

impl SockFilter {
    #[inline]
    pub const fn stmt(code: u16, k: u32) -> Self {
        Self {
            code,
            jt: 0,
            jf: 0,
            k,
        }
    }

    #[inline]
    pub const fn jump(code: u16, k: u32, jt: u8, jf: u8) -> Self {
        Self { code, jt, jf, k }
    }

    #[inline]
    const fn ret(action: u32) -> Self {
        Self::stmt(BPF_RET | BPF_K, action)
    }

    #[inline]
    const fn load(offset: u32) -> Self {
        Self::stmt(BPF_LD | BPF_W | BPF_ABS, offset)
    }
}

#[repr(C)]
#[derive(Debug)]
pub struct SockFprog {
    pub len: u16,
    pub filter: *const SockFilter,
}

impl SockFprog {
    /// Borrow a built program. The program must outlive the returned value.
    pub fn new(filter: &[SockFilter]) -> Self {
        Self {
            len: filter.len() as u16,
            filter: filter.as_ptr(),
        }
    }
}

/// How an argument handler inspects its syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArgCheck {
    /// Refuse when `arg & mask != 0`.
    AnyBits(u32),
    /// Refuse when `arg == value`.
    Equals(u32),
    /// Notify when the pointer is non-null, allow otherwise.
    NonNull,
}

impl ArgCheck {
    /// Instructions emitted for this check.
    const fn len(self) -> usize {
        match self {
            ArgCheck::AnyBits(_) | ArgCheck::Equals(_) => 4,
            ArgCheck::NonNull => 6,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Handler {
    nr: i64,
    arg: u32,
    check: ArgCheck,
}

const HANDLERS: &[Handler] = &[
    Handler {
        nr: libc::SYS_chmod,
        arg: 1,
        check: ArgCheck::AnyBits(S_ISUID | S_ISGID),
    },
    Handler {
        nr: libc::SYS_fchmod,
        arg: 1,
        check: ArgCheck::AnyBits(S_ISUID | S_ISGID),
    },
    Handler {
        nr: libc::SYS_fchmodat,
        arg: 2,
        check: ArgCheck::AnyBits(S_ISUID | S_ISGID),
    },
    Handler {
        nr: libc::SYS_unshare,
        arg: 0,
        check: ArgCheck::AnyBits(CLONE_NEWUSER),
    },
    Handler {
        nr: libc::SYS_clone,
        arg: 0,
        check: ArgCheck::AnyBits(CLONE_NEWUSER),
    },
    Handler {
        nr: libc::SYS_ioctl,
        arg: 1,
        check: ArgCheck::Equals(TIOCSTI),
    },
    Handler {
        nr: libc::SYS_sendto,
        arg: 4,
        check: ArgCheck::NonNull,
    },
];

/// Where a dispatch jump lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Errno,
    Notify,
    Enosys,
    Handler(usize),
}

/// Build the mediation filter for the given monitored syscalls.
///
/// Syscalls listed in [`REFUSED_SYSCALLS`] or [`UNAVAILABLE_SYSCALLS`] always
/// win over `monitored`.
///
/// # Panics
///
/// Panics if the dispatch table exceeds 200 entries (BPF jump offsets are u8).
pub fn build_mediation_filter(monitored: &[i64]) -> Vec<SockFilter> {
    let mut dispatch: Vec<(i64, Target)> = Vec::new();
    for &nr in UNAVAILABLE_SYSCALLS {
        dispatch.push((nr, Target::Enosys));
    }
    for (i, handler) in HANDLERS.iter().enumerate() {
        dispatch.push((handler.nr, Target::Handler(i)));
    }
    for &nr in REFUSED_SYSCALLS {
        dispatch.push((nr, Target::Errno));
    }
    for &nr in monitored {
        let taken = dispatch.iter().any(|(seen, _)| *seen == nr);
        if !taken {
            dispatch.push((nr, Target::Notify));
        }
    }

    assert!(
        dispatch.len() <= MAX_DISPATCH_SIZE,
        "dispatch table too large: {} > {} (BPF jump offset overflow)",
        dispatch.len(),
        MAX_DISPATCH_SIZE
    );

    let header_len = 6;
    let terminal = header_len + dispatch.len();
    let allow_at = terminal;
    let errno_at = terminal + 1;
    let notify_at = terminal + 2;
    let enosys_at = terminal + 3;

    let mut handler_starts = Vec::with_capacity(HANDLERS.len());
    let mut next = terminal + 4;
    for handler in HANDLERS {
        handler_starts.push(next);
        next += handler.check.len();
    }

    let mut filter = Vec::with_capacity(next);

    // === Architecture check ===
    filter.push(SockFilter::load(OFFSET_ARCH));
    filter.push(SockFilter::jump(
        BPF_JMP | BPF_JEQ | BPF_K,
        AUDIT_ARCH_X86_64,
        1,
        0,
    ));
    filter.push(SockFilter::ret(SECCOMP_RET_KILL_PROCESS));

    // === Load syscall number, reject x32 ===
    filter.push(SockFilter::load(OFFSET_SYSCALL_NR));
    filter.push(SockFilter::jump(
        BPF_JMP | BPF_JSET | BPF_K,
        X32_SYSCALL_BIT,
        0,
        1,
    ));
    filter.push(SockFilter::ret(SECCOMP_RET_KILL_PROCESS));

    // === Dispatch ===
    for &(nr, target) in &dispatch {
        let here = filter.len();
        let dest = match target {
            Target::Errno => errno_at,
            Target::Notify => notify_at,
            Target::Enosys => enosys_at,
            Target::Handler(i) => handler_starts[i],
        };
        filter.push(SockFilter::jump(
            BPF_JMP | BPF_JEQ | BPF_K,
            nr as u32,
            jump_offset(here, dest),
            0,
        ));
    }

    // === Terminal block ===
    debug_assert_eq!(filter.len(), allow_at);
    filter.push(SockFilter::ret(SECCOMP_RET_ALLOW));
    filter.push(SockFilter::ret(SECCOMP_RET_ERRNO_EPERM));
    filter.push(SockFilter::ret(SECCOMP_RET_USER_NOTIF));
    filter.push(SockFilter::ret(SECCOMP_RET_ERRNO_ENOSYS));

    // === Argument handlers ===
    for handler in HANDLERS {
        let offset = OFFSET_ARGS + handler.arg * 8;
        let pass = if monitored.contains(&handler.nr) {
            SECCOMP_RET_USER_NOTIF
        } else {
            SECCOMP_RET_ALLOW
        };
        match handler.check {
            ArgCheck::AnyBits(mask) => {
                filter.push(SockFilter::load(offset));
                filter.push(SockFilter::jump(BPF_JMP | BPF_JSET | BPF_K, mask, 1, 0));
                filter.push(SockFilter::ret(pass));
                filter.push(SockFilter::ret(SECCOMP_RET_ERRNO_EPERM));
            }
            ArgCheck::Equals(value) => {
                filter.push(SockFilter::load(offset));
                filter.push(SockFilter::jump(BPF_JMP | BPF_JEQ | BPF_K, value, 1, 0));
                filter.push(SockFilter::ret(pass));
                filter.push(SockFilter::ret(SECCOMP_RET_ERRNO_EPERM));
            }
            ArgCheck::NonNull => {
                // low word, then high word; either non-zero notifies
                filter.push(SockFilter::load(offset));
                filter.push(SockFilter::jump(BPF_JMP | BPF_JEQ | BPF_K, 0, 0, 3));
                filter.push(SockFilter::load(offset + 4));
                filter.push(SockFilter::jump(BPF_JMP | BPF_JEQ | BPF_K, 0, 0, 1));
                filter.push(SockFilter::ret(SECCOMP_RET_ALLOW));
                filter.push(SockFilter::ret(SECCOMP_RET_USER_NOTIF));
            }
        }
    }

    debug_assert_eq!(filter.len(), next);
    filter
}

/// Distance from the instruction at `from` to `to`, as a BPF jump offset.
fn jump_offset(from: usize, to: usize) -> u8 {
    let offset = to - from - 1;
    u8::try_from(offset).unwrap_or_else(|_| panic!("BPF jump offset {offset} overflows u8"))
}

/// Returns true if seccomp is available.
pub fn seccomp_available() -> bool {
    unsafe { libc::prctl(libc::PR_GET_SECCOMP, 0, 0, 0, 0) >= 0 }
}

/// Evaluate a built program against a synthetic syscall, the way the kernel
/// would. Only the instruction subset emitted by this module is supported.
///
/// Used by tests in this crate and downstream to check routing decisions
/// without installing the filter.
pub fn evaluate(filter: &[SockFilter], arch: u32, nr: i64, args: [u64; 6]) -> Result<u32, Errno> {
    let mut pc = 0usize;
    let mut acc: u32 = 0;
    while pc < filter.len() {
        let ins = filter[pc];
        match ins.code {
            c if c == BPF_LD | BPF_W | BPF_ABS => {
                acc = match ins.k {
                    OFFSET_SYSCALL_NR => nr as u32,
                    OFFSET_ARCH => arch,
                    k if k >= OFFSET_ARGS && (k - OFFSET_ARGS) % 4 == 0 => {
                        let idx = ((k - OFFSET_ARGS) / 8) as usize;
                        let arg = *args.get(idx).ok_or(Errno::INVAL)?;
                        if (k - OFFSET_ARGS) % 8 == 0 {
                            arg as u32
                        } else {
                            (arg >> 32) as u32
                        }
                    }
                    _ => return Err(Errno::INVAL),
                };
                pc += 1;
            }
            c if c == BPF_JMP | BPF_JEQ | BPF_K => {
                pc += 1 + usize::from(if acc == ins.k { ins.jt } else { ins.jf });
            }
            c if c == BPF_JMP | BPF_JSET | BPF_K => {
                pc += 1 + usize::from(if acc & ins.k != 0 { ins.jt } else { ins.jf });
            }
            c if c == BPF_RET | BPF_K => return Ok(ins.k),
            _ => return Err(Errno::INVAL),
        }
    }
    Err(Errno::INVAL)
}
