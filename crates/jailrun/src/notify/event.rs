//! Policy events: what a halted thread was about to do.
//!
//! A notification carries only the raw syscall number and six registers.
//! [`capture`] copies every pointer argument out of the halted thread once,
//! through [`HaltedThread`], and decodes the copies into an [`Operation`]:
//! the syscall name plus decoded arguments.
//!
//! The copies are kept in a [`Capture`]. An approved syscall is performed by
//! the bridge from that capture and never from the thread's memory again, so
//! a sibling thread rewriting a path after it was read changes nothing about
//! what runs.
//!
//! Relative paths are resolved against the thread's working directory or the
//! directory fd they come with, then normalized lexically (`.` dropped, `..`
//! clamped at `/`). Symlinks are not followed.

use std::ffi::CString;
use std::fmt;
use std::io;
use std::mem::MaybeUninit;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};

use serde::{Deserialize, Serialize};

/// Longest path string read from a halted thread, NUL included.
const PATH_MAX: usize = 4096;
/// Longest socket address read from a halted thread.
const SOCKADDR_MAX: usize = 128;
/// Largest data buffer copied out of a halted thread.
pub const MAX_PAYLOAD: usize = 1024 * 1024;
/// Most iovecs per message and most messages per `sendmmsg` (`UIO_MAXIOV`).
const IOV_MAX: usize = 1024;
/// Largest control buffer accepted (default `optmem_max`).
const CONTROL_MAX: usize = 20480;
/// `struct open_how` as of its first version.
pub const OPEN_HOW_SIZE: usize = 24;

const MSGHDR_SIZE: usize = 56;
const MMSGHDR_SIZE: usize = 64;
const IOVEC_SIZE: usize = 16;
const CMSGHDR_SIZE: usize = 16;

/// One monitored operation, as sent to the enforcement tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyEvent {
    /// Kernel thread id of the halted thread.
    pub tid: u32,
    /// Per-thread sequence number, starting at 0.
    pub seq: u64,
    pub op: Operation,
}

/// Syscall name and decoded arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub syscall: String,
    pub args: Vec<Arg>,
}

impl Operation {
    /// Path arguments in argument order, resolved where possible.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.args.iter().filter_map(|arg| match arg {
            Arg::Path { path, resolved } => Some(resolved.as_deref().unwrap_or(path)),
            _ => None,
        })
    }

    /// Rendered socket addresses in argument order.
    pub fn addresses(&self) -> impl Iterator<Item = &str> {
        self.args.iter().filter_map(|arg| match arg {
            Arg::SockAddr(addr) => Some(addr.as_str()),
            _ => None,
        })
    }
}

/// A decoded syscall argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Arg {
    /// A path as the thread passed it, and the absolute path it names inside
    /// the sandbox when that could be worked out.
    Path {
        path: String,
        resolved: Option<String>,
    },
    /// A string that is never looked up (symlink target, xattr name).
    Text(String),
    /// Directory fd for `*at` calls; `AT_FDCWD` is -100.
    DirFd(i32),
    Fd(i32),
    Flags(u64),
    Mode(u32),
    Int(i64),
    /// Rendered socket address (`1.2.3.4:80`, `[::1]:80`, `/run/x.sock`, `@abstract`).
    SockAddr(String),
    /// Pointer argument that could not be read.
    Unreadable,
}

impl Arg {
    /// A path argument; absolute paths resolve to their normal form.
    pub fn path(path: impl Into<String>) -> Self {
        let path = path.into();
        let resolved = path.starts_with('/').then(|| normalize(&path));
        Arg::Path { path, resolved }
    }
}

impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Path {
                path,
                resolved: Some(resolved),
            } if resolved != path => write!(f, "{path:?} => {resolved:?}"),
            Arg::Path { path, .. } => write!(f, "{path:?}"),
            Arg::Text(text) => write!(f, "{text:?}"),
            Arg::DirFd(libc::AT_FDCWD) => f.write_str("AT_FDCWD"),
            Arg::DirFd(fd) | Arg::Fd(fd) => write!(f, "{fd}"),
            Arg::Flags(flags) => write!(f, "{flags:#x}"),
            Arg::Mode(mode) => write!(f, "{mode:#o}"),
            Arg::Int(v) => write!(f, "{v}"),
            Arg::SockAddr(addr) => f.write_str(addr),
            Arg::Unreadable => f.write_str("?"),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.syscall)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{arg}")?;
        }
        f.write_str(")")
    }
}

/// A thread halted at a monitored syscall.
pub trait HaltedThread {
    /// Read up to `buf.len()` bytes at `addr`; returns the count read.
    fn read_at(&self, addr: u64, buf: &mut [u8]) -> io::Result<usize>;

    fn write_at(&self, _addr: u64, _data: &[u8]) -> io::Result<()> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }

    /// Duplicate the thread's descriptor `fd` into the supervisor.
    fn dup_fd(&self, _fd: i32) -> io::Result<OwnedFd> {
        Err(io::Error::from_raw_os_error(libc::EBADF))
    }

    /// Absolute path of the working directory (`AT_FDCWD`) or of directory
    /// fd `dirfd`, as the thread sees it.
    fn dir_path(&self, _dirfd: i32) -> Option<String> {
        None
    }

    /// Thread group id and thread id inside the sandbox's pid namespace.
    fn ns_ids(&self) -> Option<(u32, u32)> {
        None
    }
}

/// A thread whose `/proc` entry is gone: nothing can be read.
#[derive(Debug)]
pub struct Vanished;

impl HaltedThread for Vanished {
    fn read_at(&self, _addr: u64, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::from_raw_os_error(libc::ESRCH))
    }
}

/// What an approved syscall produces, and so how it is carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// A new descriptor, injected into the thread.
    Open,
    /// A plain return value.
    Value,
    /// A new process image. Cannot be performed on the thread's behalf.
    Exec,
    /// Registers only; the kernel runs it as is.
    Continue,
    SendMsg,
    SendMmsg,
}

/// One register as the bridge will pass it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reg {
    Value(u64),
    /// Path copied out of the thread.
    Path(CString),
    /// Other string copied out of the thread.
    Str(CString),
    /// Other memory copied out of the thread.
    Buffer(Vec<u8>),
    /// Descriptor number in the thread's table.
    Fd(i32),
}

/// One `struct msghdr`, copied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub name: Option<Vec<u8>>,
    pub payload: Vec<u8>,
    pub control: Vec<Control>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    /// `SCM_RIGHTS`: descriptor numbers in the sender's table.
    Rights(Vec<i32>),
    Other { level: i32, kind: i32, data: Vec<u8> },
}

/// Everything needed to perform a syscall without touching the thread's
/// memory again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capture {
    pub nr: i64,
    /// Registers as the thread passed them.
    pub args: [u64; 6],
    pub effect: Effect,
    pub regs: [Reg; 6],
    pub messages: Vec<Message>,
    /// First errno hit while copying; the syscall fails with it.
    pub fault: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Path,
    /// Path that may be NULL, meaning the directory fd itself.
    PathOrNull,
    Text,
    DirFd,
    Fd,
    Flags,
    Mode,
    Int,
    /// `struct open_how *` with its size in the next register.
    OpenHow,
    /// `struct sockaddr *` with its length in the next register.
    SockAddr,
    /// Data buffer with its length in the next register.
    Payload,
    /// Fixed-size input struct, NULL allowed.
    Blob(usize),
    /// `struct msghdr *`.
    MsgHdr,
    /// `struct mmsghdr *` with the count in the next register.
    MmsgHdrs,
    Skip,
}

use Slot::*;

struct Layout {
    nr: i64,
    name: &'static str,
    effect: Effect,
    slots: &'static [Slot],
}

const fn layout(nr: i64, name: &'static str, effect: Effect, slots: &'static [Slot]) -> Layout {
    Layout {
        nr,
        name,
        effect,
        slots,
    }
}

/// Argument layout of every syscall the bridge can be asked about.
const LAYOUTS: &[Layout] = &[
    layout(libc::SYS_open, "open", Effect::Open, &[Path, Flags, Mode]),
    layout(libc::SYS_openat, "openat", Effect::Open, &[DirFd, Path, Flags, Mode]),
    layout(libc::SYS_openat2, "openat2", Effect::Open, &[DirFd, Path, OpenHow]),
    layout(libc::SYS_creat, "creat", Effect::Open, &[Path, Mode]),
    layout(libc::SYS_execve, "execve", Effect::Exec, &[Path]),
    layout(libc::SYS_execveat, "execveat", Effect::Exec, &[DirFd, Path, Skip, Skip, Flags]),
    layout(libc::SYS_unlink, "unlink", Effect::Value, &[Path]),
    layout(libc::SYS_unlinkat, "unlinkat", Effect::Value, &[DirFd, Path, Flags]),
    layout(libc::SYS_rmdir, "rmdir", Effect::Value, &[Path]),
    layout(libc::SYS_rename, "rename", Effect::Value, &[Path, Path]),
    layout(libc::SYS_renameat, "renameat", Effect::Value, &[DirFd, Path, DirFd, Path]),
    layout(
        libc::SYS_renameat2,
        "renameat2",
        Effect::Value,
        &[DirFd, Path, DirFd, Path, Flags],
    ),
    layout(libc::SYS_mkdir, "mkdir", Effect::Value, &[Path, Mode]),
    layout(libc::SYS_mkdirat, "mkdirat", Effect::Value, &[DirFd, Path, Mode]),
    layout(libc::SYS_link, "link", Effect::Value, &[Path, Path]),
    layout(libc::SYS_linkat, "linkat", Effect::Value, &[DirFd, Path, DirFd, Path, Flags]),
    layout(libc::SYS_symlink, "symlink", Effect::Value, &[Text, Path]),
    layout(libc::SYS_symlinkat, "symlinkat", Effect::Value, &[Text, DirFd, Path]),
    layout(libc::SYS_mknod, "mknod", Effect::Value, &[Path, Mode, Int]),
    layout(libc::SYS_mknodat, "mknodat", Effect::Value, &[DirFd, Path, Mode, Int]),
    layout(libc::SYS_chmod, "chmod", Effect::Value, &[Path, Mode]),
    layout(libc::SYS_fchmod, "fchmod", Effect::Continue, &[Fd, Mode]),
    layout(libc::SYS_fchmodat, "fchmodat", Effect::Value, &[DirFd, Path, Mode]),
    layout(libc::SYS_chown, "chown", Effect::Value, &[Path, Int, Int]),
    layout(libc::SYS_lchown, "lchown", Effect::Value, &[Path, Int, Int]),
    layout(libc::SYS_fchownat, "fchownat", Effect::Value, &[DirFd, Path, Int, Int, Flags]),
    layout(libc::SYS_truncate, "truncate", Effect::Value, &[Path, Int]),
    layout(libc::SYS_utime, "utime", Effect::Value, &[Path, Blob(16)]),
    layout(libc::SYS_utimes, "utimes", Effect::Value, &[Path, Blob(32)]),
    layout(libc::SYS_futimesat, "futimesat", Effect::Value, &[DirFd, PathOrNull, Blob(32)]),
    layout(
        libc::SYS_utimensat,
        "utimensat",
        Effect::Value,
        &[DirFd, PathOrNull, Blob(32), Flags],
    ),
    layout(libc::SYS_setxattr, "setxattr", Effect::Value, &[Path, Text, Payload, Int, Flags]),
    layout(libc::SYS_lsetxattr, "lsetxattr", Effect::Value, &[Path, Text, Payload, Int, Flags]),
    layout(libc::SYS_removexattr, "removexattr", Effect::Value, &[Path, Text]),
    layout(libc::SYS_lremovexattr, "lremovexattr", Effect::Value, &[Path, Text]),
    layout(libc::SYS_connect, "connect", Effect::Value, &[Fd, SockAddr]),
    layout(libc::SYS_bind, "bind", Effect::Value, &[Fd, SockAddr]),
    layout(libc::SYS_sendto, "sendto", Effect::Value, &[Fd, Payload, Int, Flags, SockAddr]),
    layout(libc::SYS_sendmsg, "sendmsg", Effect::SendMsg, &[Fd, MsgHdr, Flags]),
    layout(libc::SYS_sendmmsg, "sendmmsg", Effect::SendMmsg, &[Fd, MmsgHdrs, Int, Flags]),
    layout(libc::SYS_unshare, "unshare", Effect::Continue, &[Flags]),
    layout(libc::SYS_clone, "clone", Effect::Continue, &[Flags]),
    layout(libc::SYS_ioctl, "ioctl", Effect::Continue, &[Fd, Flags]),
];

/// Name of a syscall the bridge knows how to describe.
pub fn syscall_name(nr: i64) -> Option<&'static str> {
    LAYOUTS.iter().find(|l| l.nr == nr).map(|l| l.name)
}

/// Copy the arguments of syscall `nr` out of `thread` and decode them.
///
/// Unknown syscalls are named `syscall_<nr>` with all six registers as ints
/// and continue unchanged if approved.
pub fn capture(nr: i64, args: [u64; 6], thread: &dyn HaltedThread) -> (Operation, Capture) {
    let mut regs: [Reg; 6] = std::array::from_fn(|i| Reg::Value(args[i]));
    let Some(layout) = LAYOUTS.iter().find(|l| l.nr == nr) else {
        let op = Operation {
            syscall: format!("syscall_{nr}"),
            args: args.iter().map(|&r| Arg::Int(r as i64)).collect(),
        };
        let capture = Capture {
            nr,
            args,
            effect: Effect::Continue,
            regs,
            messages: Vec::new(),
            fault: None,
        };
        return (op, capture);
    };

    let mut decoded = Vec::with_capacity(layout.slots.len() + 1);
    let mut messages = Vec::new();
    let mut fault = None;
    let mut dirfd = libc::AT_FDCWD;

    for (i, slot) in layout.slots.iter().enumerate() {
        let reg = args[i];
        let next = args.get(i + 1).copied().unwrap_or(0);
        let copied: Result<(), i32> = match *slot {
            PathOrNull if reg == 0 => {
                decoded.push(Arg::Path {
                    path: String::new(),
                    resolved: thread.dir_path(dirfd).map(|base| normalize(&base)),
                });
                Ok(())
            }
            Path | PathOrNull => read_cstring(thread, reg).map(|raw| {
                let path = String::from_utf8_lossy(raw.as_bytes()).into_owned();
                let resolved = resolve(&path, dirfd, thread);
                decoded.push(Arg::Path { path, resolved });
                regs[i] = Reg::Path(raw);
            }),
            Text => read_cstring(thread, reg).map(|raw| {
                decoded.push(Arg::Text(
                    String::from_utf8_lossy(raw.as_bytes()).into_owned(),
                ));
                regs[i] = Reg::Str(raw);
            }),
            DirFd => {
                dirfd = reg as i32;
                decoded.push(Arg::DirFd(dirfd));
                regs[i] = Reg::Fd(dirfd);
                Ok(())
            }
            Fd => {
                decoded.push(Arg::Fd(reg as i32));
                regs[i] = Reg::Fd(reg as i32);
                Ok(())
            }
            Flags => {
                decoded.push(Arg::Flags(reg));
                Ok(())
            }
            Mode => {
                decoded.push(Arg::Mode(reg as u32));
                Ok(())
            }
            Int => {
                decoded.push(Arg::Int(reg as i64));
                Ok(())
            }
            OpenHow => read_open_how(thread, reg, next).map(|raw| {
                decoded.push(Arg::Flags(word(&raw, 0)));
                decoded.push(Arg::Mode(word(&raw, 8) as u32));
                regs[i] = Reg::Buffer(raw);
                regs[i + 1] = Reg::Value(OPEN_HOW_SIZE as u64);
            }),
            SockAddr => {
                let len = next as usize;
                if len > SOCKADDR_MAX {
                    Err(libc::EINVAL)
                } else {
                    read_exact(thread, reg, len).map(|raw| {
                        decoded.push(Arg::SockAddr(render_sockaddr(&raw)));
                        regs[i] = Reg::Buffer(raw);
                    })
                }
            }
            Payload => {
                let len = next as usize;
                if len > MAX_PAYLOAD {
                    Err(oversize_errno(nr))
                } else {
                    read_exact(thread, reg, len).map(|raw| regs[i] = Reg::Buffer(raw))
                }
            }
            Blob(_) if reg == 0 => Ok(()),
            Blob(size) => read_exact(thread, reg, size).map(|raw| regs[i] = Reg::Buffer(raw)),
            MsgHdr => read_exact(thread, reg, MSGHDR_SIZE)
                .and_then(|hdr| read_message(thread, &hdr))
                .map(|msg| messages.push(msg)),
            MmsgHdrs => {
                let count = (next as usize).min(IOV_MAX);
                read_exact(thread, reg, count * MMSGHDR_SIZE).and_then(|table| {
                    for entry in table.chunks_exact(MMSGHDR_SIZE) {
                        messages.push(read_message(thread, &entry[..MSGHDR_SIZE])?);
                    }
                    Ok(())
                })
            }
            Skip => Ok(()),
        };
        if let Err(errno) = copied {
            if matches!(*slot, Path | PathOrNull | Text | OpenHow | SockAddr) {
                decoded.push(Arg::Unreadable);
            }
            fault.get_or_insert(errno);
        }
    }

    if matches!(layout.effect, Effect::SendMsg | Effect::SendMmsg) {
        let sock = args[0] as i32;
        for msg in &messages {
            decoded.push(Arg::SockAddr(destination(msg, sock, thread)));
        }
    }

    let op = Operation {
        syscall: layout.name.to_string(),
        args: decoded,
    };
    let capture = Capture {
        nr,
        args,
        effect: layout.effect,
        regs,
        messages,
        fault,
    };
    (op, capture)
}

/// Lexically normalize an absolute path.
pub fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            part => parts.push(part),
        }
    }
    if parts.is_empty() {
        return "/".to_string();
    }
    let mut out = String::with_capacity(path.len());
    for part in parts {
        out.push('/');
        out.push_str(part);
    }
    out
}

fn resolve(path: &str, dirfd: i32, thread: &dyn HaltedThread) -> Option<String> {
    if path.starts_with('/') {
        return Some(normalize(path));
    }
    let base = thread.dir_path(dirfd)?;
    Some(normalize(&format!("{base}/{path}")))
}

fn oversize_errno(nr: i64) -> i32 {
    if nr == libc::SYS_setxattr || nr == libc::SYS_lsetxattr {
        libc::E2BIG
    } else {
        libc::EMSGSIZE
    }
}

fn word(raw: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&raw[at..at + 8]);
    u64::from_ne_bytes(bytes)
}

fn half(raw: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&raw[at..at + 4]);
    u32::from_ne_bytes(bytes)
}

/// Read a NUL-terminated string, page by page so a string ending just before
/// an unmapped page is still read.
fn read_cstring(thread: &dyn HaltedThread, addr: u64) -> Result<CString, i32> {
    const PAGE: u64 = 4096;
    if addr == 0 {
        return Err(libc::EFAULT);
    }
    let mut out = Vec::new();
    let mut cursor = addr;
    while out.len() < PATH_MAX {
        let to_page_end = (PAGE - cursor % PAGE) as usize;
        let mut chunk = vec![0u8; to_page_end.min(PATH_MAX - out.len())];
        let n = thread.read_at(cursor, &mut chunk).map_err(|_| libc::EFAULT)?;
        if n == 0 {
            return Err(libc::EFAULT);
        }
        if let Some(nul) = chunk[..n].iter().position(|&b| b == 0) {
            out.extend_from_slice(&chunk[..nul]);
            return CString::new(out).map_err(|_| libc::EINVAL);
        }
        out.extend_from_slice(&chunk[..n]);
        cursor = cursor.checked_add(n as u64).ok_or(libc::EFAULT)?;
    }
    Err(libc::ENAMETOOLONG)
}

fn read_exact(thread: &dyn HaltedThread, addr: u64, len: usize) -> Result<Vec<u8>, i32> {
    if len == 0 {
        return Ok(Vec::new());
    }
    if addr == 0 {
        return Err(libc::EFAULT);
    }
    let mut buf = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        let n = thread
            .read_at(addr + filled as u64, &mut buf[filled..])
            .map_err(|_| libc::EFAULT)?;
        if n == 0 {
            return Err(libc::EFAULT);
        }
        filled += n;
    }
    Ok(buf)
}

/// `struct open_how { u64 flags; u64 mode; u64 resolve; }`, possibly followed
/// by zeroed fields from a newer ABI.
fn read_open_how(thread: &dyn HaltedThread, addr: u64, size: u64) -> Result<Vec<u8>, i32> {
    if size < OPEN_HOW_SIZE as u64 {
        return Err(libc::EINVAL);
    }
    if size > 4096 {
        return Err(libc::E2BIG);
    }
    let mut raw = read_exact(thread, addr, size as usize)?;
    if raw[OPEN_HOW_SIZE..].iter().any(|&b| b != 0) {
        return Err(libc::E2BIG);
    }
    raw.truncate(OPEN_HOW_SIZE);
    Ok(raw)
}

/// Copy the name, data and control buffers of one `struct msghdr`.
fn read_message(thread: &dyn HaltedThread, hdr: &[u8]) -> Result<Message, i32> {
    let name_ptr = word(hdr, 0);
    let name_len = half(hdr, 8) as usize;
    let iov_ptr = word(hdr, 16);
    let iov_len = word(hdr, 24) as usize;
    let control_ptr = word(hdr, 32);
    let control_len = word(hdr, 40) as usize;

    let name = if name_ptr == 0 || name_len == 0 {
        None
    } else if name_len > SOCKADDR_MAX {
        return Err(libc::EINVAL);
    } else {
        Some(read_exact(thread, name_ptr, name_len)?)
    };

    if iov_len > IOV_MAX {
        return Err(libc::EMSGSIZE);
    }
    let iovecs = read_exact(thread, iov_ptr, iov_len * IOVEC_SIZE)?;
    let mut payload = Vec::new();
    for iov in iovecs.chunks_exact(IOVEC_SIZE) {
        let (base, len) = (word(iov, 0), word(iov, 8) as usize);
        if payload.len() + len > MAX_PAYLOAD {
            return Err(libc::EMSGSIZE);
        }
        payload.extend_from_slice(&read_exact(thread, base, len)?);
    }

    if control_len > CONTROL_MAX {
        return Err(libc::ENOBUFS);
    }
    let control = parse_control(&read_exact(thread, control_ptr, control_len)?)?;

    Ok(Message {
        name,
        payload,
        control,
    })
}

/// Split a control buffer into its `cmsghdr` records.
///
/// `SCM_CREDENTIALS` is refused: the kernel checks the claimed ids against
/// the sender, which would be the supervisor.
fn parse_control(raw: &[u8]) -> Result<Vec<Control>, i32> {
    let mut out = Vec::new();
    let mut at = 0;
    while at + CMSGHDR_SIZE <= raw.len() {
        let len = word(raw, at) as usize;
        let level = half(raw, at + 8) as i32;
        let kind = half(raw, at + 12) as i32;
        if len < CMSGHDR_SIZE || at + len > raw.len() {
            return Err(libc::EINVAL);
        }
        let data = &raw[at + CMSGHDR_SIZE..at + len];
        out.push(match (level, kind) {
            (libc::SOL_SOCKET, libc::SCM_RIGHTS) => Control::Rights(
                data.chunks_exact(4)
                    .map(|fd| i32::from_ne_bytes([fd[0], fd[1], fd[2], fd[3]]))
                    .collect(),
            ),
            (libc::SOL_SOCKET, libc::SCM_CREDENTIALS) => return Err(libc::EPERM),
            _ => Control::Other {
                level,
                kind,
                data: data.to_vec(),
            },
        });
        at += (len + 7) & !7;
    }
    Ok(out)
}

/// Where a message goes: its own name, else the socket's peer.
fn destination(msg: &Message, sock: i32, thread: &dyn HaltedThread) -> String {
    if let Some(name) = &msg.name {
        return render_sockaddr(name);
    }
    thread
        .dup_fd(sock)
        .ok()
        .and_then(|fd| peer_name(fd.as_fd()))
        .unwrap_or_else(|| "unconnected".to_string())
}

/// Rendered peer address of a connected socket.
pub fn peer_name(sock: BorrowedFd<'_>) -> Option<String> {
    let mut storage = MaybeUninit::<libc::sockaddr_storage>::zeroed();
    let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let ret = unsafe {
        libc::getpeername(
            sock.as_raw_fd(),
            storage.as_mut_ptr().cast::<libc::sockaddr>(),
            &mut len,
        )
    };
    if ret != 0 {
        return None;
    }
    // SAFETY: getpeername wrote `len` bytes into the zeroed storage.
    let bytes = unsafe {
        std::slice::from_raw_parts(storage.as_ptr().cast::<u8>(), len as usize)
    };
    Some(render_sockaddr(bytes))
}

/// Render a raw `sockaddr` for `AF_INET`, `AF_INET6` and `AF_UNIX`.
pub fn render_sockaddr(raw: &[u8]) -> String {
    if raw.len() < 2 {
        return "truncated".to_string();
    }
    let family = u16::from_ne_bytes([raw[0], raw[1]]) as i32;
    match family {
        libc::AF_INET if raw.len() >= 8 => {
            let port = u16::from_be_bytes([raw[2], raw[3]]);
            let ip = Ipv4Addr::new(raw[4], raw[5], raw[6], raw[7]);
            SocketAddrV4::new(ip, port).to_string()
        }
        libc::AF_INET6 if raw.len() >= 24 => {
            let port = u16::from_be_bytes([raw[2], raw[3]]);
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&raw[8..24]);
            SocketAddrV6::new(Ipv6Addr::from(octets), port, 0, 0).to_string()
        }
        libc::AF_UNIX => {
            let path = &raw[2..];
            match path.first() {
                None => "unix:unnamed".to_string(),
                Some(0) => {
                    let name = &path[1..];
                    format!("@{}", String::from_utf8_lossy(name))
                }
                Some(_) => {
                    let end = path.iter().position(|&b| b == 0).unwrap_or(path.len());
                    String::from_utf8_lossy(&path[..end]).into_owned()
                }
            }
        }
        other => format!("family={other}"),
    }
}
