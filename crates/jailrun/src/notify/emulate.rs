//! Performing approved syscalls on behalf of halted threads.
//!
//! The kernel would re-read a continued syscall's arguments from memory the
//! thread shares with its siblings. Instead, a worker carries the syscall out
//! itself, from the [`Capture`] the tool saw, after taking on the halted
//! thread's view of the system:
//!
//! | What | How |
//! |------|-----|
//! | root, cwd | `unshare(CLONE_FS)` once per worker, `chroot` through `/proc/<tid>/root` |
//! | umask | `umask`, private to the worker after the unshare |
//! | uids, gids, groups | raw per-thread `setgroups`/`setresgid`/`setresuid`, saved uid kept at 0 |
//! | fs ids | `setfsgid`/`setfsuid` |
//! | capabilities | effective set lowered to the thread's own |
//!
//! Descriptors named in arguments are duplicated with `pidfd_getfd`. A file
//! opened this way is installed in the thread with `SECCOMP_IOCTL_NOTIF_ADDFD`.
//!
//! `execve` cannot run elsewhere. It continues only while nothing else can
//! write the path: the process has one thread, the path sits in a private
//! mapping, and no other process shares the address space except a blocked
//! vfork parent.

use std::ffi::{CStr, CString};
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::FileExt;
use std::sync::Once;

use rustix::fs::{AtFlags, CWD, Dir, Mode, OFlags, openat, readlinkat, statat};
use rustix::process::{Pid, PidfdFlags, PidfdGetfdFlags, pidfd_getfd, pidfd_open};

use super::event::{Capture, Control, Effect, HaltedThread, Reg, normalize};
use crate::isolation::{CapSets, Credentials};

const KCMP_VM: libc::c_long = 1;

static KCMP_MISSING: Once = Once::new();

/// How a halted syscall is settled.
#[derive(Debug)]
pub enum Outcome {
    /// Let the kernel run it unchanged.
    Continue,
    /// Complete it with this return value.
    Value(i64),
    /// Fail it with this errno.
    Errno(i32),
    /// Complete it with a descriptor installed in the thread.
    Fd { fd: OwnedFd, cloexec: bool },
    /// Fail it with `EPERM` even though the tool allowed it.
    Refused(String),
}

/// Fields of `/proc/<tid>/status` the emulation depends on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadStatus {
    pub state: char,
    pub tgid: u32,
    pub ppid: u32,
    pub threads: u32,
    /// Real, effective, saved and filesystem uid.
    pub uid: [u32; 4],
    pub gid: [u32; 4],
    pub groups: Vec<u32>,
    pub umask: u32,
    pub cap_eff: u64,
    /// Thread group id in the innermost pid namespace.
    pub ns_tgid: u32,
    pub ns_tid: u32,
}

impl ThreadStatus {
    pub fn parse(text: &str) -> Option<Self> {
        let mut status = Self {
            umask: 0o022,
            ..Self::default()
        };
        for line in text.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match key {
                "State" => status.state = value.chars().next()?,
                "Tgid" => status.tgid = value.parse().ok()?,
                "PPid" => status.ppid = value.parse().ok()?,
                "Threads" => status.threads = value.parse().ok()?,
                "Uid" => status.uid = four_ids(value)?,
                "Gid" => status.gid = four_ids(value)?,
                "Groups" => {
                    status.groups = value
                        .split_whitespace()
                        .map(str::parse)
                        .collect::<Result<_, _>>()
                        .ok()?;
                }
                "Umask" => status.umask = u32::from_str_radix(value, 8).ok()?,
                "CapEff" => status.cap_eff = u64::from_str_radix(value, 16).ok()?,
                "NStgid" => status.ns_tgid = value.split_whitespace().last()?.parse().ok()?,
                "NSpid" => status.ns_tid = value.split_whitespace().last()?.parse().ok()?,
                _ => {}
            }
        }
        (status.tgid != 0).then_some(status)
    }
}

fn four_ids(value: &str) -> Option<[u32; 4]> {
    let mut ids = value.split_whitespace().map(str::parse::<u32>);
    let mut out = [0; 4];
    for slot in &mut out {
        *slot = ids.next()?.ok()?;
    }
    Some(out)
}

/// A worker's private root, working directory and umask.
#[derive(Debug)]
pub struct FsScope {
    host_root: OwnedFd,
    proc: OwnedFd,
}

impl FsScope {
    /// Detach the calling thread's filesystem context from the process.
    pub fn unshare() -> io::Result<Self> {
        if unsafe { libc::unshare(libc::CLONE_FS) } != 0 {
            return Err(io::Error::last_os_error());
        }
        let host_root = openat(
            CWD,
            "/",
            OFlags::PATH | OFlags::DIRECTORY | OFlags::CLOEXEC,
            Mode::empty(),
        )?;
        let proc = openat(
            CWD,
            "/proc",
            OFlags::RDONLY | OFlags::DIRECTORY | OFlags::CLOEXEC,
            Mode::empty(),
        )?;
        Ok(Self { host_root, proc })
    }

    /// Open everything needed to act for `tid`.
    pub fn attach(&self, tid: u32) -> io::Result<ProcThread> {
        let dir = openat(
            &self.proc,
            tid.to_string(),
            OFlags::PATH | OFlags::DIRECTORY | OFlags::CLOEXEC,
            Mode::empty(),
        )?;
        let (mem, writable) =
            match openat(&dir, "mem", OFlags::RDWR | OFlags::CLOEXEC, Mode::empty()) {
                Ok(fd) => (fd, true),
                Err(_) => (
                    openat(&dir, "mem", OFlags::RDONLY | OFlags::CLOEXEC, Mode::empty())?,
                    false,
                ),
            };
        let lookup = OFlags::PATH | OFlags::DIRECTORY | OFlags::CLOEXEC;
        let root = openat(&dir, "root", lookup, Mode::empty())?;
        let cwd = openat(&dir, "cwd", lookup, Mode::empty())?;

        let text = read_at_dir(&dir, "status")?;
        let status = ThreadStatus::parse(&text)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unparsable status"))?;
        let pid = Pid::from_raw(status.tgid as i32)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ESRCH))?;
        let pidfd = pidfd_open(pid, PidfdFlags::empty())?;

        Ok(ProcThread {
            dir,
            mem: File::from(mem),
            writable,
            root,
            cwd,
            pidfd,
            proc: self.proc.try_clone()?,
            status,
        })
    }

    /// Take on `thread`'s root, working directory and umask until the guard
    /// is dropped.
    pub fn enter(&self, thread: &ProcThread) -> io::Result<Entered<'_>> {
        let previous = unsafe { libc::umask(0o022) };
        let guard = Entered {
            scope: self,
            umask: previous,
        };
        if unsafe { libc::fchdir(thread.root.as_raw_fd()) } != 0
            || unsafe { libc::chroot(c".".as_ptr()) } != 0
            || unsafe { libc::fchdir(thread.cwd.as_raw_fd()) } != 0
        {
            return Err(io::Error::last_os_error());
        }
        unsafe { libc::umask(thread.status.umask as libc::mode_t) };
        Ok(guard)
    }
}

/// Restores the worker's own root and umask on drop.
pub struct Entered<'a> {
    scope: &'a FsScope,
    umask: libc::mode_t,
}

impl Drop for Entered<'_> {
    fn drop(&mut self) {
        unsafe { libc::umask(self.umask) };
        let restored = unsafe { libc::fchdir(self.scope.host_root.as_raw_fd()) } == 0
            && unsafe { libc::chroot(c".".as_ptr()) } == 0;
        if !restored {
            tracing::error!(error = %io::Error::last_os_error(), "cannot leave sandbox root");
        }
    }
}

fn read_at_dir(dir: &OwnedFd, name: &str) -> io::Result<String> {
    let fd = openat(dir, name, OFlags::RDONLY | OFlags::CLOEXEC, Mode::empty())?;
    let mut text = String::new();
    File::from(fd).read_to_string(&mut text)?;
    Ok(text)
}

/// A halted thread seen through its `/proc` entry, held open so a recycled
/// tid cannot be confused with it.
#[derive(Debug)]
pub struct ProcThread {
    dir: OwnedFd,
    mem: File,
    writable: bool,
    root: OwnedFd,
    cwd: OwnedFd,
    pidfd: OwnedFd,
    proc: OwnedFd,
    status: ThreadStatus,
}

impl HaltedThread for ProcThread {
    fn read_at(&self, addr: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.mem.read_at(buf, addr)
    }

    fn write_at(&self, addr: u64, data: &[u8]) -> io::Result<()> {
        if !self.writable {
            return Err(io::Error::from_raw_os_error(libc::EACCES));
        }
        self.mem.write_all_at(data, addr)
    }

    fn dup_fd(&self, fd: i32) -> io::Result<OwnedFd> {
        Ok(pidfd_getfd(&self.pidfd, fd, PidfdGetfdFlags::empty())?)
    }

    fn dir_path(&self, dirfd: i32) -> Option<String> {
        let link = if dirfd == libc::AT_FDCWD {
            "cwd".to_string()
        } else {
            format!("fd/{dirfd}")
        };
        let target = readlinkat(&self.dir, link, Vec::new()).ok()?;
        target.into_string().ok().filter(|p| p.starts_with('/'))
    }

    fn ns_ids(&self) -> Option<(u32, u32)> {
        (self.status.ns_tgid != 0).then_some((self.status.ns_tgid, self.status.ns_tid))
    }
}

impl ProcThread {
    pub fn status(&self) -> &ThreadStatus {
        &self.status
    }

    /// Carry out an approved syscall as the thread would have.
    pub fn perform(&self, capture: &Capture) -> Outcome {
        if let Some(errno) = capture.fault {
            return Outcome::Errno(errno);
        }
        match capture.effect {
            Effect::Continue => Outcome::Continue,
            Effect::Exec => match self.exec_hazard(capture) {
                None => Outcome::Continue,
                Some(reason) => Outcome::Refused(reason),
            },
            Effect::Open | Effect::Value | Effect::SendMsg | Effect::SendMmsg => {
                // descriptors first, pidfd_getfd needs our own capabilities
                let call = match Call::prepare(capture, self) {
                    Ok(call) => call,
                    Err(errno) => return Outcome::Errno(errno),
                };
                let _identity = match Assumed::take(&self.status) {
                    Ok(identity) => identity,
                    Err(e) => {
                        return Outcome::Refused(format!(
                            "cannot take on the thread's credentials: {e}"
                        ));
                    }
                };
                call.invoke()
            }
        }
    }

    /// Why the exec path could change between the verdict and the kernel
    /// reading it, if it could.
    fn exec_hazard(&self, capture: &Capture) -> Option<String> {
        let (addr, len) = match (capture.nr, &capture.regs) {
            (libc::SYS_execve, [Reg::Path(path), ..]) => (capture.args[0], path.as_bytes().len()),
            (_, [_, Reg::Path(path), ..]) => (capture.args[1], path.as_bytes().len()),
            _ => return Some("exec path was not captured".into()),
        };
        if self.status.threads != 1 {
            return Some(format!(
                "exec from a process with {} threads",
                self.status.threads
            ));
        }
        let maps = match read_at_dir(&self.dir, "maps") {
            Ok(maps) => maps,
            Err(e) => return Some(format!("cannot inspect memory: {e}")),
        };
        for at in [addr, addr + len as u64] {
            match mapping_private(&maps, at) {
                Some(true) => {}
                Some(false) => return Some("exec path lives in shared memory".into()),
                None => return Some("exec path is not mapped".into()),
            }
        }
        match self.mm_sharer() {
            Ok(None) => None,
            Ok(Some(pid)) => Some(format!("address space shared with pid {pid}")),
            Err(e) => Some(format!("cannot check address space sharing: {e}")),
        }
    }

    /// A process other than the thread's own that shares its address space.
    /// A single-threaded vfork parent blocked in the kernel is tolerated.
    fn mm_sharer(&self) -> io::Result<Option<u32>> {
        let own_ns = statat(&self.dir, "ns/pid", AtFlags::empty())?.st_ino;
        let tgid = self.status.tgid;
        for entry in Dir::read_from(&self.proc)? {
            let entry = entry?;
            let Some(pid) = entry
                .file_name()
                .to_str()
                .ok()
                .and_then(|name| name.parse::<u32>().ok())
            else {
                continue;
            };
            if pid == tgid {
                continue;
            }
            match statat(&self.proc, format!("{pid}/ns/pid"), AtFlags::empty()) {
                Ok(st) if st.st_ino == own_ns => {}
                _ => continue,
            }
            let ret = unsafe {
                libc::syscall(
                    libc::SYS_kcmp,
                    tgid as libc::c_long,
                    pid as libc::c_long,
                    KCMP_VM,
                    0 as libc::c_long,
                    0 as libc::c_long,
                )
            };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::ENOSYS) {
                    KCMP_MISSING.call_once(|| {
                        tracing::warn!("kcmp unavailable, exec address space sharing unchecked");
                    });
                    return Ok(None);
                }
                // raced with an exit
                continue;
            }
            if ret != 0 {
                continue;
            }
            if pid == self.status.ppid && blocked_vfork_parent(&self.proc, pid) {
                continue;
            }
            return Ok(Some(pid));
        }
        Ok(None)
    }
}

fn blocked_vfork_parent(proc: &OwnedFd, pid: u32) -> bool {
    let Ok(dir) = openat(
        proc,
        pid.to_string(),
        OFlags::PATH | OFlags::DIRECTORY | OFlags::CLOEXEC,
        Mode::empty(),
    ) else {
        return false;
    };
    read_at_dir(&dir, "status")
        .ok()
        .and_then(|text| ThreadStatus::parse(&text))
        .is_some_and(|parent| parent.threads == 1 && parent.state == 'D')
}

/// Whether the mapping holding `addr` in `/proc/<pid>/maps` content is
/// private; `None` if no mapping holds it.
pub fn mapping_private(maps: &str, addr: u64) -> Option<bool> {
    maps.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        let (start, end) = fields.next()?.split_once('-')?;
        let start = u64::from_str_radix(start, 16).ok()?;
        let end = u64::from_str_radix(end, 16).ok()?;
        if !(start..end).contains(&addr) {
            return None;
        }
        Some(fields.next()?.as_bytes().get(3) == Some(&b'p'))
    })
}

/// Whether a send on this socket needs no verdict: connected TCP and unix
/// stream sockets ignore the destination unless `MSG_FASTOPEN` asks for one.
pub fn destination_ignored(capture: &Capture, thread: &dyn HaltedThread) -> bool {
    let flags = match capture.nr {
        libc::SYS_sendmsg => capture.args[2],
        libc::SYS_sendto | libc::SYS_sendmmsg => capture.args[3],
        _ => return false,
    };
    if flags & libc::MSG_FASTOPEN as u64 != 0 {
        return false;
    }
    let Ok(sock) = thread.dup_fd(capture.args[0] as i32) else {
        return false;
    };
    let sock = sock.as_fd();
    match (
        sockopt(sock, libc::SO_DOMAIN),
        sockopt(sock, libc::SO_TYPE),
        sockopt(sock, libc::SO_PROTOCOL),
    ) {
        (Some(libc::AF_UNIX), Some(libc::SOCK_STREAM | libc::SOCK_SEQPACKET), _) => true,
        (Some(libc::AF_INET | libc::AF_INET6), Some(libc::SOCK_STREAM), Some(libc::IPPROTO_TCP)) => {
            true
        }
        _ => false,
    }
}

fn sockopt(sock: BorrowedFd<'_>, opt: libc::c_int) -> Option<libc::c_int> {
    let mut value: libc::c_int = 0;
    let mut len = size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            sock.as_raw_fd(),
            libc::SOL_SOCKET,
            opt,
            (&mut value as *mut libc::c_int).cast(),
            &mut len,
        )
    };
    (ret == 0).then_some(value)
}

/// Map a path that means "this process" to the process's own `/proc` entry,
/// which the supervisor can resolve.
pub fn proc_alias(path: &CStr, ids: Option<(u32, u32)>) -> Option<CString> {
    let (tgid, tid) = ids?;
    let path = path.to_str().ok()?;
    if !path.starts_with('/') {
        return None;
    }
    let normal = normalize(path);
    let under = |prefix: &str| {
        normal
            .strip_prefix(prefix)
            .filter(|rest| rest.is_empty() || rest.starts_with('/'))
    };
    let mapped = if let Some(rest) = under("/proc/self") {
        format!("/proc/{tgid}{rest}")
    } else if let Some(rest) = under("/proc/thread-self") {
        format!("/proc/{tgid}/task/{tid}{rest}")
    } else if let Some(rest) = under("/dev/fd") {
        format!("/proc/{tgid}/fd{rest}")
    } else {
        let fd = match normal.as_str() {
            "/dev/stdin" => 0,
            "/dev/stdout" => 1,
            "/dev/stderr" => 2,
            _ => return None,
        };
        format!("/proc/{tgid}/fd/{fd}")
    };
    CString::new(mapped).ok()
}

/// A captured syscall with every register pointing at supervisor memory.
pub struct Call<'a> {
    capture: &'a Capture,
    thread: &'a dyn HaltedThread,
    nr: i64,
    regs: [libc::c_long; 6],
    cloexec: bool,
    /// Keeps duplicated descriptors alive until the call is made.
    held: Vec<OwnedFd>,
    /// Rewritten strings and buffers the registers point into.
    owned: Vec<Vec<u8>>,
    controls: Vec<Vec<u8>>,
}

impl<'a> Call<'a> {
    pub fn prepare(capture: &'a Capture, thread: &'a dyn HaltedThread) -> Result<Self, i32> {
        let mut call = Call {
            capture,
            thread,
            nr: capture.nr,
            regs: [0; 6],
            cloexec: false,
            held: Vec::new(),
            owned: Vec::new(),
            controls: Vec::new(),
        };
        for (i, reg) in capture.regs.iter().enumerate() {
            call.regs[i] = match reg {
                Reg::Value(v) => *v as libc::c_long,
                Reg::Path(path) => match proc_alias(path, thread.ns_ids()) {
                    Some(alias) => call.own(alias.into_bytes_with_nul()),
                    None => path.as_ptr() as libc::c_long,
                },
                Reg::Str(text) => text.as_ptr() as libc::c_long,
                Reg::Buffer(buf) => buf.as_ptr() as libc::c_long,
                Reg::Fd(fd) if *fd < 0 => libc::c_long::from(*fd),
                Reg::Fd(fd) => match thread.dup_fd(*fd) {
                    Ok(dup) => {
                        let raw = dup.as_raw_fd();
                        call.held.push(dup);
                        libc::c_long::from(raw)
                    }
                    Err(_) => -1,
                },
            };
        }

        let forced = libc::c_long::from(libc::O_CLOEXEC | libc::O_NOCTTY);
        match capture.nr {
            libc::SYS_open | libc::SYS_openat => {
                let at = usize::from(capture.nr == libc::SYS_openat) + 1;
                call.cloexec = call.regs[at] & libc::c_long::from(libc::O_CLOEXEC) != 0;
                call.regs[at] |= forced;
            }
            libc::SYS_openat2 => {
                let Reg::Buffer(how) = &capture.regs[2] else {
                    return Err(libc::EFAULT);
                };
                let mut how = how.clone();
                let mut flags = [0u8; 8];
                flags.copy_from_slice(&how[..8]);
                let flags = u64::from_ne_bytes(flags);
                call.cloexec = flags & libc::O_CLOEXEC as u64 != 0;
                how[..8].copy_from_slice(&(flags | forced as u64).to_ne_bytes());
                call.regs[2] = call.own(how);
            }
            libc::SYS_creat => {
                call.nr = libc::SYS_open;
                call.regs[2] = call.regs[1];
                call.regs[1] = libc::c_long::from(libc::O_CREAT | libc::O_WRONLY | libc::O_TRUNC)
                    | forced;
            }
            _ => {}
        }

        for msg in &capture.messages {
            let control = call.encode_control(&msg.control)?;
            call.controls.push(control);
        }
        Ok(call)
    }

    fn own(&mut self, bytes: Vec<u8>) -> libc::c_long {
        let ptr = bytes.as_ptr() as libc::c_long;
        self.owned.push(bytes);
        ptr
    }

    /// Rebuild a control buffer with `SCM_RIGHTS` descriptors duplicated
    /// into the supervisor.
    fn encode_control(&mut self, control: &[Control]) -> Result<Vec<u8>, i32> {
        let mut out = Vec::new();
        for record in control {
            let (level, kind, data) = match record {
                Control::Rights(fds) => {
                    let mut data = Vec::with_capacity(fds.len() * 4);
                    for &fd in fds {
                        let dup = self.thread.dup_fd(fd).map_err(|_| libc::EBADF)?;
                        data.extend_from_slice(&dup.as_raw_fd().to_ne_bytes());
                        self.held.push(dup);
                    }
                    (libc::SOL_SOCKET, libc::SCM_RIGHTS, data)
                }
                Control::Other { level, kind, data } => (*level, *kind, data.clone()),
            };
            out.extend_from_slice(&((16 + data.len()) as u64).to_ne_bytes());
            out.extend_from_slice(&level.to_ne_bytes());
            out.extend_from_slice(&kind.to_ne_bytes());
            out.extend_from_slice(&data);
            out.resize((out.len() + 7) & !7, 0);
        }
        Ok(out)
    }

    /// Make the syscall. Errno is taken before anything else can clobber it.
    pub fn invoke(&self) -> Outcome {
        match self.capture.effect {
            Effect::SendMsg | Effect::SendMmsg => return self.send(),
            Effect::Open | Effect::Value => {}
            Effect::Exec | Effect::Continue => return Outcome::Continue,
        }
        let r = self.regs;
        let ret = unsafe { libc::syscall(self.nr, r[0], r[1], r[2], r[3], r[4], r[5]) };
        if ret < 0 {
            return Outcome::Errno(last_errno());
        }
        if self.capture.effect == Effect::Open {
            // SAFETY: a successful open returns a fresh descriptor we own.
            let fd = unsafe { OwnedFd::from_raw_fd(ret as RawFd) };
            Outcome::Fd {
                fd,
                cloexec: self.cloexec,
            }
        } else {
            Outcome::Value(ret)
        }
    }

    fn send(&self) -> Outcome {
        let many = self.capture.effect == Effect::SendMmsg;
        let sock = self.regs[0] as RawFd;
        let flags = (if many { self.regs[3] } else { self.regs[2] }) as libc::c_int;
        let mut sent = 0i64;

        for (i, (msg, control)) in self.capture.messages.iter().zip(&self.controls).enumerate() {
            let mut iov = libc::iovec {
                iov_base: msg.payload.as_ptr() as *mut libc::c_void,
                iov_len: msg.payload.len(),
            };
            // SAFETY: msghdr is a plain C struct; zero is a valid empty header.
            let mut hdr: libc::msghdr = unsafe { std::mem::zeroed() };
            if let Some(name) = &msg.name {
                hdr.msg_name = name.as_ptr() as *mut libc::c_void;
                hdr.msg_namelen = name.len() as libc::socklen_t;
            }
            hdr.msg_iov = &mut iov;
            hdr.msg_iovlen = 1;
            if !control.is_empty() {
                hdr.msg_control = control.as_ptr() as *mut libc::c_void;
                hdr.msg_controllen = control.len();
            }

            let ret = unsafe { libc::sendmsg(sock, &hdr, flags) };
            if ret < 0 {
                let errno = last_errno();
                if sent == 0 {
                    return Outcome::Errno(errno);
                }
                break;
            }
            if !many {
                return Outcome::Value(ret as i64);
            }
            // mmsghdr.msg_len follows the 56-byte msghdr
            let at = self.capture.args[1] + (i as u64) * 64 + 56;
            if let Err(e) = self.thread.write_at(at, &(ret as u32).to_ne_bytes()) {
                tracing::debug!(error = %e, "cannot report sendmmsg length");
            }
            sent += 1;
        }
        if many {
            Outcome::Value(sent)
        } else {
            Outcome::Errno(libc::EFAULT)
        }
    }
}

fn last_errno() -> i32 {
    io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::EIO)
}

/// The halted thread's credentials on the calling thread, until dropped.
///
/// Raw syscalls keep the change to this thread; the libc wrappers would
/// apply it to every thread of the supervisor.
struct Assumed {
    ids: Credentials,
    caps: CapSets,
}

impl Assumed {
    fn take(status: &ThreadStatus) -> io::Result<Self> {
        let ids = Credentials::current().map_err(io::Error::other)?;
        let caps = CapSets::current().map_err(io::Error::other)?;
        let saved_uid = ids.uid[2];
        let saved_gid = ids.gid[2];
        let assumed = Self { ids, caps };

        raw(unsafe {
            libc::syscall(
                libc::SYS_setgroups,
                status.groups.len() as libc::c_long,
                status.groups.as_ptr(),
            )
        })?;
        raw(unsafe {
            libc::syscall(
                libc::SYS_setresgid,
                libc::c_long::from(status.gid[0]),
                libc::c_long::from(status.gid[1]),
                libc::c_long::from(saved_gid),
            )
        })?;
        raw(unsafe {
            libc::syscall(
                libc::SYS_setresuid,
                libc::c_long::from(status.uid[0]),
                libc::c_long::from(status.uid[1]),
                libc::c_long::from(saved_uid),
            )
        })?;
        // the uid change cleared the effective set
        caps.apply().map_err(io::Error::other)?;
        unsafe {
            libc::syscall(libc::SYS_setfsgid, libc::c_long::from(status.gid[3]));
            libc::syscall(libc::SYS_setfsuid, libc::c_long::from(status.uid[3]));
        }
        CapSets {
            effective: status.cap_eff & caps.permitted,
            ..caps
        }
        .apply()
        .map_err(io::Error::other)?;
        Ok(assumed)
    }
}

impl Drop for Assumed {
    fn drop(&mut self) {
        let [ruid, euid, suid] = self.ids.uid;
        let [rgid, egid, sgid] = self.ids.gid;
        let restored = self
            .caps
            .apply()
            .map_err(io::Error::other)
            .and_then(|()| {
                raw(unsafe {
                    libc::syscall(
                        libc::SYS_setresuid,
                        libc::c_long::from(ruid),
                        libc::c_long::from(euid),
                        libc::c_long::from(suid),
                    )
                })
            })
            .and_then(|()| {
                raw(unsafe {
                    libc::syscall(
                        libc::SYS_setresgid,
                        libc::c_long::from(rgid),
                        libc::c_long::from(egid),
                        libc::c_long::from(sgid),
                    )
                })
            })
            .and_then(|()| {
                raw(unsafe {
                    libc::syscall(
                        libc::SYS_setgroups,
                        self.ids.groups.len() as libc::c_long,
                        self.ids.groups.as_ptr(),
                    )
                })
            })
            .and_then(|()| self.caps.apply().map_err(io::Error::other));
        if let Err(e) = restored {
            tracing::error!(error = %e, "cannot restore supervisor credentials");
        }
    }
}

fn raw(ret: libc::c_long) -> io::Result<()> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}
