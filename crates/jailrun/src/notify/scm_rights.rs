//! Control socket between the runner and the sandboxed child.
//!
//! The child reports each setup milestone as a [`ChildReport`] datagram on an
//! `AF_UNIX SOCK_SEQPACKET` socketpair. The seccomp listener fd travels with
//! [`ChildReport::Armed`] as `SCM_RIGHTS` ancillary data. The parent answers
//! with a single go byte once the bridge is live.
//!
//! Message boundaries are preserved by `SOCK_SEQPACKET`, so each report is one
//! `sendmsg`/`recvmsg` pair with no framing of its own.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Largest encoded report.
const REPORT_MAX: usize = 4096;
const GO: u8 = b'G';

/// Setup milestone reported by the sandboxed child.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "report")]
pub enum ChildReport {
    MountsReady,
    PrivilegeDropped,
    /// Enforcement is installed; the listener fd is attached.
    Armed,
    Failed { stage: String, message: String },
}

/// Create an `AF_UNIX SOCK_SEQPACKET` socketpair.
///
/// Returns `(parent_sock, child_sock)`. After the clone, the parent drops
/// `child_sock` and the child drops `parent_sock`.
pub fn create_socketpair() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0i32; 2];
    let ret = unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_SEQPACKET | libc::SOCK_CLOEXEC,
            0,
            fds.as_mut_ptr(),
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// Send one report, optionally with an fd attached.
pub fn send_report(
    socket: BorrowedFd<'_>,
    report: &ChildReport,
    fd: Option<BorrowedFd<'_>>,
) -> io::Result<()> {
    let body = rmp_serde::to_vec_named(report).map_err(io::Error::other)?;
    let iov = libc::iovec {
        iov_base: body.as_ptr() as *mut libc::c_void,
        iov_len: body.len(),
    };

    let cmsg_space = unsafe { libc::CMSG_SPACE(size_of::<RawFd>() as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &iov as *const _ as *mut _;
    msg.msg_iovlen = 1;

    if let Some(fd) = fd {
        msg.msg_control = cmsg_buf.as_mut_ptr().cast();
        msg.msg_controllen = cmsg_space;

        let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
        if cmsg.is_null() {
            return Err(io::Error::other("CMSG_FIRSTHDR null"));
        }
        let raw = fd.as_raw_fd();
        unsafe {
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(size_of::<RawFd>() as u32) as usize;
            std::ptr::copy_nonoverlapping(
                (&raw as *const RawFd).cast::<u8>(),
                libc::CMSG_DATA(cmsg),
                size_of::<RawFd>(),
            );
        }
    }

    let ret = unsafe { libc::sendmsg(socket.as_raw_fd(), &msg, libc::MSG_NOSIGNAL) };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Receive one report. `Ok(None)` when the peer closed its end.
pub fn recv_report(socket: BorrowedFd<'_>) -> io::Result<Option<(ChildReport, Option<OwnedFd>)>> {
    let mut body = vec![0u8; REPORT_MAX];
    let mut iov = libc::iovec {
        iov_base: body.as_mut_ptr().cast(),
        iov_len: body.len(),
    };

    let cmsg_space = unsafe { libc::CMSG_SPACE(size_of::<RawFd>() as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast();
    msg.msg_controllen = cmsg_space;

    let n = loop {
        let ret = unsafe { libc::recvmsg(socket.as_raw_fd(), &mut msg, libc::MSG_CMSG_CLOEXEC) };
        if ret >= 0 {
            break ret as usize;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    };
    if n == 0 {
        return Ok(None);
    }

    let mut fd = None;
    let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
    if !cmsg.is_null() {
        unsafe {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let mut raw: RawFd = -1;
                std::ptr::copy_nonoverlapping(
                    libc::CMSG_DATA(cmsg),
                    (&mut raw as *mut RawFd).cast::<u8>(),
                    size_of::<RawFd>(),
                );
                fd = Some(OwnedFd::from_raw_fd(raw));
            }
        }
    }

    if msg.msg_flags & libc::MSG_TRUNC != 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "report truncated"));
    }
    let report = rmp_serde::from_slice(&body[..n])
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Some((report, fd)))
}

/// Wait until `socket` is readable or `deadline` passes. Returns `false` on timeout.
pub fn wait_readable(socket: BorrowedFd<'_>, deadline: Instant) -> io::Result<bool> {
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let mut pfd = libc::pollfd {
            fd: socket.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout = remaining.as_millis().min(i32::MAX as u128) as i32;
        let ret = unsafe { libc::poll(&mut pfd, 1, timeout) };
        if ret > 0 {
            return Ok(true);
        }
        if ret == 0 {
            return Ok(false);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Release the child.
pub fn send_go(socket: BorrowedFd<'_>) -> io::Result<()> {
    let ret = unsafe {
        libc::send(
            socket.as_raw_fd(),
            (&GO as *const u8).cast(),
            1,
            libc::MSG_NOSIGNAL,
        )
    };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Block until the go byte arrives. `false` if the parent hung up instead.
pub fn wait_go(socket: BorrowedFd<'_>) -> io::Result<bool> {
    let mut byte = 0u8;
    loop {
        let ret = unsafe { libc::recv(socket.as_raw_fd(), (&mut byte as *mut u8).cast(), 1, 0) };
        if ret >= 0 {
            return Ok(ret == 1 && byte == GO);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}
