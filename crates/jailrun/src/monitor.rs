//! Process monitoring and outcome classification.
//!
//! Waits for the sandboxed child using its `pidfd`, multiplexed with mio over:
//!
//! - **pidfd** - readable when the child exits (no races vs `waitpid`)
//! - **signalfd** - SIGINT, SIGTERM or SIGHUP delivered to the runner
//! - **timeout** - the optional wall-clock deadline
//!
//! A signal or the deadline fires the [`KillSwitch`]; the loop then keeps
//! waiting until the kernel reports the exit, so the child is always reaped.
//!
//! ## Exit Detection
//!
//! Uses `waitid(P_PIDFD, ...)`:
//! - `CLD_EXITED` - normal exit with exit code
//! - `CLD_KILLED` / `CLD_DUMPED` - killed by signal

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use crate::notify::{KillCause, KillSwitch, PolicyEvent, PolicyVerdict};

const CHILD: Token = Token(0);
const SIGNAL: Token = Token(1);

/// Signals that abort a session.
pub const ABORT_SIGNALS: [libc::c_int; 3] = [libc::SIGINT, libc::SIGTERM, libc::SIGHUP];

/// Outcome category of a session that ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The command exited on its own.
    Completed,
    /// Killed on a `Terminate` verdict, a lost channel or an abort signal.
    Violated,
    /// Killed by a signal nobody sent on purpose.
    Crashed,
    TimedOut,
}

/// Result of a sandboxed run.
#[derive(Debug, Clone)]
pub struct SandboxResult {
    pub status: Status,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    /// Why the tree was killed, if it was.
    pub violation: Option<KillCause>,
    /// Non-`Allow` decisions, in the order they were applied.
    pub events: Vec<(PolicyEvent, PolicyVerdict)>,
    /// Every event forwarded to the tool.
    pub total_events: u64,
    pub duration: Duration,
}

impl SandboxResult {
    #[inline]
    pub fn success(&self) -> bool {
        self.status == Status::Completed && self.exit_code == Some(0)
    }

    /// Decisions that denied an operation.
    pub fn denials(&self) -> impl Iterator<Item = &(PolicyEvent, PolicyVerdict)> {
        self.events
            .iter()
            .filter(|(_, v)| matches!(v, PolicyVerdict::Deny(_)))
    }
}

/// How the child ended, as reported by `waitid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

/// Pick the status for an exit given the kill cause, if any.
pub fn classify(exit: ExitInfo, cause: Option<&KillCause>) -> Status {
    match cause {
        Some(KillCause::TimedOut) => Status::TimedOut,
        Some(_) => Status::Violated,
        None if exit.signal.is_some() => Status::Crashed,
        None => Status::Completed,
    }
}

/// Abort signals blocked and routed to a `signalfd`.
///
/// Dropping the guard restores the previous mask.
#[derive(Debug)]
pub struct SignalGuard {
    fd: OwnedFd,
    previous: libc::sigset_t,
}

impl SignalGuard {
    pub fn block() -> io::Result<Self> {
        let mut mask: libc::sigset_t = unsafe { std::mem::zeroed() };
        let mut previous: libc::sigset_t = unsafe { std::mem::zeroed() };
        unsafe {
            libc::sigemptyset(&mut mask);
            for sig in ABORT_SIGNALS {
                libc::sigaddset(&mut mask, sig);
            }
            if libc::pthread_sigmask(libc::SIG_BLOCK, &mask, &mut previous) != 0 {
                return Err(io::Error::last_os_error());
            }
        }

        let fd = unsafe { libc::signalfd(-1, &mask, libc::SFD_NONBLOCK | libc::SFD_CLOEXEC) };
        if fd < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::pthread_sigmask(libc::SIG_SETMASK, &previous, std::ptr::null_mut()) };
            return Err(err);
        }
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
            previous,
        })
    }

    /// Restore the mask the runner had before [`SignalGuard::block`].
    ///
    /// Called in the child right after the clone.
    pub fn restore(&self) {
        unsafe { libc::pthread_sigmask(libc::SIG_SETMASK, &self.previous, std::ptr::null_mut()) };
    }

    #[inline]
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    /// Drain pending signals; returns the last one read.
    pub fn drain(&self) -> Option<i32> {
        let mut last = None;
        loop {
            let mut info: libc::signalfd_siginfo = unsafe { std::mem::zeroed() };
            let size = size_of::<libc::signalfd_siginfo>();
            let ret = unsafe {
                libc::read(
                    self.fd.as_raw_fd(),
                    (&mut info as *mut libc::signalfd_siginfo).cast(),
                    size,
                )
            };
            if ret != size as isize {
                return last;
            }
            last = Some(info.ssi_signo as i32);
        }
    }
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        self.restore();
    }
}

/// Wait for the child to exit, enforcing `deadline` and abort signals.
pub fn watch(
    kill: &KillSwitch,
    signals: &SignalGuard,
    deadline: Option<Instant>,
) -> io::Result<ExitInfo> {
    let pidfd = kill
        .pidfd()
        .ok_or_else(|| io::Error::other("kill switch without pidfd"))?;
    let pidfd_raw = pidfd.as_raw_fd();
    let signal_raw = signals.fd().as_raw_fd();

    let mut poll = Poll::new()?;
    poll.registry()
        .register(&mut SourceFd(&pidfd_raw), CHILD, Interest::READABLE)?;
    poll.registry()
        .register(&mut SourceFd(&signal_raw), SIGNAL, Interest::READABLE)?;

    let mut events = Events::with_capacity(4);
    let mut deadline = deadline;
    loop {
        let timeout = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        if let Err(e) = poll.poll(&mut events, timeout) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(e);
        }

        if let Some(d) = deadline {
            if Instant::now() >= d {
                kill.fire(KillCause::TimedOut);
                deadline = None;
            }
        }

        for event in &events {
            match event.token() {
                SIGNAL => {
                    if let Some(signal) = signals.drain() {
                        tracing::warn!(signal, "runner interrupted");
                        kill.fire(KillCause::Aborted { signal });
                    }
                }
                CHILD => return wait_for_exit(pidfd_raw),
                _ => {}
            }
        }
    }
}

pub(crate) fn wait_for_exit(pidfd: RawFd) -> io::Result<ExitInfo> {
    let mut siginfo: libc::siginfo_t = unsafe { std::mem::zeroed() };
    let ret = loop {
        let ret = unsafe {
            libc::waitid(
                libc::P_PIDFD,
                pidfd as libc::id_t,
                &mut siginfo,
                libc::WEXITED,
            )
        };
        if ret < 0 && io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
            continue;
        }
        break ret;
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    let code = siginfo.si_code;
    let status = unsafe { siginfo.si_status() };

    match code {
        libc::CLD_EXITED => Ok(ExitInfo {
            code: Some(status),
            signal: None,
        }),
        libc::CLD_KILLED | libc::CLD_DUMPED => Ok(ExitInfo {
            code: None,
            signal: Some(status),
        }),
        _ => Ok(ExitInfo::default()),
    }
}
