//! Sandbox launcher.
//!
//! [`Launcher::run`] drives one invocation from a validated
//! [`SandboxRequest`] to a [`SandboxResult`]:
//!
//! ```text
//! parent                                   child (new mount/pid/ipc/uts/net ns)
//! ──────                                   ────────────────────────────────────
//! check system, assume-identity check
//! prepare mount plan, staging, socketpair
//! spawn enforcement tool
//! block SIGINT/SIGTERM/SIGHUP
//! create session cgroup
//! clone ─────────────────────────────────▶ restore signal mask, PDEATHSIG
//! move child into cgroup
//!                                          binds + pivot_root + /proc
//!        ◀──────────────── MountsReady ─── hostname, bounding set
//!                                          setgroups/setresgid/setresuid
//!        ◀─────────── PrivilegeDropped ─── chdir, rlimits
//!                                          install seccomp listener
//!        ◀────────── Armed + listener fd ─ wait for go
//! Hello to tool, start bridge
//! go ────────────────────────────────────▶ close fds ≥ 3, execve
//! watch pidfd + signalfd + deadline
//! classify, stop bridge, teardown
//! ```
//!
//! Every path out of [`Launcher::run`] goes through
//! [`SandboxSession::teardown`], so the child is reaped, the tool is shut down,
//! the cgroup and created mount points are removed even when setup fails half
//! way.

use std::convert::Infallible;
use std::ffi::CString;
use std::io::{self, Write as _};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use jailrun_sys::seccomp::{MONITORED_SYSCALLS, build_mediation_filter};
use jailrun_sys::seccomp_notify::install_listener;
use rustix::io::Errno;
use rustix::process::{Pid, PidfdFlags, pidfd_open};

use crate::error::{PrivilegeError, SandboxError, SetupError};
use crate::isolation::{
    CGROUP_ROOT, Identity, SessionCgroup, apply_rlimits, cgroup2_mounted, clone_flags, clone_into_namespaces, close_extra_fds,
    default_hostname, drop_bounding_caps, drop_to, ensure_can_assume, enter_view,
    kill_with_parent, set_hostname,
};
use crate::monitor::{SandboxResult, SignalGuard, classify, watch};
use crate::mounts::{self, MountPlan};
use crate::notify::channel::PROTOCOL_VERSION;
use crate::notify::scm_rights::{self, ChildReport};
use crate::notify::{Bridge, KillSwitch, ToolChannel, ToolMessage};
use crate::request::{Limits, SandboxRequest};
use crate::session::{SandboxSession, SessionState};
use crate::workspace::Workspace;

/// Time allowed from the clone until enforcement is armed.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Exit code of the child when setup fails before `execve`.
const SETUP_FAILED: i32 = 126;
/// Exit code of the child when `execve` itself fails.
const EXEC_FAILED: i32 = 127;

const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Runs sandboxed commands.
#[derive(Debug, Clone)]
pub struct Launcher {
    handshake_timeout: Duration,
}

impl Default for Launcher {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

impl Launcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override how long the child may take to reach the armed state.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Run one request to completion.
    ///
    /// Policy violations, crashes and timeouts are reported through
    /// [`SandboxResult::status`]; errors mean the command never ran to a
    /// classifiable end.
    pub fn run(&self, request: &SandboxRequest) -> Result<SandboxResult, SandboxError> {
        jailrun_sys::check().map_err(|e| SetupError::Unsupported(e.to_string()))?;

        let target = Identity::from_uid(request.uid());
        ensure_can_assume(target)?;

        let plan = mounts::prepare(request.mount_root(), request.entries()).map_err(SetupError::from)?;
        let workspace = Workspace::new().map_err(SetupError::Staging)?;
        let mut session = SandboxSession::new(plan, workspace);

        let result = self.run_session(&mut session, request, target);
        session.teardown();
        result
    }

    fn run_session(
        &self,
        session: &mut SandboxSession,
        request: &SandboxRequest,
        target: Identity,
    ) -> Result<SandboxResult, SandboxError> {
        let mut tool = ToolChannel::spawn(request.tool())?;
        let sender = tool.sender();
        let reader = tool.take_reader();
        session.tool = Some(tool);

        let signals = SignalGuard::block().map_err(|e| SandboxError::internal("block signals", e))?;
        session.signals = Some(signals);

        let hostname = request
            .hostname()
            .map_or_else(|| default_hostname(session.id()), str::to_owned);
        let exec = ExecImage::new(request)
            .map_err(|_| SandboxError::internal("command line", io::Error::from(Errno::INVAL)))?;
        let workdir = CString::new(request.workdir().as_os_str().as_encoded_bytes())
            .map_err(|_| SandboxError::internal("working directory", io::Error::from(Errno::INVAL)))?;

        if let Some(limits) = request.limits().cgroup {
            let root = Path::new(CGROUP_ROOT);
            if !cgroup2_mounted(root) {
                return Err(SetupError::Cgroup {
                    path: root.to_path_buf(),
                    source: io::Error::other("no cgroup2 hierarchy mounted"),
                }
                .into());
            }
            session.cgroup = Some(limits.create(root, session.id())?);
        }

        let Some(workspace) = session.workspace.as_mut() else {
            return Err(SandboxError::internal("workspace", io::Error::other("already closed")));
        };
        let Some(child_sock) = workspace.take_child_sock() else {
            return Err(SandboxError::internal("workspace", io::Error::other("control socket taken")));
        };
        let parent_sock_raw = workspace.parent_sock().as_raw_fd();

        // The runner has no other threads yet: the tool was spawned without
        // helpers and the bridge starts after the handshake.
        let pid = match unsafe { clone_into_namespaces(clone_flags(request.share_net())) } {
            Err(errno) => return Err(SandboxError::internal("clone", io::Error::from(errno))),
            Ok(None) => {
                let ctx = ChildContext {
                    plan: &session.plan,
                    staging: session.workspace.as_ref().map(Workspace::staging),
                    signals: session.signals.as_ref(),
                    hostname: &hostname,
                    target,
                    workdir: &workdir,
                    limits: request.limits(),
                    exec: &exec,
                    parent_sock: parent_sock_raw,
                };
                child_main(&ctx, child_sock)
            }
            Ok(Some(pid)) => pid,
        };
        drop(child_sock);
        session.child = Some(pid);
        tracing::info!(session = %session.id(), pid, "sandboxed child started");

        // The child waits for go before exec, so nothing it runs escapes.
        if let Some(cgroup) = session.cgroup.as_ref() {
            cgroup.add_process(pid as u32)?;
        }

        let pidfd = pidfd_open(unsafe { Pid::from_raw_unchecked(pid) }, PidfdFlags::empty())
            .map_err(|e| SandboxError::internal("pidfd_open", io::Error::from(e)))?;
        let kill = Arc::new(KillSwitch::new(pidfd));
        session.kill = Some(Arc::clone(&kill));

        let listener = self.handshake(session)?;

        sender.send(&ToolMessage::Hello {
            version: PROTOCOL_VERSION,
            session: session.id().to_owned(),
            pid: pid as u32,
        })?;

        let Some(reader) = reader else {
            return Err(SandboxError::internal("enforcement tool", io::Error::other("verdict reader taken")));
        };
        let bridge = Bridge::start(listener, sender, reader, Arc::clone(&kill))
            .map_err(|e| SandboxError::internal("start enforcement bridge", e))?;
        session.bridge = Some(bridge);

        let started = Instant::now();
        let deadline = request.timeout().map(|t| started + t);
        if let Some(workspace) = session.workspace.as_ref() {
            scm_rights::send_go(workspace.parent_sock())
                .map_err(|e| SandboxError::internal("release child", e))?;
        }
        advance(session, SessionState::Running)?;

        let Some(signals) = session.signals.as_ref() else {
            return Err(SandboxError::internal("signals", io::Error::other("guard missing")));
        };
        let exit = watch(&kill, signals, deadline)
            .map_err(|e| SandboxError::internal("wait for sandboxed child", e))?;
        session.mark_reaped();
        let duration = started.elapsed();

        if let Some(kills) = session.cgroup.as_ref().map(SessionCgroup::oom_kills).filter(|&n| n > 0) {
            tracing::warn!(session = %session.id(), kills, "cgroup memory limit hit");
        }

        let violation = kill.cause();
        let status = classify(exit, violation.as_ref());
        advance(session, status.into())?;

        let report = session.stop_enforcement();
        tracing::info!(
            session = %session.id(),
            ?status,
            code = ?exit.code,
            signal = ?exit.signal,
            events = report.total_events,
            "sandboxed command finished"
        );

        Ok(SandboxResult {
            status,
            exit_code: exit.code,
            signal: exit.signal,
            violation,
            events: report.ledger,
            total_events: report.total_events,
            duration,
        })
    }

    /// Follow the child's setup reports until it is armed.
    fn handshake(&self, session: &mut SandboxSession) -> Result<OwnedFd, SandboxError> {
        let deadline = Instant::now() + self.handshake_timeout;
        loop {
            let (report, fd) = {
                let Some(workspace) = session.workspace.as_ref() else {
                    return Err(SandboxError::internal("workspace", io::Error::other("already closed")));
                };
                let sock = workspace.parent_sock();
                let ready = scm_rights::wait_readable(sock, deadline)
                    .map_err(|e| SandboxError::internal("wait for child report", e))?;
                if !ready {
                    return Err(SetupError::Handshake(format!(
                        "child not armed within {:?} (state {:?})",
                        self.handshake_timeout,
                        session.state()
                    ))
                    .into());
                }
                match scm_rights::recv_report(sock) {
                    Ok(Some(received)) => received,
                    Ok(None) => {
                        return Err(SetupError::Handshake(format!(
                            "child exited during setup (state {:?})",
                            session.state()
                        ))
                        .into());
                    }
                    Err(e) => return Err(SetupError::Handshake(e.to_string()).into()),
                }
            };

            tracing::debug!(session = %session.id(), ?report, "child report");
            match report {
                ChildReport::MountsReady => advance(session, SessionState::MountsReady)?,
                ChildReport::PrivilegeDropped => advance(session, SessionState::PrivilegeDropped)?,
                ChildReport::Armed => {
                    return fd.ok_or_else(|| {
                        SetupError::Handshake("armed report without listener fd".into()).into()
                    });
                }
                ChildReport::Failed { stage, message } if stage == STAGE_PRIVILEGE => {
                    return Err(PrivilegeError::InChild(message).into());
                }
                ChildReport::Failed { stage, message } => {
                    return Err(SetupError::Child { stage, message }.into());
                }
            }
        }
    }
}

fn advance(session: &mut SandboxSession, next: SessionState) -> Result<(), SandboxError> {
    session
        .advance(next)
        .map_err(|e| SandboxError::internal("session state", io::Error::other(e)))
}

const STAGE_PRIVILEGE: &str = "privilege";

/// `execve` arguments, built before the clone.
#[derive(Debug)]
struct ExecImage {
    /// Paths to try, in `PATH` order when `argv[0]` has no slash.
    candidates: Vec<CString>,
    argv: Vec<CString>,
    envp: Vec<CString>,
}

impl ExecImage {
    fn new(request: &SandboxRequest) -> Result<Self, std::ffi::NulError> {
        let argv = request
            .argv()
            .iter()
            .map(|arg| CString::new(arg.as_bytes()))
            .collect::<Result<Vec<_>, _>>()?;
        let envp = request
            .env()
            .iter()
            .map(|(k, v)| CString::new(format!("{k}={v}")))
            .collect::<Result<Vec<_>, _>>()?;

        let program = request.argv().first().map(String::as_str).unwrap_or_default();
        let search = request.env().get("PATH").map_or(DEFAULT_PATH, String::as_str);
        let candidates = search_candidates(program, search)
            .into_iter()
            .map(CString::new)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            candidates,
            argv,
            envp,
        })
    }
}

/// Paths `program` may live at, resolved like `execvp`.
fn search_candidates(program: &str, search: &str) -> Vec<String> {
    if program.contains('/') {
        return vec![program.to_owned()];
    }
    search
        .split(':')
        .map(|dir| if dir.is_empty() { "." } else { dir })
        .map(|dir| format!("{}/{program}", dir.trim_end_matches('/')))
        .collect()
}

struct ChildContext<'a> {
    plan: &'a MountPlan,
    staging: Option<&'a Path>,
    signals: Option<&'a SignalGuard>,
    hostname: &'a str,
    target: Identity,
    workdir: &'a CString,
    limits: Limits,
    exec: &'a ExecImage,
    parent_sock: libc::c_int,
}

struct ChildFailure {
    stage: &'static str,
    message: String,
}

impl ChildFailure {
    fn new(stage: &'static str, message: impl ToString) -> Self {
        Self {
            stage,
            message: message.to_string(),
        }
    }
}

/// Child side of the clone. Never returns.
fn child_main(ctx: &ChildContext<'_>, sock: OwnedFd) -> ! {
    if let Some(signals) = ctx.signals {
        signals.restore();
    }
    unsafe { libc::close(ctx.parent_sock) };

    let failure = match child_setup(ctx, sock.as_fd()) {
        Ok(never) => match never {},
        Err(failure) => failure,
    };
    let report = ChildReport::Failed {
        stage: failure.stage.to_owned(),
        message: failure.message,
    };
    if scm_rights::send_report(sock.as_fd(), &report, None).is_err() {
        writeln!(io::stderr(), "jailrun: setup failed during {}", failure.stage).ok();
    }
    unsafe { libc::_exit(SETUP_FAILED) }
}

/// Build the sandbox from the inside, then exec. Returns only on failure.
///
/// 1. PDEATHSIG
/// 2. Mount view and pivot
/// 3. Hostname, bounding set
/// 4. Identity transition
/// 5. chdir + rlimits
/// 6. Seccomp listener, handed to the parent
/// 7. Wait for go
/// 8. `close_range(3, MAX, 0)` + execve
fn child_setup(ctx: &ChildContext<'_>, sock: BorrowedFd<'_>) -> Result<Infallible, ChildFailure> {
    kill_with_parent().map_err(|e| ChildFailure::new("pdeathsig", e))?;

    let staging = ctx
        .staging
        .ok_or_else(|| ChildFailure::new("mounts", "staging directory missing"))?;
    enter_view(ctx.plan, staging).map_err(|e| ChildFailure::new("mounts", e))?;
    report(sock, ChildReport::MountsReady, None)?;

    set_hostname(ctx.hostname).map_err(|e| ChildFailure::new("hostname", e))?;
    drop_bounding_caps().map_err(|e| ChildFailure::new("capabilities", e))?;
    drop_to(ctx.target).map_err(|e| ChildFailure::new(STAGE_PRIVILEGE, e))?;
    report(sock, ChildReport::PrivilegeDropped, None)?;

    if unsafe { libc::chdir(ctx.workdir.as_ptr()) } != 0 {
        let errno = jailrun_sys::last_errno();
        return Err(ChildFailure::new(
            "workdir",
            format!("chdir {}: {errno}", ctx.workdir.to_string_lossy()),
        ));
    }
    apply_rlimits(&ctx.limits).map_err(|e| ChildFailure::new("rlimits", e))?;

    let filter = build_mediation_filter(MONITORED_SYSCALLS);
    let listener = unsafe { install_listener(&filter) }.map_err(|e| ChildFailure::new("seccomp", e))?;
    report(sock, ChildReport::Armed, Some(listener.as_fd()))?;
    drop(listener);

    match scm_rights::wait_go(sock) {
        Ok(true) => {}
        Ok(false) => return Err(ChildFailure::new("go", "runner hung up")),
        Err(e) => return Err(ChildFailure::new("go", e)),
    }

    // The control socket closes here; failures past this point go to stderr.
    close_extra_fds();
    exec_command(ctx.exec)
}

fn report(
    sock: BorrowedFd<'_>,
    report: ChildReport,
    fd: Option<BorrowedFd<'_>>,
) -> Result<(), ChildFailure> {
    scm_rights::send_report(sock, &report, fd).map_err(|e| ChildFailure::new("report", e))
}

fn exec_command(exec: &ExecImage) -> ! {
    let argv_ptrs: Vec<*const libc::c_char> = exec
        .argv
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect();
    let envp_ptrs: Vec<*const libc::c_char> = exec
        .envp
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect();

    let mut errno = Errno::NOENT;
    let path = exec
        .candidates
        .iter()
        .find(|candidate| exec.candidates.len() == 1 || is_executable(candidate));
    if let Some(path) = path {
        unsafe { libc::execve(path.as_ptr(), argv_ptrs.as_ptr(), envp_ptrs.as_ptr()) };
        errno = jailrun_sys::last_errno();
    }

    let program = exec
        .argv
        .first()
        .map(|a| a.to_string_lossy().into_owned())
        .unwrap_or_default();
    writeln!(io::stderr(), "jailrun: cannot execute {program}: {errno}").ok();
    unsafe { libc::_exit(EXEC_FAILED) }
}

/// Regular file with at least one execute bit.
fn is_executable(path: &CString) -> bool {
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::stat(path.as_ptr(), &mut st) } != 0 {
        return false;
    }
    st.st_mode & libc::S_IFMT == libc::S_IFREG && st.st_mode & 0o111 != 0
}
