//! Lifecycle of one sandboxed invocation.
//!
//! ```text
//! Created ─▶ MountsReady ─▶ PrivilegeDropped ─▶ Running ─┬─▶ Completed ─┐
//!    │            │                 │                    ├─▶ Violated  ─┤
//!    │            │                 │                    ├─▶ Crashed   ─┼─▶ TornDown
//!    │            │                 │                    └─▶ TimedOut  ─┘
//!    └────────────┴─────────────────┴──── setup failure ───────────────────▶ TornDown
//! ```
//!
//! [`SandboxSession::teardown`] runs on every path, including drop, and is
//! idempotent.

use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rustix::process::{Signal, pidfd_send_signal};
use thiserror::Error;

use crate::isolation::SessionCgroup;
use crate::monitor::{SignalGuard, Status, wait_for_exit};
use crate::mounts::MountPlan;
use crate::notify::{Bridge, BridgeReport, KillSwitch, ToolChannel};
use crate::workspace::Workspace;

/// How long the tool gets to exit after its stdin closes.
const TOOL_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    MountsReady,
    PrivilegeDropped,
    Running,
    Completed,
    Violated,
    Crashed,
    TimedOut,
    TornDown,
}

impl From<Status> for SessionState {
    fn from(status: Status) -> Self {
        match status {
            Status::Completed => SessionState::Completed,
            Status::Violated => SessionState::Violated,
            Status::Crashed => SessionState::Crashed,
            Status::TimedOut => SessionState::TimedOut,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal session transition {from:?} -> {to:?}")]
pub struct IllegalTransition {
    pub from: SessionState,
    pub to: SessionState,
}

impl SessionState {
    /// Move to `next`, rejecting anything the lifecycle does not allow.
    pub fn advance(&mut self, next: SessionState) -> Result<(), IllegalTransition> {
        use SessionState::*;

        let legal = match (*self, next) {
            (_, TornDown) => true,
            (Created, MountsReady) => true,
            (MountsReady, PrivilegeDropped) => true,
            (PrivilegeDropped, Running) => true,
            (Running, Completed | Violated | Crashed | TimedOut) => true,
            _ => false,
        };
        if !legal {
            return Err(IllegalTransition {
                from: *self,
                to: next,
            });
        }
        *self = next;
        Ok(())
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed
                | SessionState::Violated
                | SessionState::Crashed
                | SessionState::TimedOut
                | SessionState::TornDown
        )
    }
}

/// Short hex id, unique enough per host for hostnames and tool logs.
pub fn session_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    format!("{:016x}", nanos ^ (u64::from(std::process::id()) << 40))
}

/// Everything one invocation holds. Owned by the launcher.
pub struct SandboxSession {
    id: String,
    state: SessionState,
    pub(crate) plan: MountPlan,
    pub(crate) workspace: Option<Workspace>,
    pub(crate) tool: Option<ToolChannel>,
    pub(crate) signals: Option<SignalGuard>,
    pub(crate) kill: Option<Arc<KillSwitch>>,
    pub(crate) bridge: Option<Bridge>,
    pub(crate) cgroup: Option<SessionCgroup>,
    pub(crate) child: Option<libc::pid_t>,
    reaped: bool,
}

impl SandboxSession {
    pub(crate) fn new(plan: MountPlan, workspace: Workspace) -> Self {
        Self {
            id: session_id(),
            state: SessionState::Created,
            plan,
            workspace: Some(workspace),
            tool: None,
            signals: None,
            kill: None,
            bridge: None,
            cgroup: None,
            child: None,
            reaped: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn advance(&mut self, next: SessionState) -> Result<(), IllegalTransition> {
        let from = self.state;
        self.state.advance(next)?;
        tracing::debug!(session = %self.id, ?from, to = ?next, "session state");
        Ok(())
    }

    pub(crate) fn mark_reaped(&mut self) {
        self.reaped = true;
    }

    /// Stop mediation, shut the tool down and collect the bridge's record.
    pub(crate) fn stop_enforcement(&mut self) -> BridgeReport {
        if let Some(bridge) = self.bridge.as_ref() {
            bridge.begin_stop();
        }
        // workers may be blocked writing to the tool until it is gone
        if let Some(tool) = self.tool.as_mut() {
            tool.shutdown(TOOL_GRACE);
        }
        match self.bridge.as_mut() {
            Some(bridge) => {
                bridge.stop();
                bridge.join_reader();
                bridge.report()
            }
            None => BridgeReport::default(),
        }
    }

    /// Release every resource; safe to call repeatedly.
    pub fn teardown(&mut self) {
        if self.state == SessionState::TornDown {
            return;
        }

        if let Some(bridge) = self.bridge.as_ref() {
            bridge.begin_stop();
        }

        if !self.reaped {
            if let Some(pidfd) = self.kill.as_ref().and_then(|k| k.pidfd()) {
                let _ = pidfd_send_signal(pidfd, Signal::KILL);
                if let Err(e) = wait_for_exit(pidfd.as_raw_fd()) {
                    tracing::warn!(error = %e, "cannot reap sandboxed child");
                }
                self.reaped = true;
            } else if let Some(pid) = self.child {
                unsafe {
                    libc::kill(pid, libc::SIGKILL);
                    libc::waitpid(pid, std::ptr::null_mut(), 0);
                }
                self.reaped = true;
            }
        }

        if let Some(tool) = self.tool.as_mut() {
            tool.shutdown(TOOL_GRACE);
        }
        if let Some(mut bridge) = self.bridge.take() {
            bridge.stop();
            bridge.join_reader();
        }

        if let Some(cgroup) = self.cgroup.take() {
            if let Err(e) = cgroup.remove() {
                tracing::warn!(error = %e, "cannot remove session cgroup");
            }
        }

        self.plan.remove_created_dirs();
        if let Some(workspace) = self.workspace.take() {
            if let Err(e) = workspace.close() {
                tracing::warn!(error = %e, "cannot remove staging directory");
            }
        }
        self.signals.take();

        // Any state may be torn down.
        let _ = self.advance(SessionState::TornDown);
    }
}

impl Drop for SandboxSession {
    fn drop(&mut self) {
        self.teardown();
    }
}
