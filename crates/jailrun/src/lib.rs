//! jailrun: run one command in an isolated filesystem view, as an
//! unprivileged identity, with its file and network operations mediated by an
//! external enforcement tool.
//!
//! Isolation layers, in the order the sandboxed child applies them:
//!
//! - **Mount namespace** - the mount root plus bind entries, entered with
//!   `pivot_root`; every bind is reversible until the pivot succeeds
//! - **PID, IPC, UTS, cgroup and network namespaces**
//! - **Capabilities** - bounding set and ambient set cleared
//! - **Identity** - one-way drop to the target uid/gid, verified afterwards
//! - **Rlimits** - open files, processes, data size, no core dumps
//! - **Seccomp user notification** - monitored syscalls halt until the tool
//!   answers `Allow`, `Deny` or `Terminate`
//!
//! ## Quick Start
//!
//! ```ignore
//! use jailrun::{Launcher, MountEntry, SandboxRequest};
//!
//! let request = SandboxRequest::builder(["/bin/pwd"], "./root", 1000, "/usr/bin/jailrun-oracle")
//!     .entry("./src:/tmp/lim".parse::<MountEntry>()?)
//!     .build()?;
//! let result = Launcher::new().run(&request)?;
//! println!("{:?} {:?}", result.status, result.exit_code);
//! ```
//!
//! ## Requirements
//!
//! - Linux 5.14+ on x86_64, seccomp enabled
//! - Root, or `CAP_SETUID` + `CAP_SETGID` + `CAP_SYS_ADMIN`

#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod error;
pub mod isolation;
pub mod launcher;
pub mod monitor;
pub mod mounts;
pub mod notify;
pub mod report;
pub mod request;
pub mod session;
pub mod validate;
pub mod workspace;

pub use error::{ChannelError, MountError, PrivilegeError, SandboxError, SetupError};
pub use isolation::CgroupLimits;
pub use launcher::Launcher;
pub use monitor::{SandboxResult, Status};
pub use notify::{Arg, KillCause, Operation, PolicyEvent, PolicyVerdict, ToolMessage, VerdictMessage};
pub use request::{Limits, MountEntry, RequestBuilder, SandboxRequest, ToolSpec, split_command};
pub use session::{SandboxSession, SessionState};
pub use validate::ValidationError;
