//! Error taxonomy for the sandbox runner.
//!
//! Errors abort a session before or around the sandboxed command. Policy
//! violations, crashes and timeouts are not errors: they are [`Status`]
//! categories of a completed [`SandboxResult`].
//!
//! | Error | Raised by | Exit code |
//! |-------|-----------|-----------|
//! | [`SetupError`] | request validation, mount view, system check, cgroup, child handshake | 111 |
//! | [`PrivilegeError`] | identity transition | 112 |
//! | [`ChannelError`] | enforcement tool spawn or handshake | 114 |
//! | `Internal` | fork, poll, wait | 117 |
//!
//! [`Status`]: crate::monitor::Status
//! [`SandboxResult`]: crate::monitor::SandboxResult

use std::io;
use std::path::PathBuf;

use rustix::io::Errno;
use thiserror::Error;

use crate::validate::ValidationError;

/// Top-level error returned by [`crate::Launcher::run`].
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("setup: {0}")]
    Setup(#[from] SetupError),

    #[error("privilege: {0}")]
    Privilege(#[from] PrivilegeError),

    #[error("enforcement channel: {0}")]
    Channel(#[from] ChannelError),

    #[error("internal: {context}: {source}")]
    Internal {
        context: &'static str,
        #[source]
        source: io::Error,
    },
}

impl SandboxError {
    pub(crate) fn internal(context: &'static str, source: impl Into<io::Error>) -> Self {
        Self::Internal {
            context,
            source: source.into(),
        }
    }
}

/// Failure while building the sandbox, before the command runs.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("invalid request: {0}")]
    Validation(#[from] ValidationError),

    #[error("mount: {0}")]
    Mount(#[from] MountError),

    #[error("unsupported system: {0}")]
    Unsupported(String),

    #[error("staging directory: {0}")]
    Staging(io::Error),

    #[error("sandboxed child failed during {stage}: {message}")]
    Child { stage: String, message: String },

    #[error("handshake: {0}")]
    Handshake(String),

    #[error("cgroup {path}: {source}")]
    Cgroup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Mount view construction errors.
#[derive(Debug, Error)]
pub enum MountError {
    #[error("mount root {0} does not exist")]
    RootMissing(PathBuf),

    #[error("mount root {0} is not a directory")]
    RootNotDirectory(PathBuf),

    #[error("host path {0} does not exist or is not a directory")]
    HostNotDirectory(PathBuf),

    #[error("guest path {0} resolves outside the mount root")]
    GuestEscape(PathBuf),

    #[error("guest path {0} is not a usable mount point")]
    GuestNotDirectory(PathBuf),

    #[error("cannot create mount point {path}: {source}")]
    CreateMountPoint {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("bind {host} -> {guest}: {errno}")]
    Bind {
        host: PathBuf,
        guest: PathBuf,
        errno: Errno,
    },

    #[error("{step}: {errno}")]
    Step { step: &'static str, errno: Errno },

    #[error("io: {0}")]
    Io(#[from] io::Error),
}

/// Identity transition errors.
#[derive(Debug, Error)]
pub enum PrivilegeError {
    #[error("cannot assume uid {target}: invoker lacks {missing}")]
    InsufficientRights { target: u32, missing: &'static str },

    #[error("{call}: {errno}")]
    Syscall { call: &'static str, errno: Errno },

    #[error("{field} is {found} after transition, expected {expected}")]
    Mismatch {
        field: &'static str,
        expected: u32,
        found: u32,
    },

    #[error("uid 0 could be regained after dropping to uid {0}")]
    Reversible(u32),

    /// A transition failure reported by the sandboxed child.
    #[error("{0}")]
    InChild(String),
}

/// Enforcement tool communication errors.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("cannot spawn enforcement tool {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("io: {0}")]
    Io(#[from] io::Error),

    #[error("encode: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("decode: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("frame of {0} bytes exceeds the 1 MiB limit")]
    FrameTooLarge(usize),

    #[error("channel closed")]
    Closed,
}
