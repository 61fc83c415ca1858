//! Per-session scratch resources on the runner side.
//!
//! - **staging**: an empty temporary directory (`/tmp/jailrun-XXXXXX`). In the
//!   child's mount namespace the mount root is bound onto it and it becomes
//!   `/` after `pivot_root`. In the runner's namespace it stays empty and is
//!   removed when the workspace drops.
//! - **control**: the `SOCK_SEQPACKET` pair carrying child reports and the
//!   seccomp listener fd.
//!
//! ## Socket Hygiene
//!
//! After the clone each side must drop the other's end, otherwise EOF is never
//! seen when the peer dies:
//! - Parent drops: `child_sock`
//! - Child drops: `parent_sock`

use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::Path;

use tempfile::TempDir;

use crate::notify::scm_rights;

/// Temporary staging directory plus the control socketpair.
#[derive(Debug)]
pub struct Workspace {
    staging: TempDir,
    parent_sock: OwnedFd,
    child_sock: Option<OwnedFd>,
}

impl Workspace {
    pub fn new() -> io::Result<Self> {
        Self::with_prefix("jailrun-")
    }

    pub fn with_prefix(prefix: &str) -> io::Result<Self> {
        let staging = TempDir::with_prefix(prefix)?;
        let (parent_sock, child_sock) = scm_rights::create_socketpair()?;
        Ok(Self {
            staging,
            parent_sock,
            child_sock: Some(child_sock),
        })
    }

    #[inline]
    pub fn staging(&self) -> &Path {
        self.staging.path()
    }

    #[inline]
    pub fn parent_sock(&self) -> BorrowedFd<'_> {
        self.parent_sock.as_fd()
    }

    /// The child's end; `None` once taken.
    pub fn take_child_sock(&mut self) -> Option<OwnedFd> {
        self.child_sock.take()
    }

    /// Remove the staging directory now, reporting failures.
    pub fn close(self) -> io::Result<()> {
        self.staging.close()
    }
}
