//! Common utilities for launcher tests.

use std::path::Path;

use jailrun::SandboxRequest;

/// Uid of the test process, so no identity transition is needed.
pub fn own_uid() -> u32 {
    unsafe { libc::getuid() }
}

/// A request for `/bin/true` as the invoking uid.
pub fn request(root: &Path, tool: &str) -> jailrun::RequestBuilder {
    SandboxRequest::builder(["/bin/true"], root, own_uid(), tool)
}

/// Whether this host can run sandboxes at all.
pub fn supported() -> bool {
    jailrun_sys::check().is_ok()
}
