//! Isolation mechanisms for the sandboxed child.
//!
//! - **cgroups** - per-session cgroup v2 limits
//! - **namespace** - raw clone into new namespaces, hostname
//! - **rootfs** - private mount table, binds, `pivot_root`
//! - **credentials** - irreversible uid/gid transition
//! - **hardening** - bounding set, rlimits, fd cleanup

mod cgroups;
mod credentials;
mod hardening;
mod namespace;
mod rootfs;

pub use cgroups::{CGROUP_ROOT, CgroupLimits, SessionCgroup, cgroup2_mounted};
pub use credentials::{CapSets, Credentials, Identity, drop_to, ensure_can_assume};
pub use hardening::{DROPPED_CAPABILITIES, apply_rlimits, close_extra_fds, drop_bounding_caps};
pub use namespace::{
    clone_flags, clone_into_namespaces, default_hostname, kill_with_parent, set_hostname,
};
pub use rootfs::{KernelMounts, enter_view};
