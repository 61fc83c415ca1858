//! System capability checking.
//!
//! Verifies at runtime that the kernel supports all required features for the
//! sandbox runner. The check is performed once and cached in a static `OnceLock`.
//!
//! ## Required Features
//!
//! | Feature | Minimum | Check Method |
//! |---------|---------|--------------|
//! | Kernel | 5.14 | `uname` syscall |
//! | Machine | x86_64 | `uname` syscall |
//! | Seccomp | enabled | `prctl(PR_GET_SECCOMP)` |
//!
//! The syscall numbers, the BPF arch check and the notify ioctl values are all
//! x86_64-specific, hence the machine requirement.

use std::sync::OnceLock;

use rustix::system::uname;
use thiserror::Error;

use crate::seccomp;

/// Information about the system's sandboxing capabilities.
#[derive(Debug, Clone)]
pub struct SystemInfo {
    pub kernel_version: (u32, u32, u32),
    pub machine: String,
    pub seccomp_enabled: bool,
}

/// Errors that can occur during system capability checking.
#[derive(Debug, Clone, Error)]
pub enum CheckError {
    #[error("kernel version {}.{}.{} is too old, need at least {}.{}.{}", .found.0, .found.1, .found.2, .required.0, .required.1, .required.2)]
    KernelTooOld {
        required: (u32, u32, u32),
        found: (u32, u32, u32),
    },

    #[error("unsupported architecture {0}, only x86_64 is supported")]
    UnsupportedArch(String),

    #[error("seccomp is not available")]
    SeccompNotAvailable,

    #[error("failed to read kernel version")]
    KernelVersionReadFailed,
}

// 5.14: atomic NOTIF_ADDFD with SECCOMP_ADDFD_FLAG_SEND, cgroup.kill
const MIN_KERNEL_VERSION: (u32, u32, u32) = (5, 14, 0);

static SYSTEM_INFO: OnceLock<Result<SystemInfo, CheckError>> = OnceLock::new();

/// Check system capabilities and cache the result.
///
/// Subsequent calls return the cached result.
pub fn check() -> Result<&'static SystemInfo, &'static CheckError> {
    SYSTEM_INFO.get_or_init(check_impl).as_ref()
}

fn check_impl() -> Result<SystemInfo, CheckError> {
    let uts = uname();
    let release = uts
        .release()
        .to_str()
        .map_err(|_| CheckError::KernelVersionReadFailed)?;
    let kernel_version = parse_kernel_version(release)?;
    if kernel_version < MIN_KERNEL_VERSION {
        return Err(CheckError::KernelTooOld {
            required: MIN_KERNEL_VERSION,
            found: kernel_version,
        });
    }

    let machine = uts.machine().to_string_lossy().into_owned();
    if machine != "x86_64" {
        return Err(CheckError::UnsupportedArch(machine));
    }

    let seccomp_enabled = seccomp::seccomp_available();
    if !seccomp_enabled {
        return Err(CheckError::SeccompNotAvailable);
    }

    Ok(SystemInfo {
        kernel_version,
        machine,
        seccomp_enabled,
    })
}

fn parse_kernel_version(release: &str) -> Result<(u32, u32, u32), CheckError> {
    let parts: Vec<&str> = release.split('.').collect();
    if parts.len() < 2 {
        return Err(CheckError::KernelVersionReadFailed);
    }

    let major = parts[0]
        .parse::<u32>()
        .map_err(|_| CheckError::KernelVersionReadFailed)?;

    let minor = parts[1]
        .split('-')
        .next()
        .and_then(|m| m.parse::<u32>().ok())
        .ok_or(CheckError::KernelVersionReadFailed)?;

    // Patch might have additional suffix like "0-generic"
    let patch = parts
        .get(2)
        .and_then(|p| p.split('-').next())
        .and_then(|p| p.parse::<u32>().ok())
        .unwrap_or(0);

    Ok((major, minor, patch))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kernel_version() {
        assert_eq!(parse_kernel_version("5.15.0").unwrap(), (5, 15, 0));
        assert_eq!(parse_kernel_version("6.1.0-generic").unwrap(), (6, 1, 0));
        assert_eq!(
            parse_kernel_version("5.4.0-150-generic").unwrap(),
            (5, 4, 0)
        );
        assert_eq!(parse_kernel_version("6.8-rc1").unwrap(), (6, 8, 0));
    }

    #[test]
    fn test_parse_kernel_version_garbage() {
        assert!(parse_kernel_version("linux").is_err());
        assert!(parse_kernel_version("x.y.z").is_err());
    }

    #[test]
    fn old_kernel_is_rejected() {
        assert!((5, 9, 0) < MIN_KERNEL_VERSION);
        assert!((5, 14, 0) >= MIN_KERNEL_VERSION);
    }

    #[test]
    fn test_check() {
        match check() {
            Ok(info) => {
                println!("Kernel version: {:?}", info.kernel_version);
                println!("Machine: {}", info.machine);
                println!("Seccomp enabled: {}", info.seccomp_enabled);
            }
            Err(e) => {
                println!("System check failed: {e}");
            }
        }
    }
}
