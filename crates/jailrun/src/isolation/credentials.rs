//! Irreversible identity transition.
//!
//! The sandboxed child switches its real, effective and saved uid and gid to
//! the target identity and reduces its supplementary groups to the target
//! gid. The primary gid always equals the uid.
//!
//! Order matters: groups and gids first, while `CAP_SETGID` is still held,
//! then uids. After the transition every id is re-read and compared, and for a
//! non-root target `setuid(0)` must fail.
//!
//! Capabilities are read with `capget(2)`: the child checks them after
//! `pivot_root`, where the new root need not have a `/proc`.

use jailrun_sys::last_errno;

use crate::error::PrivilegeError;

const CAP_SETGID: u32 = 6;
const CAP_SETUID: u32 = 7;

const LINUX_CAPABILITY_VERSION_3: u32 = 0x2008_0522;

#[repr(C)]
struct CapHeader {
    version: u32,
    pid: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct CapData {
    effective: u32,
    permitted: u32,
    inheritable: u32,
}

/// The calling thread's capability sets, as 64-bit masks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapSets {
    pub effective: u64,
    pub permitted: u64,
    pub inheritable: u64,
}

impl CapSets {
    pub fn current() -> Result<Self, PrivilegeError> {
        let mut header = CapHeader {
            version: LINUX_CAPABILITY_VERSION_3,
            pid: 0,
        };
        let mut data = [CapData::default(); 2];
        let ret = unsafe {
            libc::syscall(
                libc::SYS_capget,
                &mut header as *mut CapHeader,
                data.as_mut_ptr(),
            )
        };
        if ret != 0 {
            return Err(syscall("capget"));
        }
        let join = |lo: u32, hi: u32| u64::from(lo) | (u64::from(hi) << 32);
        Ok(Self {
            effective: join(data[0].effective, data[1].effective),
            permitted: join(data[0].permitted, data[1].permitted),
            inheritable: join(data[0].inheritable, data[1].inheritable),
        })
    }

    /// Install these sets on the calling thread only.
    pub fn apply(&self) -> Result<(), PrivilegeError> {
        let mut header = CapHeader {
            version: LINUX_CAPABILITY_VERSION_3,
            pid: 0,
        };
        let split = |mask: u64, half: u32| (mask >> (32 * half)) as u32;
        let data: [CapData; 2] = std::array::from_fn(|i| CapData {
            effective: split(self.effective, i as u32),
            permitted: split(self.permitted, i as u32),
            inheritable: split(self.inheritable, i as u32),
        });
        let ret = unsafe {
            libc::syscall(
                libc::SYS_capset,
                &mut header as *mut CapHeader,
                data.as_ptr(),
            )
        };
        if ret != 0 {
            return Err(syscall("capset"));
        }
        Ok(())
    }
}

/// Target identity of the sandboxed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub uid: u32,
    pub gid: u32,
}

impl Identity {
    pub fn from_uid(uid: u32) -> Self {
        Self { uid, gid: uid }
    }
}

/// Snapshot of the calling process's ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub uid: [u32; 3],
    pub gid: [u32; 3],
    pub groups: Vec<u32>,
}

impl Credentials {
    /// Read real/effective/saved ids and supplementary groups.
    pub fn current() -> Result<Self, PrivilegeError> {
        let (mut ruid, mut euid, mut suid) = (0, 0, 0);
        if unsafe { libc::getresuid(&mut ruid, &mut euid, &mut suid) } != 0 {
            return Err(syscall("getresuid"));
        }
        let (mut rgid, mut egid, mut sgid) = (0, 0, 0);
        if unsafe { libc::getresgid(&mut rgid, &mut egid, &mut sgid) } != 0 {
            return Err(syscall("getresgid"));
        }

        let count = unsafe { libc::getgroups(0, std::ptr::null_mut()) };
        if count < 0 {
            return Err(syscall("getgroups"));
        }
        let mut groups = vec![0 as libc::gid_t; count as usize];
        let filled = unsafe { libc::getgroups(count, groups.as_mut_ptr()) };
        if filled < 0 {
            return Err(syscall("getgroups"));
        }
        groups.truncate(filled as usize);

        Ok(Self {
            uid: [ruid, euid, suid],
            gid: [rgid, egid, sgid],
            groups,
        })
    }

    /// Check that every id equals the target.
    ///
    /// Supplementary groups must be empty or exactly the target gid.
    pub fn verify(&self, target: Identity) -> Result<(), PrivilegeError> {
        const UID_FIELDS: [&str; 3] = ["real uid", "effective uid", "saved uid"];
        const GID_FIELDS: [&str; 3] = ["real gid", "effective gid", "saved gid"];

        for (field, found) in UID_FIELDS.into_iter().zip(self.uid) {
            if found != target.uid {
                return Err(PrivilegeError::Mismatch {
                    field,
                    expected: target.uid,
                    found,
                });
            }
        }
        for (field, found) in GID_FIELDS.into_iter().zip(self.gid) {
            if found != target.gid {
                return Err(PrivilegeError::Mismatch {
                    field,
                    expected: target.gid,
                    found,
                });
            }
        }
        if let Some(&found) = self.groups.iter().find(|&&g| g != target.gid) {
            return Err(PrivilegeError::Mismatch {
                field: "supplementary group",
                expected: target.gid,
                found,
            });
        }
        Ok(())
    }
}

/// Fail early when the process cannot become `target`.
///
/// Nothing is required when the process already is the target identity.
pub fn ensure_can_assume(target: Identity) -> Result<(), PrivilegeError> {
    if Credentials::current()?.verify(target).is_ok() {
        return Ok(());
    }
    let caps = CapSets::current()?.effective;
    missing_capability(caps).map_or(Ok(()), |missing| {
        Err(PrivilegeError::InsufficientRights {
            target: target.uid,
            missing,
        })
    })
}

fn missing_capability(cap_eff: u64) -> Option<&'static str> {
    if cap_eff & (1 << CAP_SETUID) == 0 {
        Some("CAP_SETUID")
    } else if cap_eff & (1 << CAP_SETGID) == 0 {
        Some("CAP_SETGID")
    } else {
        None
    }
}

/// Become `target` for good.
pub fn drop_to(target: Identity) -> Result<(), PrivilegeError> {
    let before = Credentials::current()?;
    if before.verify(target).is_err() {
        ensure_can_assume(target)?;

        let groups = [target.gid as libc::gid_t];
        if unsafe { libc::setgroups(groups.len(), groups.as_ptr()) } != 0 {
            return Err(syscall("setgroups"));
        }
        if unsafe { libc::setresgid(target.gid, target.gid, target.gid) } != 0 {
            return Err(syscall("setresgid"));
        }
        if unsafe { libc::setresuid(target.uid, target.uid, target.uid) } != 0 {
            return Err(syscall("setresuid"));
        }
    }

    Credentials::current()?.verify(target)?;

    if target.uid != 0 && unsafe { libc::setuid(0) } == 0 {
        return Err(PrivilegeError::Reversible(target.uid));
    }
    Ok(())
}

fn syscall(call: &'static str) -> PrivilegeError {
    PrivilegeError::Syscall {
        call,
        errno: last_errno(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_mask(field: &str) -> u64 {
        let status = std::fs::read_to_string("/proc/self/status").unwrap();
        let hex = status
            .lines()
            .find_map(|line| line.strip_prefix(field))
            .unwrap();
        u64::from_str_radix(hex.trim(), 16).unwrap()
    }

    #[test]
    fn capget_agrees_with_procfs() {
        let caps = CapSets::current().unwrap();
        assert_eq!(caps.effective, status_mask("CapEff:"));
        assert_eq!(caps.permitted, status_mask("CapPrm:"));
        assert_eq!(caps.inheritable, status_mask("CapInh:"));
    }

    #[test]
    fn capset_round_trips_on_this_thread() {
        std::thread::spawn(|| {
            let caps = CapSets::current().unwrap();
            caps.apply().unwrap();
            let lowered = CapSets {
                effective: 0,
                ..caps
            };
            lowered.apply().unwrap();
            assert_eq!(CapSets::current().unwrap().effective, 0);
            caps.apply().unwrap();
            assert_eq!(CapSets::current().unwrap(), caps);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn missing_capabilities_named() {
        assert_eq!(missing_capability(0), Some("CAP_SETUID"));
        assert_eq!(missing_capability(1 << CAP_SETUID), Some("CAP_SETGID"));
        assert_eq!(missing_capability((1 << CAP_SETUID) | (1 << CAP_SETGID)), None);
    }

    #[test]
    fn verify_matching_identity() {
        let creds = Credentials {
            uid: [1000; 3],
            gid: [1000; 3],
            groups: vec![1000],
        };
        assert!(creds.verify(Identity::from_uid(1000)).is_ok());

        let no_groups = Credentials {
            groups: Vec::new(),
            ..creds
        };
        assert!(no_groups.verify(Identity::from_uid(1000)).is_ok());
    }

    #[test]
    fn verify_reports_saved_uid() {
        let creds = Credentials {
            uid: [1000, 1000, 0],
            gid: [1000; 3],
            groups: vec![],
        };
        match creds.verify(Identity::from_uid(1000)) {
            Err(PrivilegeError::Mismatch {
                field,
                expected,
                found,
            }) => {
                assert_eq!(field, "saved uid");
                assert_eq!(expected, 1000);
                assert_eq!(found, 0);
            }
            other => panic!("expected mismatch, got {other:?}"),
        }
    }

    #[test]
    fn verify_rejects_extra_group() {
        let creds = Credentials {
            uid: [1000; 3],
            gid: [1000; 3],
            groups: vec![1000, 27],
        };
        assert!(matches!(
            creds.verify(Identity::from_uid(1000)),
            Err(PrivilegeError::Mismatch { found: 27, .. })
        ));
    }

    #[test]
    fn current_identity_needs_nothing() {
        let creds = Credentials::current().unwrap();
        if creds.uid.iter().all(|&u| u == creds.uid[0])
            && creds.gid.iter().all(|&g| g == creds.uid[0])
            && creds.groups.iter().all(|&g| g == creds.uid[0])
        {
            assert!(ensure_can_assume(Identity::from_uid(creds.uid[0])).is_ok());
        }
    }
}
