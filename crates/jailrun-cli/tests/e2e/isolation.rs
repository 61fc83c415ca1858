//! Identity, procfs and mount-table isolation of the sandboxed command.

use std::path::Path;

use jailrun::isolation::CGROUP_ROOT;
use jailrun::{Launcher, Status};

use crate::common::{Fixture, NOBODY, cgroups_usable, host_mounts, privileged};

fn sh(script: &str) -> [&str; 3] {
    ["/bin/sh", "-c", script]
}

#[test]
#[ignore]
fn runs_as_target_identity_without_proc() {
    if !privileged() {
        return;
    }
    let fixture = Fixture::new();
    let request = fixture
        .request(
            sh("id -u > /tmp/lim/uid; id -g > /tmp/lim/gid; test -e /proc/self; echo $? > /tmp/lim/proc"),
            NOBODY,
            &[],
        )
        .build()
        .unwrap();

    let result = Launcher::new().run(&request).unwrap();
    assert!(result.success(), "{result:?}");
    assert_eq!(fixture.read_scratch("uid"), "65534\n");
    assert_eq!(fixture.read_scratch("gid"), "65534\n");
    assert_eq!(fixture.read_scratch("proc"), "1\n", "no procfs inside");
}

#[test]
#[ignore]
fn identity_visible_in_procfs() {
    if !privileged() {
        return;
    }
    let fixture = Fixture::with_proc();
    let request = fixture
        .request(
            sh("grep -E '^(Uid|Gid|Groups|CapEff|NoNewPrivs):' /proc/self/status > /tmp/lim/status"),
            NOBODY,
            &[],
        )
        .build()
        .unwrap();

    let result = Launcher::new().run(&request).unwrap();
    assert!(result.success(), "{result:?}");

    let status = fixture.read_scratch("status");
    let field = |name: &str| -> Vec<String> {
        status
            .lines()
            .find_map(|line| line.strip_prefix(name))
            .map(|rest| rest.split_whitespace().map(str::to_owned).collect())
            .unwrap_or_default()
    };
    assert_eq!(field("Uid:"), ["65534"; 4]);
    assert_eq!(field("Gid:"), ["65534"; 4]);
    assert_eq!(field("Groups:"), ["65534"]);
    assert_eq!(field("CapEff:"), ["0000000000000000"]);
    assert_eq!(field("NoNewPrivs:"), ["1"]);
}

#[test]
#[ignore]
fn procfs_is_the_sandbox_pid_namespace() {
    if !privileged() {
        return;
    }
    let fixture = Fixture::with_proc();
    let request = fixture
        .request(sh("ls /proc | grep -c '^[0-9]' > /tmp/lim/pids"), NOBODY, &[])
        .build()
        .unwrap();

    let result = Launcher::new().run(&request).unwrap();
    assert!(result.success(), "{result:?}");
    let pids: u32 = fixture.read_scratch("pids").trim().parse().unwrap();
    assert!(pids <= 4, "host processes visible: {pids}");
}

#[test]
#[ignore]
fn host_mount_table_unchanged() {
    if !privileged() {
        return;
    }
    for fixture in [Fixture::new(), Fixture::with_proc()] {
        let before = host_mounts();
        let request = fixture
            .request(sh("echo hi > /tmp/lim/x"), NOBODY, &[])
            .build()
            .unwrap();
        let result = Launcher::new().run(&request).unwrap();
        assert!(result.success(), "{result:?}");
        assert_eq!(host_mounts(), before);
        assert!(fixture.root_leftovers().is_empty());
    }
}

#[test]
#[ignore]
fn session_cgroup_created_and_removed() {
    if !privileged() || !cgroups_usable() {
        return;
    }
    let fixture = Fixture::with_proc();
    let request = fixture
        .request(sh("cat /proc/self/cgroup > /tmp/lim/cgroup"), NOBODY, &[])
        .build()
        .unwrap();

    let result = Launcher::new().run(&request).unwrap();
    assert_eq!(result.status, Status::Completed);

    let membership = fixture.read_scratch("cgroup");
    let path = membership
        .lines()
        .find_map(|line| line.strip_prefix("0::"))
        .expect("unified hierarchy entry");
    assert!(path.starts_with("/jailrun/"), "{path}");
    assert!(!Path::new(CGROUP_ROOT).join(&path[1..]).exists());
}
