//! Setup failures and the cleanup that follows them.

use std::fs;
use std::os::unix::fs::symlink;

use jailrun::report::{EXIT_CHANNEL_LOST, EXIT_SETUP, exit_code};
use jailrun::{ChannelError, Launcher, MountEntry, MountError, SandboxError, SetupError};

use crate::common::{request, supported};

#[test]
fn missing_mount_root_is_setup_error() {
    let scratch = tempfile::tempdir().unwrap();
    let root = scratch.path().join("absent");
    let request = request(&root, "/bin/cat").build().unwrap();

    let outcome = Launcher::new().run(&request);
    assert_eq!(exit_code(&outcome), EXIT_SETUP);
    if supported() {
        assert!(matches!(
            outcome,
            Err(SandboxError::Setup(SetupError::Mount(MountError::RootMissing(_))))
        ));
    }
}

#[test]
fn symlink_escape_is_rejected_before_anything_runs() {
    let root = tempfile::tempdir().unwrap();
    let host = tempfile::tempdir().unwrap();
    let outside = tempfile::tempdir().unwrap();
    symlink(outside.path(), root.path().join("evil")).unwrap();

    let request = request(root.path(), "/bin/cat")
        .entry(MountEntry::new(host.path(), "/evil/inner"))
        .build()
        .unwrap();

    let outcome = Launcher::new().run(&request);
    assert_eq!(exit_code(&outcome), EXIT_SETUP);
    if supported() {
        assert!(matches!(
            outcome,
            Err(SandboxError::Setup(SetupError::Mount(MountError::GuestEscape(_))))
        ));
    }
    assert!(!outside.path().join("inner").exists());
}

#[test]
fn failed_entry_leaves_no_mount_points() {
    let root = tempfile::tempdir().unwrap();
    let host = tempfile::tempdir().unwrap();

    let request = request(root.path(), "/bin/cat")
        .entry(MountEntry::new(host.path(), "/data/one"))
        .entry(MountEntry::new(root.path().join("no-such-host"), "/data/two"))
        .build()
        .unwrap();

    let outcome = Launcher::new().run(&request);
    assert_eq!(exit_code(&outcome), EXIT_SETUP);
    assert_eq!(fs::read_dir(root.path()).unwrap().count(), 0);
}

#[test]
fn missing_tool_is_channel_error_and_cleans_up() {
    if !supported() {
        eprintln!("Skipping: host cannot run sandboxes");
        return;
    }
    let root = tempfile::tempdir().unwrap();
    let host = tempfile::tempdir().unwrap();

    let request = request(root.path(), "/nonexistent/jailrun-tool")
        .entry(MountEntry::new(host.path(), "/tmp/lim"))
        .build()
        .unwrap();

    let outcome = Launcher::new().run(&request);
    assert!(matches!(
        outcome,
        Err(SandboxError::Channel(ChannelError::Spawn { .. }))
    ));
    assert_eq!(exit_code(&outcome), EXIT_CHANNEL_LOST);
    assert!(
        !root.path().join("tmp").exists(),
        "created mount points must be removed"
    );
}
