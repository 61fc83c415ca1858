//! The `jailrun` binary's argument handling and exit codes.

use std::process::Command;

use jailrun::report::{EXIT_SETUP, EXIT_USAGE};

use crate::common::{Fixture, NOBODY, jailrun_bin, privileged};

#[test]
fn missing_arguments_is_usage_error() {
    let status = Command::new(jailrun_bin()).status().unwrap();
    assert_eq!(status.code(), Some(EXIT_USAGE));
}

#[test]
fn malformed_add_is_usage_error() {
    let status = Command::new(jailrun_bin())
        .args(["-c", "/bin/true", "-m", "/", "-u", "0", "-t", "/bin/cat"])
        .args(["-a", "/only-host"])
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(EXIT_USAGE));
}

#[test]
fn missing_root_is_setup_error() {
    let scratch = tempfile::tempdir().unwrap();
    let uid = unsafe { libc::getuid() }.to_string();
    let root = scratch.path().join("absent");
    let output = Command::new(jailrun_bin())
        .args(["-c", "/bin/true", "-u", uid.as_str(), "-t", "/bin/cat", "-m"])
        .arg(&root)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(EXIT_SETUP));
    assert!(String::from_utf8_lossy(&output.stderr).contains("jailrun:"));
}

#[test]
#[ignore]
fn command_exit_code_is_passed_through() {
    if !privileged() {
        return;
    }
    let fixture = Fixture::new();
    let status = fixture.command("/bin/false", NOBODY).status().unwrap();
    assert_eq!(status.code(), Some(1));
    assert!(fixture.root_leftovers().is_empty());
}
