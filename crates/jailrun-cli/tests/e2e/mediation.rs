//! Verdicts from the oracle applied to real syscalls.

use std::fs;

use jailrun::report::{EXIT_VIOLATION, exit_code};
use jailrun::{Arg, KillCause, Launcher, PolicyVerdict, Status};

use crate::common::{Fixture, NOBODY, privileged};

const WRITE_X: [&str; 3] = ["/bin/sh", "-c", "echo hi > /tmp/lim/x"];

#[test]
#[ignore]
fn pwd_runs_in_workdir() {
    if !privileged() {
        return;
    }
    let fixture = Fixture::new();
    let request = fixture.request(["/bin/pwd"], 0, &[]).build().unwrap();

    let result = Launcher::new().run(&request).unwrap();
    assert_eq!(result.status, Status::Completed);
    assert_eq!(result.exit_code, Some(0));
    assert!(result.total_events >= 1, "execve should be mediated");
    assert!(result.events.is_empty(), "nothing was denied");
}

#[test]
#[ignore]
fn allowed_write_reaches_host() {
    if !privileged() {
        return;
    }
    let fixture = Fixture::new();
    let request = fixture.request(WRITE_X, NOBODY, &[]).build().unwrap();

    let result = Launcher::new().run(&request).unwrap();
    assert!(result.success(), "{result:?}");
    assert_eq!(fs::read_to_string(fixture.scratch_file("x")).unwrap(), "hi\n");
}

#[test]
#[ignore]
fn denied_write_fails_inside_and_run_continues() {
    if !privileged() {
        return;
    }
    let fixture = Fixture::new();
    let request = fixture
        .request(WRITE_X, NOBODY, &["--deny", "/tmp/lim/x"])
        .build()
        .unwrap();

    let result = Launcher::new().run(&request).unwrap();
    assert_eq!(result.status, Status::Completed);
    assert_ne!(result.exit_code, Some(0), "the shell sees EPERM");
    assert!(!fixture.scratch_file("x").exists());

    let (event, verdict) = result.denials().next().expect("one denial");
    assert!(matches!(verdict, PolicyVerdict::Deny(_)));
    assert!(event.op.args.contains(&Arg::path("/tmp/lim/x")));
}

#[test]
#[ignore]
fn terminate_kills_tree_as_violation() {
    if !privileged() {
        return;
    }
    let fixture = Fixture::new();
    let request = fixture
        .request(WRITE_X, NOBODY, &["--terminate", "/tmp/lim/x"])
        .build()
        .unwrap();

    let outcome = Launcher::new().run(&request);
    assert_eq!(exit_code(&outcome), EXIT_VIOLATION);

    let result = outcome.unwrap();
    assert_eq!(result.status, Status::Violated);
    assert_eq!(result.signal, Some(libc::SIGKILL));
    assert!(matches!(result.violation, Some(KillCause::Terminated { .. })));
    assert!(!fixture.scratch_file("x").exists());
}

#[test]
#[ignore]
fn denied_initial_exec_is_completed_127() {
    if !privileged() {
        return;
    }
    let fixture = Fixture::new();
    let request = fixture
        .request(["/bin/pwd"], NOBODY, &["--deny", "/bin/pwd"])
        .build()
        .unwrap();

    let result = Launcher::new().run(&request).unwrap();
    assert_eq!(result.status, Status::Completed);
    assert_eq!(result.exit_code, Some(127));
    assert_eq!(result.denials().count(), 1);
}
