//! Timeouts, abort signals and cleanup of the host tree.

use std::thread;
use std::time::Duration;

use jailrun::report::{EXIT_TIMEOUT, EXIT_VIOLATION, exit_code};
use jailrun::{KillCause, Launcher, Status};

use crate::common::{Fixture, NOBODY, privileged};

#[test]
#[ignore]
fn timeout_kills_and_reports() {
    if !privileged() {
        return;
    }
    let fixture = Fixture::new();
    let request = fixture
        .request(["/bin/sleep", "30"], NOBODY, &[])
        .timeout(Duration::from_millis(500))
        .build()
        .unwrap();

    let outcome = Launcher::new().run(&request);
    assert_eq!(exit_code(&outcome), EXIT_TIMEOUT);
    let result = outcome.unwrap();
    assert_eq!(result.status, Status::TimedOut);
    assert_eq!(result.violation, Some(KillCause::TimedOut));
    assert!(result.duration < Duration::from_secs(10));
}

#[test]
#[ignore]
fn mount_points_removed_after_run() {
    if !privileged() {
        return;
    }
    let fixture = Fixture::new();
    let request = fixture.request(["/bin/true"], NOBODY, &[]).build().unwrap();

    let result = Launcher::new().run(&request).unwrap();
    assert!(result.success());
    assert!(
        fixture.root_leftovers().is_empty(),
        "left behind: {:?}",
        fixture.root_leftovers()
    );
}

#[test]
#[ignore]
fn sigterm_to_runner_is_violation() {
    if !privileged() {
        return;
    }
    let fixture = Fixture::new();
    let mut child = fixture.command("/bin/sleep 30", NOBODY).spawn().unwrap();
    thread::sleep(Duration::from_secs(1));
    assert_eq!(unsafe { libc::kill(child.id() as i32, libc::SIGTERM) }, 0);

    let status = child.wait().unwrap();
    assert_eq!(status.code(), Some(EXIT_VIOLATION));
    assert!(fixture.root_leftovers().is_empty());
}
