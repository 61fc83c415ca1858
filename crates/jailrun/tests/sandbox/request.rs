//! Request assembly as the CLI performs it.

use std::time::Duration;

use jailrun::{MountEntry, ValidationError, split_command};

use crate::common::request;

#[test]
fn command_string_and_entries() {
    let argv = split_command("/bin/sh -c  true");
    let root = tempfile::tempdir().unwrap();
    let request = jailrun::SandboxRequest::builder(argv, root.path(), 1000, "/usr/bin/tool")
        .entries(
            ["/srv/src:/tmp/lim", "/srv/data:/data:ro"]
                .iter()
                .map(|s| s.parse::<MountEntry>().unwrap()),
        )
        .timeout(Duration::from_secs(3))
        .build()
        .unwrap();

    assert_eq!(request.argv(), ["/bin/sh", "-c", "true"]);
    assert_eq!(request.entries().len(), 2);
    assert!(request.entries()[1].read_only);
    assert_eq!(request.timeout(), Some(Duration::from_secs(3)));
}

#[test]
fn traversal_in_guest_path_rejected() {
    let root = tempfile::tempdir().unwrap();
    let err = request(root.path(), "/bin/cat")
        .entry(MountEntry::new("/srv/src", "/tmp/../../etc"))
        .build()
        .unwrap_err();
    assert!(matches!(err, ValidationError::PathTraversal(_)));
}

#[test]
fn guest_root_rejected() {
    let root = tempfile::tempdir().unwrap();
    let err = request(root.path(), "/bin/cat")
        .entry(MountEntry::new("/srv/src", "/"))
        .build()
        .unwrap_err();
    assert_eq!(err, ValidationError::GuestIsRoot);
}
