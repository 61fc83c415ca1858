//! Mapping of session outcomes to process exit codes.
//!
//! | Code | Meaning |
//! |------|---------|
//! | command's own | [`Status::Completed`] |
//! | 2 | usage error |
//! | 111 | setup failure |
//! | 112 | privilege transition failure |
//! | 113 | policy violation (`Terminate` verdict or abort signal) |
//! | 114 | enforcement channel lost |
//! | 115 | crash (unhandled signal) |
//! | 116 | timeout |
//! | 117 | internal runner error |
//!
//! These codes are stable.

use std::io::Write;

use crate::error::SandboxError;
use crate::monitor::{SandboxResult, Status};
use crate::notify::KillCause;

pub const EXIT_USAGE: i32 = 2;
pub const EXIT_SETUP: i32 = 111;
pub const EXIT_PRIVILEGE: i32 = 112;
pub const EXIT_VIOLATION: i32 = 113;
pub const EXIT_CHANNEL_LOST: i32 = 114;
pub const EXIT_CRASH: i32 = 115;
pub const EXIT_TIMEOUT: i32 = 116;
pub const EXIT_INTERNAL: i32 = 117;

/// Exit code for a session outcome.
pub fn exit_code(outcome: &Result<SandboxResult, SandboxError>) -> i32 {
    match outcome {
        Ok(result) => result_code(result),
        Err(SandboxError::Setup(_)) => EXIT_SETUP,
        Err(SandboxError::Privilege(_)) => EXIT_PRIVILEGE,
        Err(SandboxError::Channel(_)) => EXIT_CHANNEL_LOST,
        Err(SandboxError::Internal { .. }) => EXIT_INTERNAL,
    }
}

fn result_code(result: &SandboxResult) -> i32 {
    match result.status {
        // A Completed run always has a code; fall back to internal otherwise.
        Status::Completed => result.exit_code.unwrap_or(EXIT_INTERNAL),
        Status::Violated => match result.violation {
            Some(KillCause::ChannelLost(_)) => EXIT_CHANNEL_LOST,
            _ => EXIT_VIOLATION,
        },
        Status::Crashed => EXIT_CRASH,
        Status::TimedOut => EXIT_TIMEOUT,
    }
}

/// Print the cause of a non-`Completed` outcome to `err` and return the exit
/// code. Write failures are ignored.
pub fn report(outcome: &Result<SandboxResult, SandboxError>, err: &mut impl Write) -> i32 {
    let code = exit_code(outcome);
    match outcome {
        Ok(result) => match result.status {
            Status::Completed => {}
            Status::Violated => {
                let cause = result
                    .violation
                    .as_ref()
                    .map_or_else(|| "unknown cause".to_owned(), ToString::to_string);
                let _ = writeln!(err, "jailrun: policy violation: {cause}");
            }
            Status::Crashed => {
                let signal = result.signal.unwrap_or_default();
                let _ = writeln!(err, "jailrun: command crashed: killed by signal {signal}");
            }
            Status::TimedOut => {
                let _ = writeln!(
                    err,
                    "jailrun: command timed out after {:.3}s",
                    result.duration.as_secs_f64()
                );
            }
        },
        Err(e) => {
            let _ = writeln!(err, "jailrun: {e}");
        }
    }
    code
}
