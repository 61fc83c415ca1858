//! Seccomp user-notification enforcement.
//!
//! - **event** - decoding halted syscalls into [`PolicyEvent`]s
//! - **emulate** - performing allowed syscalls for the halted thread
//! - **channel** - enforcement tool process and its framed msgpack protocol
//! - **correlate** - `(tid, seq)` correlation of events and verdicts
//! - **supervisor** - the bridge: dispatcher, per-thread workers, kill switch
//! - **`scm_rights`** - child → parent control socket (reports, listener fd)

pub mod channel;
pub mod correlate;
pub mod emulate;
pub mod event;
pub mod scm_rights;
pub mod supervisor;

pub use channel::{PolicyVerdict, ToolChannel, ToolMessage, VerdictMessage};
pub use correlate::PendingVerdicts;
pub use event::{Arg, Operation, PolicyEvent};
pub use supervisor::{Bridge, BridgeReport, KillCause, KillSwitch};
