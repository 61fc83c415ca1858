//! Enforcement bridge: halts monitored syscalls and applies tool verdicts.
//!
//! ## Threads
//!
//! ```text
//!                      ┌──────────────┐  Job   ┌─────────────────┐
//!  listener fd ──────▶ │  dispatcher  │ ─────▶ │ worker (tid 41) │──┐
//!   (mio)              │ seq per tid  │ ─────▶ │ worker (tid 42) │──┤ Event
//!                      └──────────────┘        └─────────────────┘  ▼
//!                                                   ▲ wait     enforcement tool
//!                      ┌──────────────┐  deliver ┌──┴──────────────┐   │
//!                      │    reader    │ ───────▶ │ PendingVerdicts │   │
//!                      └──────────────┘          └─────────────────┘   │
//!                            ▲                     Verdict             │
//!                            └─────────────────────────────────────────┘
//! ```
//!
//! One worker per monitored thread keeps each thread's verdicts in halt
//! order while threads proceed independently. The listener is edge-triggered
//! under mio, so the dispatcher drains it with a zero-timeout `poll` after
//! every receive.
//!
//! ## Verdicts
//!
//! | Verdict | Response |
//! |---------|----------|
//! | `Allow` | the worker performs the syscall from the copies the tool saw |
//! | `Deny` | fail with `EPERM` |
//! | `Terminate` | SIGKILL the tree via pidfd, then fail with `EPERM` |
//!
//! An allowed syscall is never continued if its outcome depends on memory
//! the thread could still change. Opens come back as descriptors injected
//! with `SECCOMP_IOCTL_NOTIF_ADDFD`, other path and address syscalls as
//! return values, and only register-only syscalls and checked execs are
//! continued (see [`super::emulate`]). Sends on connected stream sockets
//! have no destination to judge and are performed without an event.
//!
//! If the channel is lost, every halted and future event is `Terminate`.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use jailrun_sys::seccomp_notify::{
    SeccompNotif, SeccompNotifAddfd, SeccompNotifResp, notif_addfd, notif_id_valid, notif_recv,
    notif_send,
};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use rustix::io::Errno;
use rustix::process::{Signal, pidfd_send_signal};

use super::channel::{EventSender, PolicyVerdict, ToolMessage, VerdictReader};
use super::correlate::{Delivery, PendingVerdicts};
use super::emulate::{FsScope, Outcome, ProcThread, destination_ignored};
use super::event::{Capture, Effect, HaltedThread, PolicyEvent, Vanished, capture};
use crate::error::ChannelError;

const LISTENER: Token = Token(0);
const WAKE: Token = Token(1);

/// Prune exited workers every this many notifications.
const PRUNE_INTERVAL: u64 = 64;

/// Reason given to waiters when the tool disappears.
pub const CHANNEL_LOST: &str = "enforcement channel lost";

/// Why the sandboxed tree was killed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KillCause {
    /// The tool returned `Terminate` for `event`.
    Terminated { event: PolicyEvent, reason: String },
    /// The enforcement channel closed or failed.
    ChannelLost(String),
    /// The runner received `signal`.
    Aborted { signal: i32 },
    /// The wall-clock budget ran out.
    TimedOut,
}

impl std::fmt::Display for KillCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KillCause::Terminated { event, reason } => {
                write!(f, "terminated on {} (tid {}): {reason}", event.op, event.tid)
            }
            KillCause::ChannelLost(reason) => write!(f, "{CHANNEL_LOST}: {reason}"),
            KillCause::Aborted { signal } => write!(f, "aborted by signal {signal}"),
            KillCause::TimedOut => f.write_str("wall-clock timeout"),
        }
    }
}

/// Kills the sandboxed tree once and remembers why.
#[derive(Debug)]
pub struct KillSwitch {
    pidfd: Option<OwnedFd>,
    cause: Mutex<Option<KillCause>>,
}

impl KillSwitch {
    pub fn new(pidfd: OwnedFd) -> Self {
        Self {
            pidfd: Some(pidfd),
            cause: Mutex::new(None),
        }
    }

    /// A switch that only records causes.
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self {
            pidfd: None,
            cause: Mutex::new(None),
        }
    }

    pub fn pidfd(&self) -> Option<BorrowedFd<'_>> {
        self.pidfd.as_ref().map(AsFd::as_fd)
    }

    /// Record `cause` and SIGKILL the tree. The first cause wins; returns
    /// whether this call was the first.
    pub fn fire(&self, cause: KillCause) -> bool {
        let mut slot = self.cause.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return false;
        }
        tracing::warn!(%cause, "killing sandboxed process tree");
        *slot = Some(cause);
        drop(slot);
        if let Some(pidfd) = &self.pidfd {
            if let Err(errno) = pidfd_send_signal(pidfd, Signal::KILL) {
                tracing::debug!(%errno, "pidfd_send_signal");
            }
        }
        true
    }

    pub fn cause(&self) -> Option<KillCause> {
        self.cause.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Where forwarded events go.
pub trait EventSink: Send + Sync {
    fn send(&self, msg: &ToolMessage) -> Result<(), ChannelError>;
}

impl EventSink for EventSender {
    fn send(&self, msg: &ToolMessage) -> Result<(), ChannelError> {
        EventSender::send(self, msg)
    }
}

/// Responses to halted syscalls.
pub trait Responder: Send + Sync {
    /// Whether notification `id` still refers to a halted syscall.
    fn id_valid(&self, id: u64) -> bool;
    fn respond(&self, resp: &SeccompNotifResp) -> Result<(), Errno>;
    /// Install `fd` in the halted thread and complete its syscall with the
    /// new descriptor number.
    fn inject(&self, id: u64, fd: BorrowedFd<'_>, cloexec: bool) -> Result<i32, Errno>;
}

/// The seccomp listener fd received from the child.
#[derive(Debug)]
pub struct NotifyListener {
    fd: OwnedFd,
}

impl NotifyListener {
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }

    fn recv(&self) -> Result<SeccompNotif, Errno> {
        notif_recv(self.fd.as_fd())
    }
}

impl Responder for NotifyListener {
    fn id_valid(&self, id: u64) -> bool {
        notif_id_valid(self.fd.as_fd(), id).is_ok()
    }

    fn respond(&self, resp: &SeccompNotifResp) -> Result<(), Errno> {
        notif_send(self.fd.as_fd(), resp)
    }

    fn inject(&self, id: u64, fd: BorrowedFd<'_>, cloexec: bool) -> Result<i32, Errno> {
        let addfd = SeccompNotifAddfd::send(id, fd.as_raw_fd() as u32, cloexec);
        notif_addfd(self.fd.as_fd(), &addfd)
    }
}

/// State shared by the dispatcher, the workers and the reader.
pub(crate) struct Shared {
    responder: Arc<dyn Responder>,
    sink: Arc<dyn EventSink>,
    pending: PendingVerdicts,
    kill: Arc<KillSwitch>,
    ledger: Mutex<Vec<(PolicyEvent, PolicyVerdict)>>,
    total: AtomicU64,
    stopping: AtomicBool,
}

impl Shared {
    pub(crate) fn new(
        responder: Arc<dyn Responder>,
        sink: Arc<dyn EventSink>,
        kill: Arc<KillSwitch>,
    ) -> Self {
        Self {
            responder,
            sink,
            pending: PendingVerdicts::new(),
            kill,
            ledger: Mutex::new(Vec::new()),
            total: AtomicU64::new(0),
            stopping: AtomicBool::new(false),
        }
    }

    fn channel_lost(&self, reason: String) {
        if self.stopping.load(Ordering::SeqCst) {
            return;
        }
        self.pending.close(CHANNEL_LOST);
        self.kill.fire(KillCause::ChannelLost(reason));
    }

    /// One halt/notify/resume cycle. `perform` runs only for `Allow`.
    pub(crate) fn process(&self, id: u64, event: PolicyEvent, perform: impl FnOnce() -> Outcome) {
        if !self.responder.id_valid(id) {
            tracing::debug!(tid = event.tid, seq = event.seq, "notification went stale");
            return;
        }

        let key = (event.tid, event.seq);
        self.pending.register(key);
        self.total.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(tid = event.tid, seq = event.seq, syscall = %event.op.syscall, "forwarding event");

        if let Err(e) = self.sink.send(&ToolMessage::Event(event.clone())) {
            tracing::warn!(error = %e, "cannot forward event");
            self.channel_lost(e.to_string());
        }
        let verdict = self.pending.wait(key);

        let verdict = match verdict {
            PolicyVerdict::Allow => match self.answer(id, event.tid, perform()) {
                None => PolicyVerdict::Allow,
                Some(reason) => {
                    tracing::warn!(tid = event.tid, seq = event.seq, op = %event.op, %reason, "allowed syscall refused");
                    PolicyVerdict::Deny(reason)
                }
            },
            PolicyVerdict::Deny(reason) => {
                tracing::info!(tid = event.tid, seq = event.seq, op = %event.op, %reason, "denied");
                self.respond(event.tid, &SeccompNotifResp::fail(id, libc::EPERM));
                PolicyVerdict::Deny(reason)
            }
            PolicyVerdict::Terminate(reason) => {
                if !self.stopping.load(Ordering::SeqCst) {
                    self.kill.fire(KillCause::Terminated {
                        event: event.clone(),
                        reason: reason.clone(),
                    });
                }
                self.respond(event.tid, &SeccompNotifResp::fail(id, libc::EPERM));
                PolicyVerdict::Terminate(reason)
            }
        };

        if !verdict.is_allow() {
            self.ledger
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push((event, verdict));
        }
    }

    /// Perform a syscall that needs no verdict.
    pub(crate) fn settle(&self, id: u64, tid: u32, perform: impl FnOnce() -> Outcome) {
        if !self.responder.id_valid(id) {
            return;
        }
        if let Some(reason) = self.answer(id, tid, perform()) {
            tracing::warn!(tid, %reason, "syscall refused");
        }
    }

    /// Complete notification `id` with `outcome`. Returns the reason if the
    /// syscall was refused instead.
    fn answer(&self, id: u64, tid: u32, outcome: Outcome) -> Option<String> {
        let (resp, refused) = match outcome {
            Outcome::Continue => (SeccompNotifResp::continue_syscall(id), None),
            Outcome::Value(val) => (SeccompNotifResp::succeed(id, val), None),
            Outcome::Errno(errno) => (SeccompNotifResp::fail(id, errno), None),
            Outcome::Refused(reason) => (SeccompNotifResp::fail(id, libc::EPERM), Some(reason)),
            Outcome::Fd { fd, cloexec } => match self.responder.inject(id, fd.as_fd(), cloexec) {
                Ok(installed) => {
                    tracing::trace!(tid, fd = installed, "descriptor injected");
                    return None;
                }
                Err(Errno::NOENT) => {
                    tracing::debug!(tid, "thread gone before injection");
                    return None;
                }
                Err(errno) => (SeccompNotifResp::fail(id, errno.raw_os_error()), None),
            },
        };
        self.respond(tid, &resp);
        refused
    }

    fn respond(&self, tid: u32, resp: &SeccompNotifResp) {
        match self.responder.respond(resp) {
            Ok(()) => {}
            Err(Errno::NOENT) => tracing::debug!(tid, "thread gone before response"),
            Err(errno) => tracing::warn!(tid, %errno, "seccomp response failed"),
        }
    }

    fn ledger(&self) -> Vec<(PolicyEvent, PolicyVerdict)> {
        self.ledger.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

struct Job {
    id: u64,
    seq: u64,
    nr: i64,
    args: [u64; 6],
}

struct Worker {
    tx: Sender<Job>,
    handle: JoinHandle<()>,
}

fn worker_loop(shared: Arc<Shared>, tid: u32, rx: Receiver<Job>) {
    let scope = FsScope::unshare()
        .inspect_err(|e| tracing::error!(tid, error = %e, "cannot detach worker filesystem context"))
        .ok();
    for job in rx {
        handle(&shared, scope.as_ref(), tid, job);
    }
}

fn handle(shared: &Shared, scope: Option<&FsScope>, tid: u32, job: Job) {
    // opened before the id is checked, so the tid cannot have been reused
    let thread = scope.and_then(|scope| {
        scope
            .attach(tid)
            .inspect_err(|e| tracing::debug!(tid, error = %e, "cannot attach to thread"))
            .ok()
    });
    let halted: &dyn HaltedThread = match &thread {
        Some(thread) => thread,
        None => &Vanished,
    };
    let (op, captured) = capture(job.nr, job.args, halted);

    let (Some(scope), Some(thread)) = (scope, &thread) else {
        let event = PolicyEvent { tid, seq: job.seq, op };
        shared.process(job.id, event, || match captured.effect {
            Effect::Continue if captured.fault.is_none() => Outcome::Continue,
            _ => Outcome::Refused("thread state unavailable".into()),
        });
        return;
    };

    if destination_ignored(&captured, thread) {
        shared.settle(job.id, tid, || perform(scope, thread, &captured));
        return;
    }
    let event = PolicyEvent { tid, seq: job.seq, op };
    shared.process(job.id, event, || perform(scope, thread, &captured));
}

/// Perform `captured` inside the thread's root.
fn perform(scope: &FsScope, thread: &ProcThread, captured: &Capture) -> Outcome {
    if captured.fault.is_some() || matches!(captured.effect, Effect::Continue | Effect::Exec) {
        return thread.perform(captured);
    }
    match scope.enter(thread) {
        Ok(_inside) => thread.perform(captured),
        Err(e) => Outcome::Refused(format!("cannot enter the thread's root: {e}")),
    }
}

/// Routes notifications to per-thread workers.
struct Dispatcher {
    shared: Arc<Shared>,
    listener: Arc<NotifyListener>,
    seqs: HashMap<u32, u64>,
    workers: HashMap<u32, Worker>,
    retired: Vec<JoinHandle<()>>,
    received: u64,
}

impl Dispatcher {
    fn run(mut self, mut poll: Poll) {
        let mut events = Events::with_capacity(8);
        'outer: loop {
            if let Err(e) = poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                tracing::error!(error = %e, "bridge poll failed");
                self.shared.channel_lost(format!("bridge poll: {e}"));
                break;
            }
            for event in &events {
                match event.token() {
                    WAKE => break 'outer,
                    LISTENER => {
                        if !self.drain() {
                            tracing::debug!("listener hung up");
                            break 'outer;
                        }
                    }
                    _ => {}
                }
            }
        }
        self.finish();
    }

    /// Receive every queued notification. Returns `false` once the listener
    /// hung up (no process uses the filter any more).
    fn drain(&mut self) -> bool {
        loop {
            match readiness(self.listener.fd.as_fd()) {
                Readiness::Readable => {}
                Readiness::Idle => return true,
                Readiness::HungUp => return false,
            }
            match self.listener.recv() {
                Ok(notif) => self.route(notif),
                Err(Errno::NOENT) | Err(Errno::INTR) => {}
                Err(errno) => {
                    tracing::error!(%errno, "seccomp receive failed");
                    return false;
                }
            }
        }
    }

    fn route(&mut self, notif: SeccompNotif) {
        let tid = notif.pid;
        let counter = self.seqs.entry(tid).or_insert(0);
        let seq = *counter;
        *counter += 1;

        let job = Job {
            id: notif.id,
            seq,
            nr: i64::from(notif.data.nr),
            args: notif.data.args,
        };

        let job = match self.workers.get(&tid) {
            Some(worker) => match worker.tx.send(job) {
                Ok(()) => None,
                Err(mpsc::SendError(job)) => Some(job),
            },
            None => Some(job),
        };
        if let Some(job) = job {
            self.spawn_worker(tid, job);
        }

        self.received += 1;
        if self.received % PRUNE_INTERVAL == 0 {
            self.prune();
        }
    }

    fn spawn_worker(&mut self, tid: u32, first: Job) {
        let (tx, rx) = mpsc::channel();
        let _ = tx.send(first);
        let shared = Arc::clone(&self.shared);
        match thread::Builder::new()
            .name(format!("jailrun-tid-{tid}"))
            .spawn(move || worker_loop(shared, tid, rx))
        {
            Ok(handle) => {
                if let Some(old) = self.workers.insert(tid, Worker { tx, handle }) {
                    self.retired.push(old.handle);
                }
            }
            Err(e) => {
                tracing::error!(tid, error = %e, "cannot spawn bridge worker");
                self.shared.channel_lost(format!("worker spawn: {e}"));
            }
        }
    }

    /// Drop workers whose thread has exited. Sequence counters are kept so a
    /// recycled tid never restarts at 0.
    fn prune(&mut self) {
        let gone: Vec<u32> = self
            .workers
            .keys()
            .copied()
            .filter(|tid| !Path::new(&format!("/proc/{tid}")).exists())
            .collect();
        for tid in gone {
            if let Some(worker) = self.workers.remove(&tid) {
                drop(worker.tx);
                self.retired.push(worker.handle);
            }
        }
        self.retired.retain(|h| !h.is_finished());
    }

    fn finish(self) {
        let Dispatcher {
            workers, retired, ..
        } = self;
        let mut handles = retired;
        for (_, worker) in workers {
            drop(worker.tx);
            handles.push(worker.handle);
        }
        for handle in handles {
            let _ = handle.join();
        }
    }
}

enum Readiness {
    Readable,
    Idle,
    HungUp,
}

fn readiness(fd: BorrowedFd<'_>) -> Readiness {
    let mut pfd = libc::pollfd {
        fd: fd.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    let ret = unsafe { libc::poll(&mut pfd, 1, 0) };
    if ret <= 0 {
        Readiness::Idle
    } else if pfd.revents & libc::POLLIN != 0 {
        Readiness::Readable
    } else if pfd.revents & (libc::POLLHUP | libc::POLLERR) != 0 {
        Readiness::HungUp
    } else {
        Readiness::Idle
    }
}

fn reader_loop(shared: Arc<Shared>, mut reader: VerdictReader) {
    loop {
        match reader.recv() {
            Ok(Some(msg)) => match shared.pending.deliver((msg.tid, msg.seq), msg.verdict) {
                Delivery::Delivered => {}
                Delivery::Unknown => {
                    tracing::warn!(tid = msg.tid, seq = msg.seq, "verdict for unknown event")
                }
                Delivery::Duplicate => {
                    tracing::warn!(tid = msg.tid, seq = msg.seq, "duplicate verdict ignored")
                }
            },
            Ok(None) => {
                shared.channel_lost("tool closed its output".to_string());
                return;
            }
            Err(e) => {
                shared.channel_lost(e.to_string());
                return;
            }
        }
    }
}

/// Summary of everything the bridge mediated.
#[derive(Debug, Clone, Default)]
pub struct BridgeReport {
    /// Non-`Allow` decisions in the order they were applied.
    pub ledger: Vec<(PolicyEvent, PolicyVerdict)>,
    pub total_events: u64,
}

/// Running enforcement bridge.
pub struct Bridge {
    shared: Arc<Shared>,
    waker: Waker,
    dispatcher: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

impl Bridge {
    /// Start the dispatcher and reader threads.
    pub fn start(
        listener: OwnedFd,
        sink: Arc<EventSender>,
        reader: VerdictReader,
        kill: Arc<KillSwitch>,
    ) -> io::Result<Self> {
        let listener = Arc::new(NotifyListener::new(listener));
        let shared = Arc::new(Shared::new(
            Arc::clone(&listener) as Arc<dyn Responder>,
            sink,
            kill,
        ));

        let poll = Poll::new()?;
        let raw = listener.fd.as_raw_fd();
        poll.registry()
            .register(&mut SourceFd(&raw), LISTENER, Interest::READABLE)?;
        let waker = Waker::new(poll.registry(), WAKE)?;

        let dispatcher = Dispatcher {
            shared: Arc::clone(&shared),
            listener,
            seqs: HashMap::new(),
            workers: HashMap::new(),
            retired: Vec::new(),
            received: 0,
        };
        let dispatcher = thread::Builder::new()
            .name("jailrun-dispatch".into())
            .spawn(move || dispatcher.run(poll))?;

        let reader = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("jailrun-verdicts".into())
                .spawn(move || reader_loop(shared, reader))?
        };

        Ok(Self {
            shared,
            waker,
            dispatcher: Some(dispatcher),
            reader: Some(reader),
        })
    }

    /// Fail every outstanding event and tell the dispatcher to finish,
    /// without waiting for it.
    pub fn begin_stop(&self) {
        self.shared.stopping.store(true, Ordering::SeqCst);
        self.shared.pending.close("session ended");
        if self.dispatcher.is_some() {
            if let Err(e) = self.waker.wake() {
                tracing::warn!(error = %e, "cannot wake bridge dispatcher");
            }
        }
    }

    /// [`Bridge::begin_stop`], then join the dispatcher and workers.
    ///
    /// A worker may be blocked sending to the tool, so shut the tool down
    /// between the two. The reader keeps running until the tool's output
    /// closes; join it with [`Bridge::join_reader`].
    pub fn stop(&mut self) {
        self.begin_stop();
        if let Some(handle) = self.dispatcher.take() {
            let _ = handle.join();
        }
    }

    pub fn join_reader(&mut self) {
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
    }

    pub fn report(&self) -> BridgeReport {
        BridgeReport {
            ledger: self.shared.ledger(),
            total_events: self.shared.total.load(Ordering::Relaxed),
        }
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::mpsc::SyncSender;
    use std::time::Duration;

    use super::*;
    use crate::notify::event::{Arg, Operation};

    /// Records responses; every id stays valid unless listed as stale.
    #[derive(Default)]
    struct FakeResponder {
        stale: Vec<u64>,
        responses: Mutex<Vec<SeccompNotifResp>>,
        injected: Mutex<Vec<(u64, bool)>>,
    }

    impl Responder for FakeResponder {
        fn id_valid(&self, id: u64) -> bool {
            !self.stale.contains(&id)
        }

        fn respond(&self, resp: &SeccompNotifResp) -> Result<(), Errno> {
            self.responses.lock().unwrap().push(*resp);
            Ok(())
        }

        fn inject(&self, id: u64, _fd: BorrowedFd<'_>, cloexec: bool) -> Result<i32, Errno> {
            self.injected.lock().unwrap().push((id, cloexec));
            Ok(7)
        }
    }

    /// Hands every event to an oracle thread.
    struct ChannelSink(Mutex<Option<SyncSender<PolicyEvent>>>);

    impl EventSink for ChannelSink {
        fn send(&self, msg: &ToolMessage) -> Result<(), ChannelError> {
            let guard = self.0.lock().unwrap();
            let tx = guard.as_ref().ok_or(ChannelError::Closed)?;
            if let ToolMessage::Event(event) = msg {
                tx.send(event.clone()).map_err(|_| ChannelError::Closed)?;
            }
            Ok(())
        }
    }

    fn open_event(tid: u32, seq: u64, path: &str) -> PolicyEvent {
        PolicyEvent {
            tid,
            seq,
            op: Operation {
                syscall: "openat".into(),
                args: vec![Arg::DirFd(libc::AT_FDCWD), Arg::path(path)],
            },
        }
    }

    fn setup(
        stale: Vec<u64>,
    ) -> (
        Arc<Shared>,
        Arc<FakeResponder>,
        std::sync::mpsc::Receiver<PolicyEvent>,
    ) {
        let responder = Arc::new(FakeResponder {
            stale,
            ..Default::default()
        });
        let (tx, rx) = mpsc::sync_channel(64);
        let sink = Arc::new(ChannelSink(Mutex::new(Some(tx))));
        let shared = Arc::new(Shared::new(
            Arc::clone(&responder) as Arc<dyn Responder>,
            sink,
            Arc::new(KillSwitch::detached()),
        ));
        (shared, responder, rx)
    }

    /// xorshift, enough to shuffle replies.
    fn next_random(state: &mut u64) -> u64 {
        *state ^= *state << 13;
        *state ^= *state >> 7;
        *state ^= *state << 17;
        *state
    }

    #[test]
    fn verdicts_map_to_responses() {
        let (shared, responder, rx) = setup(vec![]);
        let oracle = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                for event in rx.iter().take(2) {
                    let verdict = if event.seq == 0 {
                        PolicyVerdict::Allow
                    } else {
                        PolicyVerdict::Deny("read-only".into())
                    };
                    shared.pending.deliver((event.tid, event.seq), verdict);
                }
            })
        };

        shared.process(100, open_event(5, 0, "/etc/hosts"), || Outcome::Continue);
        shared.process(101, open_event(5, 1, "/tmp/lim/x"), || Outcome::Continue);
        oracle.join().unwrap();

        let responses = responder.responses.lock().unwrap().clone();
        assert_eq!(responses[0], SeccompNotifResp::continue_syscall(100));
        assert_eq!(responses[1], SeccompNotifResp::fail(101, libc::EPERM));

        let ledger = shared.ledger();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].0, open_event(5, 1, "/tmp/lim/x"));
        assert_eq!(ledger[0].1, PolicyVerdict::Deny("read-only".into()));
        assert_eq!(shared.total.load(Ordering::Relaxed), 2);
        assert!(shared.kill.cause().is_none());
    }

    #[test]
    fn terminate_fires_kill_switch() {
        let (shared, responder, rx) = setup(vec![]);
        let oracle = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                let event = rx.recv().unwrap();
                shared.pending.deliver(
                    (event.tid, event.seq),
                    PolicyVerdict::Terminate("exec forbidden".into()),
                );
            })
        };

        shared.process(7, open_event(9, 0, "/bin/sh"), || Outcome::Continue);
        oracle.join().unwrap();

        assert_eq!(
            shared.kill.cause(),
            Some(KillCause::Terminated {
                event: open_event(9, 0, "/bin/sh"),
                reason: "exec forbidden".into(),
            })
        );
        assert_eq!(
            responder.responses.lock().unwrap()[0],
            SeccompNotifResp::fail(7, libc::EPERM)
        );
    }

    #[test]
    fn stale_notification_skipped() {
        let (shared, responder, _rx) = setup(vec![3]);
        shared.process(3, open_event(1, 0, "/x"), || Outcome::Continue);
        assert!(responder.responses.lock().unwrap().is_empty());
        assert_eq!(shared.total.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn channel_loss_fails_closed() {
        let (shared, responder, rx) = setup(vec![]);
        let worker = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                shared.process(11, open_event(2, 0, "/tmp/a"), || Outcome::Continue)
            })
        };
        // Event reached the tool, which then vanishes without answering.
        let _event = rx.recv().unwrap();
        shared.channel_lost("tool closed its output".into());
        worker.join().unwrap();

        assert_eq!(
            shared.kill.cause(),
            Some(KillCause::ChannelLost("tool closed its output".into()))
        );
        assert_eq!(
            responder.responses.lock().unwrap()[0],
            SeccompNotifResp::fail(11, libc::EPERM)
        );

        // Later events never wait for a verdict.
        shared.process(12, open_event(2, 1, "/tmp/b"), || Outcome::Continue);
        let ledger = shared.ledger();
        assert_eq!(ledger.len(), 2);
        assert!(
            ledger
                .iter()
                .all(|(_, v)| *v == PolicyVerdict::Terminate(CHANNEL_LOST.into()))
        );
    }

    #[test]
    fn send_failure_fails_closed() {
        let (shared, _responder, rx) = setup(vec![]);
        drop(rx);
        shared.process(1, open_event(4, 0, "/tmp/c"), || Outcome::Continue);
        assert!(matches!(
            shared.kill.cause(),
            Some(KillCause::ChannelLost(_))
        ));
    }

    #[test]
    fn per_thread_order_with_shuffled_oracle() {
        const THREADS: u32 = 4;
        const PER_THREAD: u64 = 25;

        let (shared, responder, rx) = setup(vec![]);

        // Oracle: collects a batch of events, then answers in random order.
        let oracle = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                let mut rng = 0x9e37_79b9_7f4a_7c15u64;
                let mut answered = 0;
                let mut held = Vec::new();
                while answered < u64::from(THREADS) * PER_THREAD {
                    if let Ok(event) = rx.recv_timeout(Duration::from_millis(5)) {
                        held.push(event);
                    }
                    while let Ok(event) = rx.try_recv() {
                        held.push(event);
                    }
                    while !held.is_empty() {
                        let pick = (next_random(&mut rng) % held.len() as u64) as usize;
                        let event = held.swap_remove(pick);
                        let verdict = if event.seq % 3 == 0 {
                            PolicyVerdict::Deny(format!("{}-{}", event.tid, event.seq))
                        } else {
                            PolicyVerdict::Allow
                        };
                        shared.pending.deliver((event.tid, event.seq), verdict);
                        answered += 1;
                    }
                }
            })
        };

        // One supervising worker per monitored thread, as the dispatcher does.
        let workers: Vec<_> = (0..THREADS)
            .map(|tid| {
                let shared = Arc::clone(&shared);
                thread::spawn(move || {
                    for seq in 0..PER_THREAD {
                        let id = u64::from(tid) * 1000 + seq;
                        shared.process(id, open_event(tid, seq, "/tmp/f"), || Outcome::Continue);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        oracle.join().unwrap();

        // Every thread's responses appear in halt order.
        let mut by_tid: BTreeMap<u64, Vec<u64>> = BTreeMap::new();
        for resp in responder.responses.lock().unwrap().iter() {
            by_tid.entry(resp.id / 1000).or_default().push(resp.id % 1000);
        }
        assert_eq!(by_tid.len(), THREADS as usize);
        for seqs in by_tid.values() {
            assert_eq!(*seqs, (0..PER_THREAD).collect::<Vec<_>>());
        }

        // Denials are recorded with the verdict meant for them.
        for (event, verdict) in shared.ledger() {
            assert_eq!(
                verdict,
                PolicyVerdict::Deny(format!("{}-{}", event.tid, event.seq))
            );
        }
        assert_eq!(
            shared.total.load(Ordering::Relaxed),
            u64::from(THREADS) * PER_THREAD
        );
    }

    /// Answers every event with `verdict`.
    fn answer_all(
        shared: &Arc<Shared>,
        rx: std::sync::mpsc::Receiver<PolicyEvent>,
        verdict: PolicyVerdict,
    ) -> JoinHandle<()> {
        let shared = Arc::clone(shared);
        thread::spawn(move || {
            for event in rx {
                shared.pending.deliver((event.tid, event.seq), verdict.clone());
            }
        })
    }

    #[test]
    fn allowed_open_is_injected() {
        let (shared, responder, rx) = setup(vec![]);
        let _oracle = answer_all(&shared, rx, PolicyVerdict::Allow);

        let file = tempfile::tempfile().unwrap();
        shared.process(20, open_event(3, 0, "/tmp/lim/x"), || Outcome::Fd {
            fd: file.into(),
            cloexec: true,
        });
        shared.process(21, open_event(3, 1, "/tmp/lim/y"), || Outcome::Value(0));
        shared.process(22, open_event(3, 2, "/tmp/lim/z"), || {
            Outcome::Errno(libc::ENOENT)
        });

        assert_eq!(*responder.injected.lock().unwrap(), vec![(20, true)]);
        assert_eq!(
            *responder.responses.lock().unwrap(),
            vec![
                SeccompNotifResp::succeed(21, 0),
                SeccompNotifResp::fail(22, libc::ENOENT),
            ]
        );
        assert!(shared.ledger().is_empty());
    }

    #[test]
    fn refused_after_allow_is_recorded() {
        let (shared, responder, rx) = setup(vec![]);
        let _oracle = answer_all(&shared, rx, PolicyVerdict::Allow);

        shared.process(30, open_event(4, 0, "/bin/true"), || {
            Outcome::Refused("exec path lives in shared memory".into())
        });

        assert_eq!(
            responder.responses.lock().unwrap()[0],
            SeccompNotifResp::fail(30, libc::EPERM)
        );
        let ledger = shared.ledger();
        assert_eq!(ledger.len(), 1);
        assert_eq!(
            ledger[0].1,
            PolicyVerdict::Deny("exec path lives in shared memory".into())
        );
    }

    #[test]
    fn denied_syscall_never_performed() {
        let (shared, responder, rx) = setup(vec![]);
        let _oracle = answer_all(&shared, rx, PolicyVerdict::Deny("no".into()));

        shared.process(40, open_event(6, 0, "/etc/shadow"), || {
            panic!("denied syscall performed")
        });
        assert_eq!(
            responder.responses.lock().unwrap()[0],
            SeccompNotifResp::fail(40, libc::EPERM)
        );
    }

    #[test]
    fn settled_without_an_event() {
        let (shared, responder, rx) = setup(vec![]);
        shared.settle(50, 8, || Outcome::Value(5));
        assert!(rx.try_recv().is_err());
        assert_eq!(
            *responder.responses.lock().unwrap(),
            vec![SeccompNotifResp::succeed(50, 5)]
        );
        assert_eq!(shared.total.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn first_kill_cause_wins() {
        let switch = KillSwitch::detached();
        assert!(switch.fire(KillCause::TimedOut));
        assert!(!switch.fire(KillCause::Aborted { signal: 2 }));
        assert_eq!(switch.cause(), Some(KillCause::TimedOut));
    }
}
