//! Correlation table between forwarded events and tool verdicts.
//!
//! Verdicts are matched by `(tid, seq)`, never by arrival order: the tool may
//! answer events of different threads in any order. A worker registers its
//! key before the event is sent, then blocks in [`PendingVerdicts::wait`].
//!
//! Once the table is closed (channel lost, shutdown) every current and future
//! waiter gets `Terminate`, so a halted thread is never resumed without a
//! verdict.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex, MutexGuard};

use super::channel::PolicyVerdict;

/// Key of one forwarded event.
pub type EventKey = (u32, u64);

#[derive(Debug, Default)]
struct Table {
    slots: HashMap<EventKey, Option<PolicyVerdict>>,
    closed: Option<String>,
}

/// Outcome of delivering a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// Nobody waits for this key.
    Unknown,
    /// A verdict for this key was already delivered.
    Duplicate,
}

#[derive(Debug, Default)]
pub struct PendingVerdicts {
    table: Mutex<Table>,
    ready: Condvar,
}

impl PendingVerdicts {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        // A panicking worker must not wedge the others.
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reserve a slot for `key`.
    pub fn register(&self, key: EventKey) {
        self.lock().slots.insert(key, None);
    }

    /// Hand a verdict to the waiter of `key`.
    pub fn deliver(&self, key: EventKey, verdict: PolicyVerdict) -> Delivery {
        let mut table = self.lock();
        match table.slots.get_mut(&key) {
            None => Delivery::Unknown,
            Some(Some(_)) => Delivery::Duplicate,
            Some(slot) => {
                *slot = Some(verdict);
                drop(table);
                self.ready.notify_all();
                Delivery::Delivered
            }
        }
    }

    /// Block until a verdict for `key` arrives or the table is closed.
    pub fn wait(&self, key: EventKey) -> PolicyVerdict {
        let mut table = self.lock();
        loop {
            if let Some(Some(_)) = table.slots.get(&key) {
                if let Some(Some(verdict)) = table.slots.remove(&key) {
                    return verdict;
                }
            }
            if let Some(reason) = &table.closed {
                let reason = reason.clone();
                table.slots.remove(&key);
                return PolicyVerdict::Terminate(reason);
            }
            table = self.ready.wait(table).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Fail every waiter with `Terminate(reason)`. Only the first reason sticks.
    pub fn close(&self, reason: impl Into<String>) {
        let mut table = self.lock();
        if table.closed.is_none() {
            table.closed = Some(reason.into());
        }
        drop(table);
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed.is_some()
    }

    /// Number of events still waiting for a verdict.
    pub fn outstanding(&self) -> usize {
        self.lock().slots.values().filter(|v| v.is_none()).count()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn out_of_order_replies_reach_their_waiters() {
        let pending = Arc::new(PendingVerdicts::new());
        let keys = [(10, 0), (11, 0), (10, 1)];
        for key in keys {
            pending.register(key);
        }

        let waiters: Vec<_> = keys
            .iter()
            .map(|&key| {
                let pending = Arc::clone(&pending);
                thread::spawn(move || (key, pending.wait(key)))
            })
            .collect();

        // Answer in reverse order.
        assert_eq!(
            pending.deliver((10, 1), PolicyVerdict::Deny("third".into())),
            Delivery::Delivered
        );
        assert_eq!(
            pending.deliver((11, 0), PolicyVerdict::Allow),
            Delivery::Delivered
        );
        assert_eq!(
            pending.deliver((10, 0), PolicyVerdict::Terminate("first".into())),
            Delivery::Delivered
        );

        let mut results: Vec<_> = waiters.into_iter().map(|h| h.join().unwrap()).collect();
        results.sort_by_key(|(key, _)| *key);
        assert_eq!(
            results,
            vec![
                ((10, 0), PolicyVerdict::Terminate("first".into())),
                ((10, 1), PolicyVerdict::Deny("third".into())),
                ((11, 0), PolicyVerdict::Allow),
            ]
        );
        assert_eq!(pending.outstanding(), 0);
    }

    #[test]
    fn unknown_and_duplicate_verdicts() {
        let pending = PendingVerdicts::new();
        assert_eq!(
            pending.deliver((1, 0), PolicyVerdict::Allow),
            Delivery::Unknown
        );
        pending.register((1, 0));
        assert_eq!(
            pending.deliver((1, 0), PolicyVerdict::Allow),
            Delivery::Delivered
        );
        assert_eq!(
            pending.deliver((1, 0), PolicyVerdict::Deny("late".into())),
            Delivery::Duplicate
        );
        assert_eq!(pending.wait((1, 0)), PolicyVerdict::Allow);
    }

    #[test]
    fn close_fails_blocked_waiters() {
        let pending = Arc::new(PendingVerdicts::new());
        pending.register((7, 3));
        let waiter = {
            let pending = Arc::clone(&pending);
            thread::spawn(move || pending.wait((7, 3)))
        };
        thread::sleep(Duration::from_millis(20));
        pending.close("enforcement channel lost");
        pending.close("ignored");

        assert_eq!(
            waiter.join().unwrap(),
            PolicyVerdict::Terminate("enforcement channel lost".into())
        );
        assert!(pending.is_closed());
    }

    #[test]
    fn wait_after_close_terminates() {
        let pending = PendingVerdicts::new();
        pending.close("shutdown");
        pending.register((1, 1));
        assert_eq!(
            pending.wait((1, 1)),
            PolicyVerdict::Terminate("shutdown".into())
        );
    }

    #[test]
    fn delivered_before_close_still_wins() {
        let pending = PendingVerdicts::new();
        pending.register((2, 0));
        pending.deliver((2, 0), PolicyVerdict::Allow);
        pending.close("gone");
        assert_eq!(pending.wait((2, 0)), PolicyVerdict::Allow);
    }
}
