use crate::sup::Event;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

/// What an armed timer does when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// SIGKILL a process that ignored SIGTERM
    Kill,
    /// Next crash-respawn attempt
    Retry,
    /// Bounded wait for a daemon's pid file to appear
    PidFile,
    /// Fleet-wide SIGKILL grace period during shutdown
    Grace,
}

/// Per-service timer slots. Each service holds at most one; arming
/// replaces, cancelling is synchronous. Fires are delivered as events
/// carrying a generation so a fire that raced a cancel is discarded.
pub trait Timers: Send {
    /// Arm (or re-arm) the slot for `ident`. Returns the generation.
    fn arm(&mut self, ident: &str, kind: TimerKind, delay: Duration) -> u64;

    /// Arm only if the slot is empty. Returns false when a timer was
    /// already pending and nothing was done.
    fn arm_if_idle(&mut self, ident: &str, kind: TimerKind, delay: Duration) -> bool;

    fn cancel(&mut self, ident: &str);

    fn armed(&self, ident: &str) -> Option<TimerKind>;

    /// Validate a fire: clears and returns the slot if `gen` is still
    /// current, otherwise the fire is stale.
    fn claim(&mut self, ident: &str, gen: u64) -> Option<TimerKind>;
}

/// Timer backend running on the tokio reactor: one sleeping task per
/// armed slot, posting back to the supervisor loop.
pub struct TokioTimers {
    tx: UnboundedSender<Event>,
    slots: HashMap<String, Slot>,
    next_gen: u64,
}

struct Slot {
    kind: TimerKind,
    gen: u64,
    handle: JoinHandle<()>,
}

impl TokioTimers {
    pub fn new(tx: UnboundedSender<Event>) -> TokioTimers {
        TokioTimers {
            tx,
            slots: HashMap::new(),
            next_gen: 0,
        }
    }
}

impl Timers for TokioTimers {
    fn arm(&mut self, ident: &str, kind: TimerKind, delay: Duration) -> u64 {
        self.cancel(ident);

        self.next_gen += 1;
        let gen = self.next_gen;

        let tx = self.tx.clone();
        let owner = ident.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Event::Timer {
                ident: owner,
                kind,
                gen,
            });
        });

        self.slots.insert(ident.to_string(), Slot { kind, gen, handle });
        gen
    }

    fn arm_if_idle(&mut self, ident: &str, kind: TimerKind, delay: Duration) -> bool {
        if self.slots.contains_key(ident) {
            return false;
        }
        self.arm(ident, kind, delay);
        true
    }

    fn cancel(&mut self, ident: &str) {
        if let Some(slot) = self.slots.remove(ident) {
            slot.handle.abort();
        }
    }

    fn armed(&self, ident: &str) -> Option<TimerKind> {
        self.slots.get(ident).map(|s| s.kind)
    }

    fn claim(&mut self, ident: &str, gen: u64) -> Option<TimerKind> {
        match self.slots.get(ident) {
            Some(slot) if slot.gen == gen => self.slots.remove(ident).map(|s| s.kind),
            _ => None,
        }
    }
}
