//! Per-transaction timers.
//!
//! Each armed timer is a spawned tokio task that sleeps and then re-enters its transaction
//! through [`TimerTarget::on_timer`]. The task only holds a `Weak` reference, so a
//! transaction that has been dropped simply lets its timers lapse. Every arming gets a
//! generation number; a timer that fires after it was cancelled or re-armed presents a
//! stale generation and is ignored by [`TimerSet::claim`].

pub mod types;

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::trace;

pub use types::{TimerEvent, TimerSettings};

/// Something a timer can fire into.
#[async_trait]
pub trait TimerTarget: Send + Sync + 'static {
    /// Called from the timer task once the delay has elapsed. Implementations lock the
    /// transaction and check [`TimerSet::claim`] before acting.
    async fn on_timer(self: Arc<Self>, event: TimerEvent, generation: u64);
}

/// The timers currently armed on one transaction, at most one per [`TimerEvent`].
#[derive(Debug, Default)]
pub struct TimerSet {
    active: HashMap<TimerEvent, (u64, JoinHandle<()>)>,
    generation: u64,
}

impl TimerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms `event` to fire after `delay`, replacing any earlier arming of the same event.
    pub fn schedule<T: TimerTarget>(&mut self, target: Weak<T>, event: TimerEvent, delay: Duration) {
        self.cancel(event);
        self.generation += 1;
        let generation = self.generation;
        trace!(%event, ?delay, generation, "arming timer");
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(target) = target.upgrade() {
                target.on_timer(event, generation).await;
            }
        });
        self.active.insert(event, (generation, handle));
    }

    /// Disarms `event`. Returns whether it was armed.
    pub fn cancel(&mut self, event: TimerEvent) -> bool {
        match self.active.remove(&event) {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, (_, handle)) in self.active.drain() {
            handle.abort();
        }
    }

    pub fn is_armed(&self, event: TimerEvent) -> bool {
        self.active.contains_key(&event)
    }

    /// Accepts a firing if `generation` is the live arming of `event` and forgets it, so the
    /// handler can re-arm or cancel without aborting the task it is running on.
    pub fn claim(&mut self, event: TimerEvent, generation: u64) -> bool {
        match self.active.get(&event) {
            Some((armed, _)) if *armed == generation => {
                self.active.remove(&event);
                true
            }
            _ => false,
        }
    }
}

impl Drop for TimerSet {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
