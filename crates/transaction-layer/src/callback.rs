//! Delivery of TU callbacks off the protocol path.
//!
//! State machines never call into the TU while holding a transaction lock. They enqueue a
//! job instead, and a fixed set of worker tasks runs the jobs. Each job is pinned to a
//! worker by the serial number of its transaction, so callbacks of one transaction are
//! delivered in the order they were produced.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::{error, trace, warn};

pub type CallbackJob = BoxFuture<'static, ()>;

struct Worker {
    tx: mpsc::UnboundedSender<CallbackJob>,
    depth: Arc<AtomicUsize>,
}

/// Fixed pool of callback workers.
pub struct CallbackPool {
    workers: Vec<Worker>,
    warn_at: usize,
}

impl std::fmt::Debug for CallbackPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackPool")
            .field("workers", &self.workers.len())
            .field("pending", &self.pending())
            .finish()
    }
}

impl CallbackPool {
    /// Spawns `workers` tasks (at least one) on the current runtime.
    pub fn new(workers: usize, warn_at: usize) -> Self {
        let workers = (0..workers.max(1))
            .map(|index| {
                let (tx, mut rx) = mpsc::unbounded_channel::<CallbackJob>();
                let depth = Arc::new(AtomicUsize::new(0));
                let worker_depth = depth.clone();
                tokio::spawn(async move {
                    while let Some(job) = rx.recv().await {
                        worker_depth.fetch_sub(1, Ordering::AcqRel);
                        if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                            error!(worker = index, "TU callback panicked");
                        }
                    }
                    trace!(worker = index, "callback worker stopped");
                });
                Worker { tx, depth }
            })
            .collect();
        Self { workers, warn_at }
    }

    /// Queues `job` on the worker owning `serial`. Never blocks.
    pub fn dispatch(&self, serial: u64, job: CallbackJob) {
        let worker = &self.workers[(serial % self.workers.len() as u64) as usize];
        let depth = worker.depth.fetch_add(1, Ordering::AcqRel) + 1;
        if depth == self.warn_at {
            warn!(serial, depth, "callback queue is backing up");
        }
        if worker.tx.send(job).is_err() {
            worker.depth.fetch_sub(1, Ordering::AcqRel);
            warn!(serial, "callback worker gone, dropping callback");
        }
    }

    /// Boxes and queues a future.
    pub fn spawn<F>(&self, serial: u64, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.dispatch(serial, job.boxed());
    }

    /// Jobs queued and not yet started, across all workers.
    pub fn pending(&self) -> usize {
        self.workers
            .iter()
            .map(|w| w.depth.load(Ordering::Acquire))
            .sum()
    }
}
