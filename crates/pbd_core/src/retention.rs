//! Deferred-task scheduling for retention policies.
//!
//! A [`RetentionScheduler`] is a shared, injected service: one scheduler
//! (with its single worker thread) can serve many deques. Each deque
//! schedules its own recheck tasks under its nonce as the key; the
//! scheduler guarantees at most one outstanding task per key, so a burst
//! of segment rolls collapses into a single pending check.

use crate::config::RetentionConfig;
use parking_lot::{Condvar, Mutex};
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::debug;

/// Cursor name reserved for time-based retention.
pub const RETENTION_CURSOR: &str = "_retention";

type Job = Box<dyn FnOnce() + Send>;

struct ScheduledTask {
    deadline: Instant,
    seq: u64,
    key: String,
    job: Job,
}

impl PartialEq for ScheduledTask {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for ScheduledTask {}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTask {
    // Reversed: the earliest deadline sits at the top of the max-heap.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then(other.seq.cmp(&self.seq))
    }
}

struct SchedulerState {
    queue: BinaryHeap<ScheduledTask>,
    pending: HashSet<String>,
    seq: u64,
    shutdown: bool,
}

struct SchedulerShared {
    state: Mutex<SchedulerState>,
    wakeup: Condvar,
}

/// A single-threaded deadline scheduler for retention rechecks.
///
/// Dropping the scheduler stops the worker; tasks not yet due are
/// discarded.
pub struct RetentionScheduler {
    shared: Arc<SchedulerShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RetentionScheduler {
    /// Starts the scheduler and its worker thread.
    #[must_use]
    pub fn new() -> Self {
        let shared = Arc::new(SchedulerShared {
            state: Mutex::new(SchedulerState {
                queue: BinaryHeap::new(),
                pending: HashSet::new(),
                seq: 0,
                shutdown: false,
            }),
            wakeup: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("pbd-retention".to_string())
            .spawn(move || run_worker(&worker_shared))
            .ok();

        Self {
            shared,
            worker: Mutex::new(worker),
        }
    }

    /// Schedules `job` to run after `delay`, keyed by `key`.
    ///
    /// While a task for `key` is still pending, further schedules for the
    /// same key are dropped; the pending task's own run re-evaluates state
    /// and reschedules as needed.
    pub fn schedule(&self, key: &str, delay: Duration, job: Job) {
        let mut state = self.shared.state.lock();
        if state.shutdown || !state.pending.insert(key.to_string()) {
            return;
        }
        state.seq += 1;
        let seq = state.seq;
        state.queue.push(ScheduledTask {
            deadline: Instant::now() + delay,
            seq,
            key: key.to_string(),
            job,
        });
        debug!(key, delay_ms = delay.as_millis() as u64, "scheduled retention check");
        drop(state);
        self.shared.wakeup.notify_one();
    }
}

impl Default for RetentionScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RetentionScheduler {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            state.queue.clear();
            state.pending.clear();
        }
        self.shared.wakeup.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

fn run_worker(shared: &SchedulerShared) {
    let mut state = shared.state.lock();
    loop {
        if state.shutdown {
            return;
        }
        let now = Instant::now();
        match state.queue.peek() {
            None => {
                shared.wakeup.wait(&mut state);
            }
            Some(task) if task.deadline <= now => {
                if let Some(task) = state.queue.pop() {
                    state.pending.remove(&task.key);
                    // Run outside the lock; the job may reschedule.
                    drop(state);
                    (task.job)();
                    state = shared.state.lock();
                }
            }
            Some(task) => {
                let deadline = task.deadline;
                shared.wakeup.wait_until(&mut state, deadline);
            }
        }
    }
}

/// A deque's binding to its retention policy: the window configuration
/// plus the shared scheduler it runs on.
pub(crate) struct RetentionRuntime {
    pub config: RetentionConfig,
    pub scheduler: Arc<RetentionScheduler>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::mpsc;

    #[test]
    fn runs_scheduled_job() {
        let scheduler = RetentionScheduler::new();
        let (tx, rx) = mpsc::channel();
        scheduler.schedule(
            "a",
            Duration::from_millis(5),
            Box::new(move || tx.send(42u32).unwrap()),
        );
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
    }

    #[test]
    fn at_most_one_pending_task_per_key() {
        let scheduler = RetentionScheduler::new();
        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..5 {
            let counter = Arc::clone(&counter);
            scheduler.schedule(
                "same-key",
                Duration::from_millis(50),
                Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn distinct_keys_run_independently() {
        let scheduler = RetentionScheduler::new();
        let (tx, rx) = mpsc::channel();
        for key in ["x", "y", "z"] {
            let tx = tx.clone();
            scheduler.schedule(
                key,
                Duration::from_millis(5),
                Box::new(move || tx.send(key).unwrap()),
            );
        }
        let mut seen: Vec<&str> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, vec!["x", "y", "z"]);
    }

    #[test]
    fn key_is_reusable_after_run() {
        let scheduler = RetentionScheduler::new();
        let (tx, rx) = mpsc::channel();
        let tx2 = tx.clone();
        scheduler.schedule("k", Duration::from_millis(2), Box::new(move || tx.send(1).unwrap()));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
        scheduler.schedule("k", Duration::from_millis(2), Box::new(move || tx2.send(2).unwrap()));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 2);
    }

    #[test]
    fn drop_discards_undelivered_tasks() {
        let scheduler = RetentionScheduler::new();
        let (tx, rx) = mpsc::channel::<u32>();
        scheduler.schedule(
            "late",
            Duration::from_secs(3600),
            Box::new(move || tx.send(1).unwrap()),
        );
        drop(scheduler);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }
}
