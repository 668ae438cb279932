//! Coalescing work queue with per-key serialization.
//!
//! ## Guarantees
//!
//! - **Coalescing**: a key added several times before a worker takes it is
//!   queued once
//! - **Per-key serialization**: a key handed to a worker is not handed out
//!   again until [`WorkQueue::done`]; adds in the meantime mark it dirty and it
//!   is requeued on `done`
//! - **Backoff**: [`WorkQueue::add_rate_limited`] delays a key by
//!   `base * 2^failures`, capped at `max`, until [`WorkQueue::forget`]
//! - **Shutdown**: [`WorkQueue::shut_down`] stops handing out keys; workers
//!   blocked in [`WorkQueue::get`] observe `None`

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;

use keel_core::id::RecordKey;

/// Exponential per-key retry delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Delay after the first failure.
    pub base: Duration,
    /// Upper bound on any delay.
    pub max: Duration,
}

impl Backoff {
    /// Returns the delay after `failures` previous failures.
    #[must_use]
    pub fn delay(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures.min(31));
        self.base.saturating_mul(factor).min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    queue: VecDeque<RecordKey>,
    dirty: HashSet<RecordKey>,
    processing: HashSet<RecordKey>,
    failures: HashMap<RecordKey, u32>,
    shutting_down: bool,
}

/// Work queue of record keys.
#[derive(Debug)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    backoff: Backoff,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new(Backoff::default())
    }
}

impl WorkQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new(backoff: Backoff) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            backoff,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueues a key unless it is already waiting.
    pub fn add(&self, key: RecordKey) {
        let mut state = self.lock();
        if state.shutting_down || !state.dirty.insert(key.clone()) {
            return;
        }
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.notify.notify_one();
    }

    /// Enqueues a key after `delay`.
    pub fn add_after(self: &Arc<Self>, key: RecordKey, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Enqueues a key after its backoff delay and counts the failure.
    ///
    /// Returns the delay used.
    pub fn add_rate_limited(self: &Arc<Self>, key: RecordKey) -> Duration {
        let delay = {
            let mut state = self.lock();
            let failures = state.failures.entry(key.clone()).or_default();
            let delay = self.backoff.delay(*failures);
            *failures = failures.saturating_add(1);
            delay
        };
        self.add_after(key, delay);
        delay
    }

    /// Resets a key's failure count.
    pub fn forget(&self, key: &RecordKey) {
        self.lock().failures.remove(key);
    }

    /// Returns a key's failure count.
    #[must_use]
    pub fn failures(&self, key: &RecordKey) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or_default()
    }

    /// Waits for the next key. Returns `None` once shut down.
    pub async fn get(&self) -> Option<RecordKey> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Marks a key as finished, requeueing it if it was added meanwhile.
    pub fn done(&self, key: &RecordKey) {
        let mut state = self.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Stops handing out keys and wakes every waiting worker.
    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    /// Returns true once shut down.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Returns the number of keys waiting.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Returns true if no key is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
