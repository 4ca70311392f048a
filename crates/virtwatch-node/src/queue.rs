//! Deduplicating work queue of node keys with per-key exponential backoff
//!
//! Semantics:
//! - a key is pending at most once; rapid repeated triggers coalesce
//! - a key is handed to at most one worker at a time; a key enqueued while a
//!   worker holds it is queued again once that worker reports back
//! - a failed key comes back after an exponentially growing, jittered delay;
//!   success resets its failure count and drops a pending retry
//! - after shutdown no further keys are handed out

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::Notify;
use tracing::{debug, trace};

use virtwatch_common::metrics;

/// Work queue consumed by the reconciliation workers
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Add a key unless it is already pending
    fn enqueue(&self, key: String);

    /// Wait for the next key; `None` once the queue is shut down
    async fn dequeue(&self) -> Option<String>;

    /// Report that processing `key` succeeded
    fn mark_done(&self, key: &str);

    /// Report that processing `key` failed; it is re-enqueued after a backoff
    fn mark_failed_and_retry(&self, key: &str);

    /// Consecutive failures recorded for `key`
    fn num_requeues(&self, key: &str) -> u32;

    /// Stop handing out keys and wake all waiting workers
    fn shut_down(&self);

    /// Number of keys waiting to be handed out
    fn len(&self) -> usize;

    /// True if no key is waiting
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Backoff policy for failed keys
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Upper bound for any delay
    pub max_delay: Duration,
    /// Growth factor per consecutive failure
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Delay before retrying after `failures` consecutive failures, without jitter
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    /// [`Self::delay_for`] with 0.5x to 1.5x jitter, capped at `max_delay`
    pub fn jittered_delay_for(&self, failures: u32) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let secs = self.delay_for(failures).as_secs_f64() * jitter;
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

#[derive(Default)]
struct State {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    failures: HashMap<String, u32>,
    shutting_down: bool,
}

struct Inner {
    state: Mutex<State>,
    notify: Notify,
    backoff: BackoffConfig,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn add(&self, key: String) {
        let state = self.lock();
        self.push(state, key);
    }

    /// Re-add a key whose backoff elapsed, unless it succeeded in the meantime
    fn retry(&self, key: String) {
        let state = self.lock();
        if !state.failures.contains_key(&key) {
            trace!(node = %key, "key recovered during backoff, skipping retry");
            return;
        }
        self.push(state, key);
    }

    fn push(&self, mut state: MutexGuard<'_, State>, key: String) {
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            trace!(node = %key, "key in flight, will be re-queued when released");
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.notify.notify_one();
    }

    fn release(&self, state: &mut State, key: &str) {
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.to_string());
            self.notify.notify_one();
        }
    }
}

/// In-process [`WorkQueue`] implementation
#[derive(Clone)]
pub struct RateLimitedQueue {
    inner: Arc<Inner>,
}

impl RateLimitedQueue {
    /// Create an empty queue using `backoff` for failed keys
    pub fn new(backoff: BackoffConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                notify: Notify::new(),
                backoff,
            }),
        }
    }
}

impl Default for RateLimitedQueue {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

#[async_trait]
impl WorkQueue for RateLimitedQueue {
    fn enqueue(&self, key: String) {
        self.inner.add(key);
    }

    async fn dequeue(&self) -> Option<String> {
        loop {
            // Register interest before checking state so a notification sent
            // between the check and the await is not lost
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.inner.lock();
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

    fn mark_done(&self, key: &str) {
        let mut state = self.inner.lock();
        state.failures.remove(key);
        self.inner.release(&mut state, key);
    }

    fn mark_failed_and_retry(&self, key: &str) {
        let delay = {
            let mut state = self.inner.lock();
            self.inner.release(&mut state, key);
            if state.shutting_down {
                return;
            }
            let failures = state.failures.entry(key.to_string()).or_insert(0);
            *failures += 1;
            self.inner.backoff.jittered_delay_for(*failures)
        };

        metrics::record_queue_retry();
        debug!(node = %key, delay_ms = delay.as_millis(), "re-enqueueing node after backoff");

        let inner = Arc::clone(&self.inner);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.retry(key);
        });
    }

    fn num_requeues(&self, key: &str) -> u32 {
        self.inner.lock().failures.get(key).copied().unwrap_or(0)
    }

    fn shut_down(&self) {
        self.inner.lock().shutting_down = true;
        self.inner.notify.notify_waiters();
    }

    fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }
}
