//! One-shot timers keyed by task id.
//!
//! Each armed timer is a tokio task sleeping until its deadline. Firing and
//! cancelling race through the same map lock: a timer removes its own entry
//! before running the callback, and `cancel` removes the entry before aborting
//! the sleeper, so exactly one of the two takes effect.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use nudge_core::traits::Clock;
use tokio::task::JoinHandle;

/// Work to run when a timer fires.
pub type TimerCallback = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Arms and cancels one-shot timers.
pub trait Scheduler: Send + Sync {
    /// Arm a timer for `task_id`, replacing any existing one.
    fn schedule(&self, task_id: &str, run_at: DateTime<Utc>, callback: TimerCallback);

    /// Cancel the timer for `task_id`. Unknown or already-fired ids are a no-op.
    fn cancel(&self, task_id: &str);
}

struct ArmedTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

type TimerMap = Arc<Mutex<HashMap<String, ArmedTimer>>>;

fn lock(timers: &TimerMap) -> MutexGuard<'_, HashMap<String, ArmedTimer>> {
    timers.lock().unwrap_or_else(|e| e.into_inner())
}

/// Tokio-backed [`Scheduler`]. Must be used from within a tokio runtime.
pub struct TimerScheduler {
    clock: Arc<dyn Clock>,
    timers: TimerMap,
    generation: AtomicU64,
}

impl TimerScheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            timers: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        }
    }

    /// Whether a timer for `task_id` is armed and has not fired yet.
    pub fn is_armed(&self, task_id: &str) -> bool {
        lock(&self.timers).contains_key(task_id)
    }

    pub fn armed_count(&self) -> usize {
        lock(&self.timers).len()
    }
}

impl Scheduler for TimerScheduler {
    fn schedule(&self, task_id: &str, run_at: DateTime<Utc>, callback: TimerCallback) {
        let delay = (run_at - self.clock.now()).to_std().unwrap_or_default();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);

        // Held across the spawn so the sleeper can't claim before it's registered.
        let mut timers = lock(&self.timers);
        if let Some(previous) = timers.remove(task_id) {
            previous.handle.abort();
            tracing::debug!("⏱️ Timer for task {} replaced", task_id);
        }

        let registry = Arc::clone(&self.timers);
        let key = task_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let claimed = {
                let mut timers = lock(&registry);
                match timers.get(&key) {
                    Some(armed) if armed.generation == generation => {
                        timers.remove(&key);
                        true
                    }
                    _ => false,
                }
            };
            if claimed {
                callback().await;
            }
        });

        timers.insert(task_id.to_string(), ArmedTimer { generation, handle });
        tracing::debug!("⏱️ Timer armed for task {} in {:?}", task_id, delay);
    }

    fn cancel(&self, task_id: &str) {
        if let Some(armed) = lock(&self.timers).remove(task_id) {
            armed.handle.abort();
            tracing::debug!("⏱️ Timer for task {} cancelled", task_id);
        }
    }
}
