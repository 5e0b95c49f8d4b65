//! Seams to the engine's external collaborators.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde_json::{Map, Value};

use crate::campaign::CampaignRule;
use crate::error::Result;
use crate::types::{Event, Task};

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to. Used to make delays deterministic.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: TimeDelta) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Delivers a task to the remote executor.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Name used in logs, e.g. "webhook".
    fn name(&self) -> &str;

    async fn dispatch(&self, task: &Task) -> Result<()>;
}

/// Builds the template variable bag for an event and its campaign rule.
#[async_trait]
pub trait VariableResolver: Send + Sync {
    /// Returns a nested variable map with null entries pruned.
    async fn resolve(&self, event: &Event, rule: &CampaignRule) -> Result<Map<String, Value>>;
}
