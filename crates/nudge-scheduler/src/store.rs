//! In-memory event store: processed event ids, the event log, and per-user state.
//! Everything sits behind one mutex; no lock is held across an await.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use nudge_core::types::{Event, Task, UserState};

/// Result of admitting an event into the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    /// The event id was already processed.
    Duplicate,
    /// The lifecycle state machine rejected the event.
    InvalidTransition,
}

#[derive(Default)]
struct Inner {
    events: Vec<Event>,
    users: HashMap<String, UserState>,
    processed: HashSet<String>,
}

impl Inner {
    fn user(&mut self, user_id: &str) -> &mut UserState {
        self.users
            .entry(user_id.to_string())
            .or_insert_with(|| UserState::new(user_id))
    }

    fn add_event(&mut self, event: Event) {
        if let Some(id) = &event.event_id
            && !self.processed.insert(id.clone())
        {
            return;
        }
        self.events.push(event);
    }
}

/// Shared event store.
#[derive(Default)]
pub struct EventStore {
    inner: Mutex<Inner>,
}

impl EventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether an event with this id was already accepted.
    pub fn has_processed(&self, event_id: &str) -> bool {
        self.lock().processed.contains(event_id)
    }

    /// Record the event. A repeated `event_id` is silently ignored.
    pub fn add_event(&self, event: Event) {
        self.lock().add_event(event);
    }

    /// Snapshot of the user's state, creating an anonymous record on first use.
    pub fn user_state(&self, user_id: &str) -> UserState {
        self.lock().user(user_id).clone()
    }

    /// Snapshot of the user's state if the user has been seen.
    pub fn find_user(&self, user_id: &str) -> Option<UserState> {
        self.lock().users.get(user_id).cloned()
    }

    /// Mutate a user's state in place under the store lock.
    pub fn with_user_mut<R>(&self, user_id: &str, f: impl FnOnce(&mut UserState) -> R) -> R {
        f(self.lock().user(user_id))
    }

    /// Append a task to the user's task list.
    pub fn add_task(&self, user_id: &str, task: Task) {
        self.lock().user(user_id).tasks.push(task);
    }

    pub fn find_task(&self, user_id: &str, task_id: &str) -> Option<Task> {
        self.lock().users.get(user_id)?.task(task_id).cloned()
    }

    /// Apply the lifecycle transition for this event to its user.
    pub fn process_event_with_lifecycle(&self, event: &Event) -> bool {
        self.lock().user(&event.user_id).apply_lifecycle(&event.event)
    }

    /// Dedup check, lifecycle transition and append as one step.
    ///
    /// Rejected events leave no trace in the store.
    pub fn admit(&self, event: &Event) -> Admission {
        let mut inner = self.lock();
        if let Some(id) = &event.event_id
            && inner.processed.contains(id)
        {
            return Admission::Duplicate;
        }
        if !inner.user(&event.user_id).apply_lifecycle(&event.event) {
            return Admission::InvalidTransition;
        }
        inner.add_event(event.clone());
        Admission::Accepted
    }

    /// Snapshot of the event log in arrival order.
    pub fn events(&self) -> Vec<Event> {
        self.lock().events.clone()
    }

    pub fn event_count(&self) -> usize {
        self.lock().events.len()
    }

    pub fn user_count(&self) -> usize {
        self.lock().users.len()
    }
}
