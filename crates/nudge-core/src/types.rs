//! Data model: events, per-user lifecycle state, and tasks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Event name that moves a user from anonymous to signed up.
pub const SIGNUP_COMPLETED: &str = "signup_completed";
/// Event name that moves a signed-up user to activated.
pub const ACTIVATED: &str = "activated";

/// An immutable fact about a user action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event name, e.g. "signup_completed".
    pub event: String,
    /// Optional unique id. Absence disables dedup for this event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    pub user_id: String,
    pub product: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

impl Event {
    /// Create an event stamped with the current time and no properties.
    pub fn new(event: &str, user_id: &str, product: &str) -> Self {
        Self {
            event: event.to_string(),
            event_id: None,
            user_id: user_id.to_string(),
            product: product.to_string(),
            timestamp: Utc::now(),
            properties: Map::new(),
        }
    }

    pub fn with_id(mut self, event_id: &str) -> Self {
        self.event_id = Some(event_id.to_string());
        self
    }

    pub fn with_property(mut self, key: &str, value: Value) -> Self {
        self.properties.insert(key.to_string(), value);
        self
    }
}

/// Per-user lifecycle stage. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    #[default]
    Anonymous,
    SignedUp,
    Activated,
}

impl std::fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Lifecycle::Anonymous => write!(f, "anonymous"),
            Lifecycle::SignedUp => write!(f, "signed_up"),
            Lifecycle::Activated => write!(f, "activated"),
        }
    }
}

/// Lifecycle and task state for one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserState {
    pub user_id: String,
    pub status: Lifecycle,
    pub has_signed_up: bool,
    pub has_activated: bool,
    /// Append-only; entries are updated in place on status changes.
    pub tasks: Vec<Task>,
}

impl UserState {
    /// Fresh anonymous record with no tasks.
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            status: Lifecycle::Anonymous,
            has_signed_up: false,
            has_activated: false,
            tasks: Vec::new(),
        }
    }

    /// Apply the lifecycle transition for `event_name`.
    ///
    /// Returns `false` for a rejected transition, leaving the state untouched.
    /// Event names other than the two lifecycle events pass through.
    pub fn apply_lifecycle(&mut self, event_name: &str) -> bool {
        match event_name {
            SIGNUP_COMPLETED => {
                if self.status != Lifecycle::Anonymous {
                    return false;
                }
                self.status = Lifecycle::SignedUp;
                self.has_signed_up = true;
                true
            }
            ACTIVATED => {
                if self.status != Lifecycle::SignedUp {
                    return false;
                }
                self.status = Lifecycle::Activated;
                self.has_activated = true;
                true
            }
            _ => true,
        }
    }

    pub fn task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    pub fn task_mut(&mut self, task_id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == task_id)
    }
}

/// Kind of work a task performs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskKind {
    /// Templated email notification.
    SendEmail,
    /// Any other kind, passed through to the executor as-is.
    Other(String),
}

impl TaskKind {
    pub fn as_str(&self) -> &str {
        match self {
            TaskKind::SendEmail => "send_email",
            TaskKind::Other(kind) => kind,
        }
    }

    /// Whether payloads of this kind are built from a template.
    pub fn is_templated(&self) -> bool {
        matches!(self, TaskKind::SendEmail)
    }
}

impl From<String> for TaskKind {
    fn from(kind: String) -> Self {
        match kind.as_str() {
            "send_email" => TaskKind::SendEmail,
            _ => TaskKind::Other(kind),
        }
    }
}

impl From<&str> for TaskKind {
    fn from(kind: &str) -> Self {
        TaskKind::from(kind.to_string())
    }
}

impl From<TaskKind> for String {
    fn from(kind: TaskKind) -> Self {
        kind.as_str().to_string()
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Scheduled,
    Dispatched,
    Cancelled,
    Failed,
}

/// A unit of dispatchable work, serialized in the executor's camelCase shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: TaskKind,
    pub payload: TaskPayload,
    pub status: TaskStatus,
    /// Event name that cancels this task if seen before it fires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_condition: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Template this task was built from, if any.
    pub fn template(&self) -> Option<&str> {
        self.payload.template()
    }
}

/// Fully resolved content of a task, one variant per payload shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskPayload {
    Email(EmailPayload),
    Generic(GenericPayload),
}

impl TaskPayload {
    pub fn template(&self) -> Option<&str> {
        match self {
            TaskPayload::Email(email) => Some(&email.template),
            TaskPayload::Generic(generic) => generic.fields.get("template").and_then(Value::as_str),
        }
    }
}

/// Frozen payload for a templated email.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailPayload {
    /// Always "send_email".
    pub task: String,
    pub template: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    pub variables: Map<String, Value>,
    pub context: EmailContext,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailContext {
    pub event: String,
    pub user_id: String,
    pub product: String,
}

/// Rule fields (minus the task kind) copied verbatim, plus the user id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenericPayload {
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}
