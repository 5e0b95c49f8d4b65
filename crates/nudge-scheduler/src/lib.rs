//! # Nudge Scheduler
//!
//! Event-driven lifecycle engine: dedups incoming product events, tracks each
//! user's lifecycle, and turns events into email or generic tasks that are
//! dispatched now or after a delay.
//!
//! ## Design Principles
//! - In-memory state behind one lock, never held across an await
//! - Tokio timers only, one sleeper per scheduled task
//! - Cancellation wins over a timer that has not yet claimed its task
//! - Every decision leaves an audit record
//!
//! ## Architecture
//! ```text
//! Event ─→ EventStore::admit (dedup + lifecycle)
//!            └── DecisionEngine::process_event
//!                  ├── cancel matching scheduled tasks → TimerScheduler::cancel
//!                  ├── RuleTable lookup → TemplateRegistry + VariableResolver
//!                  ├── immediate → Dispatcher (webhook)
//!                  └── delayed   → TimerScheduler::schedule → Dispatcher
//! ```

pub mod audit;
pub mod dispatch;
pub mod engine;
pub mod store;
pub mod timer;
pub mod variables;

pub use audit::{AuditEntry, AuditLog, AuditRecord};
pub use dispatch::WebhookDispatcher;
pub use engine::{DecisionEngine, IngestOutcome};
pub use store::{Admission, EventStore};
pub use timer::{Scheduler, TimerCallback, TimerScheduler};
pub use variables::{DefaultVariableResolver, prune_nulls};
