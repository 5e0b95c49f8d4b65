//! # Nudge Core
//!
//! Shared vocabulary for the Nudge workspace: the event/task data model,
//! campaign rules, the template registry, configuration, errors, and the
//! traits through which the decision engine reaches its collaborators.

pub mod campaign;
pub mod config;
pub mod error;
pub mod template;
pub mod traits;
pub mod types;

pub use campaign::{CampaignRule, RuleTable, parse_delay};
pub use config::NudgeConfig;
pub use error::{NudgeError, Result};
pub use template::{TemplateDef, TemplateRegistry, lookup_path};
pub use traits::{Clock, Dispatcher, ManualClock, SystemClock, VariableResolver};
pub use types::{
    EmailContext, EmailPayload, Event, GenericPayload, Lifecycle, Task, TaskKind, TaskPayload,
    TaskStatus, UserState,
};
