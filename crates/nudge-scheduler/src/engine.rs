//! Decision engine: turns admitted events into campaign tasks.
//!
//! ## Pipeline
//! ```text
//! Event
//!   → cancel scheduled tasks whose cancel_if matches the event name
//!   → look up the campaign rule (none → no_decision)
//!   → build the payload (template + variable gate for send_email)
//!   → delayed rule? suppress if the template is already scheduled
//!   → record the task
//!   → dispatch now, or arm a timer that re-checks status when it fires
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use nudge_core::campaign::{CampaignRule, RuleTable};
use nudge_core::config::NudgeConfig;
use nudge_core::error::Result;
use nudge_core::template::{TemplateRegistry, lookup_path};
use nudge_core::traits::{Clock, Dispatcher, SystemClock, VariableResolver};
use nudge_core::types::{
    EmailContext, EmailPayload, Event, GenericPayload, Task, TaskPayload, TaskStatus,
};
use serde_json::Value;

use crate::audit::{AuditLog, AuditRecord};
use crate::dispatch::WebhookDispatcher;
use crate::store::{Admission, EventStore};
use crate::timer::{Scheduler, TimerCallback, TimerScheduler};
use crate::variables::DefaultVariableResolver;

/// What happened to an event handed to [`DecisionEngine::ingest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Received,
    Duplicate,
    InvalidTransition,
}

impl IngestOutcome {
    /// Reason string reported to callers for ignored events.
    pub fn reason(&self) -> Option<&'static str> {
        match self {
            IngestOutcome::Received => None,
            IngestOutcome::Duplicate => Some("duplicate"),
            IngestOutcome::InvalidTransition => Some("invalid_transition"),
        }
    }
}

pub struct DecisionEngine {
    store: Arc<EventStore>,
    scheduler: Arc<dyn Scheduler>,
    dispatcher: Arc<dyn Dispatcher>,
    rules: Arc<RuleTable>,
    templates: Arc<TemplateRegistry>,
    resolver: Arc<dyn VariableResolver>,
    clock: Arc<dyn Clock>,
    audit: Arc<AuditLog>,
}

impl DecisionEngine {
    /// Engine with no campaigns, the built-in templates, the default
    /// resolver and the system clock.
    pub fn new(
        store: Arc<EventStore>,
        scheduler: Arc<dyn Scheduler>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        Self {
            store,
            scheduler,
            dispatcher,
            rules: Arc::new(RuleTable::new()),
            templates: Arc::new(TemplateRegistry::builtin()),
            resolver: Arc::new(DefaultVariableResolver::default()),
            clock: Arc::new(SystemClock),
            audit: Arc::new(AuditLog::default()),
        }
    }

    /// Wire a full engine from configuration: webhook dispatch, tokio timers,
    /// wall-clock time. Must be called inside a tokio runtime.
    pub fn from_config(config: &NudgeConfig) -> Result<Self> {
        config.validate()?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let scheduler = Arc::new(TimerScheduler::new(Arc::clone(&clock)));
        let dispatcher = Arc::new(WebhookDispatcher::from_config(&config.dispatch));

        tracing::info!(
            "🧭 Decision engine ready: {} campaigns, {} templates, dispatch → {}",
            config.campaigns.len(),
            config.templates.len(),
            dispatcher.url()
        );

        Ok(Self::new(Arc::new(EventStore::new()), scheduler, dispatcher)
            .with_rules(config.campaigns.clone())
            .with_templates(config.templates.clone())
            .with_resolver(Arc::new(DefaultVariableResolver::new(
                config.product.clone(),
                config.links.clone(),
            )))
            .with_clock(clock)
            .with_audit(Arc::new(AuditLog::new(config.audit.capacity))))
    }

    pub fn with_rules(mut self, rules: RuleTable) -> Self {
        self.rules = Arc::new(rules);
        self
    }

    pub fn with_templates(mut self, templates: TemplateRegistry) -> Self {
        self.templates = Arc::new(templates);
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn VariableResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = audit;
        self
    }

    pub fn store(&self) -> &Arc<EventStore> {
        &self.store
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    pub fn dispatcher(&self) -> &Arc<dyn Dispatcher> {
        &self.dispatcher
    }

    pub fn rules(&self) -> &RuleTable {
        &self.rules
    }

    /// Admit an event (dedup + lifecycle) and, if accepted, process it.
    pub async fn ingest(&self, event: Event) -> IngestOutcome {
        let outcome = match self.store.admit(&event) {
            Admission::Accepted => IngestOutcome::Received,
            Admission::Duplicate => IngestOutcome::Duplicate,
            Admission::InvalidTransition => IngestOutcome::InvalidTransition,
        };

        if let Some(reason) = outcome.reason() {
            self.audit.record(AuditRecord::EventIgnored {
                event: event.event.clone(),
                event_id: event.event_id.clone(),
                user_id: event.user_id.clone(),
                reason: reason.to_string(),
            });
            return outcome;
        }

        self.process_event(&event).await;
        outcome
    }

    /// Run the decision pipeline for an event that already passed admission.
    pub async fn process_event(&self, event: &Event) {
        self.cancel_matching(event);

        let Some(rule) = self.rules.get(&event.event) else {
            self.audit.record(AuditRecord::NoDecision {
                event: event.event.clone(),
                user_id: event.user_id.clone(),
            });
            return;
        };

        let Some(payload) = self.build_payload(event, rule).await else {
            return;
        };

        let run_at = match rule.delay() {
            None => None,
            Some(delay) => match self.clock.now().checked_add_signed(delay) {
                Some(run_at) => Some(run_at),
                None => {
                    self.audit.record(AuditRecord::PayloadFailed {
                        campaign: event.event.clone(),
                        user_id: event.user_id.clone(),
                        error: format!(
                            "delay '{}' is out of range",
                            rule.delay.as_deref().unwrap_or_default()
                        ),
                    });
                    return;
                }
            },
        };

        let Some(task) = self.record_task(event, rule, payload, run_at.is_some()) else {
            return;
        };

        match run_at {
            None => self.dispatch_now(event, rule, task).await,
            Some(run_at) => self.schedule(event, rule, task, run_at),
        }
    }

    /// Cancel the user's scheduled tasks whose cancel condition is this event.
    fn cancel_matching(&self, event: &Event) {
        let cancelled: Vec<(String, Option<String>)> =
            self.store.with_user_mut(&event.user_id, |state| {
                state
                    .tasks
                    .iter_mut()
                    .filter(|t| {
                        t.status == TaskStatus::Scheduled
                            && t.cancel_condition.as_deref() == Some(event.event.as_str())
                    })
                    .map(|t| {
                        t.status = TaskStatus::Cancelled;
                        (t.id.clone(), t.template().map(String::from))
                    })
                    .collect()
            });

        for (task_id, template) in cancelled {
            self.scheduler.cancel(&task_id);
            self.audit.record(AuditRecord::CampaignCancelled {
                template,
                user_id: event.user_id.clone(),
                task_id,
                reason: event.event.clone(),
            });
        }
    }

    /// Build the task payload, or report why none can be built.
    async fn build_payload(&self, event: &Event, rule: &CampaignRule) -> Option<TaskPayload> {
        if !rule.task.is_templated() {
            return match rule.fields_without_task() {
                Ok(fields) => Some(TaskPayload::Generic(GenericPayload {
                    user_id: event.user_id.clone(),
                    fields,
                })),
                Err(e) => {
                    self.audit.record(AuditRecord::PayloadFailed {
                        campaign: event.event.clone(),
                        user_id: event.user_id.clone(),
                        error: e.to_string(),
                    });
                    None
                }
            };
        }

        let Some((template, def)) = rule
            .template
            .as_deref()
            .and_then(|name| self.templates.get(name).map(|def| (name, def)))
        else {
            self.audit.record(AuditRecord::TemplateNotFound {
                template: rule.template.clone(),
                campaign: event.event.clone(),
                user_id: event.user_id.clone(),
            });
            return None;
        };

        let variables = match self.resolver.resolve(event, rule).await {
            Ok(variables) => variables,
            Err(e) => {
                self.audit.record(AuditRecord::PayloadFailed {
                    campaign: event.event.clone(),
                    user_id: event.user_id.clone(),
                    error: e.to_string(),
                });
                return None;
            }
        };

        let missing = def.missing_variables(&variables);
        if !missing.is_empty() {
            self.audit.record(AuditRecord::MissingVariables {
                template: template.to_string(),
                user_id: event.user_id.clone(),
                missing,
                variables: Value::Object(variables),
            });
            return None;
        }

        let to = lookup_path(&variables, "user.email")
            .and_then(Value::as_str)
            .map(String::from);
        let product = lookup_path(&variables, "product.name")
            .and_then(Value::as_str)
            .map(String::from)
            .unwrap_or_else(|| event.product.clone());

        self.audit.record(AuditRecord::EmailDispatch {
            template: template.to_string(),
            user_id: event.user_id.clone(),
            status: "validated".to_string(),
        });

        Some(TaskPayload::Email(EmailPayload {
            task: rule.task.to_string(),
            template: template.to_string(),
            to,
            variables,
            context: EmailContext {
                event: event.event.clone(),
                user_id: event.user_id.clone(),
                product,
            },
        }))
    }

    /// Append the new task to the user's list.
    ///
    /// For delayed rules the duplicate check and the append happen under one
    /// store lock, so two racing events can't both schedule the template.
    fn record_task(
        &self,
        event: &Event,
        rule: &CampaignRule,
        payload: TaskPayload,
        delayed: bool,
    ) -> Option<Task> {
        let template = rule.template.as_deref();
        let task = self.store.with_user_mut(&event.user_id, |state| {
            let duplicate = delayed
                && state
                    .tasks
                    .iter()
                    .any(|t| t.status == TaskStatus::Scheduled && t.template() == template);
            if duplicate {
                return None;
            }

            let task = Task {
                id: uuid::Uuid::new_v4().to_string(),
                kind: rule.task.clone(),
                payload,
                status: if delayed {
                    TaskStatus::Scheduled
                } else {
                    TaskStatus::Pending
                },
                cancel_condition: rule.cancel_if.clone(),
                created_at: self.clock.now(),
            };
            state.tasks.push(task.clone());
            Some(task)
        });

        if task.is_none() {
            self.audit.record(AuditRecord::CampaignDuplicatePrevented {
                template: rule.template.clone(),
                user_id: event.user_id.clone(),
            });
        }
        task
    }

    /// Immediate dispatch. The task stays `pending` whatever the outcome.
    async fn dispatch_now(&self, event: &Event, rule: &CampaignRule, task: Task) {
        if let Err(e) = self.dispatcher.dispatch(&task).await {
            self.audit.record(AuditRecord::DispatchFailed {
                task_id: task.id.clone(),
                user_id: event.user_id.clone(),
                error: e.to_string(),
            });
        }

        self.audit.record(AuditRecord::Decision {
            event: event.event.clone(),
            decision: rule.task.to_string(),
            campaign: rule.campaign_id().unwrap_or(event.event.as_str()).to_string(),
            rule_template: rule.template.clone(),
            user_id: event.user_id.clone(),
            task_id: task.id,
        });
    }

    /// Arm the timer for a freshly recorded task.
    ///
    /// A cancelling event handled between recording and arming finds no timer
    /// to cancel, so the status is re-checked once the timer is armed.
    fn schedule(&self, event: &Event, rule: &CampaignRule, task: Task, run_at: DateTime<Utc>) {
        self.audit.record(AuditRecord::CampaignScheduled {
            template: rule.template.clone(),
            user_id: event.user_id.clone(),
            task_id: task.id.clone(),
            run_at,
        });

        let callback = self.fire_callback(event.user_id.clone(), task.id.clone(), rule.template.clone());
        self.scheduler.schedule(&task.id, run_at, callback);

        let still_scheduled = self
            .store
            .find_task(&event.user_id, &task.id)
            .is_some_and(|t| t.status == TaskStatus::Scheduled);
        if !still_scheduled {
            self.scheduler.cancel(&task.id);
            tracing::debug!("⏭️ Task {} cancelled while arming, timer dropped", task.id);
        }
    }

    fn fire_callback(
        &self,
        user_id: String,
        task_id: String,
        template: Option<String>,
    ) -> TimerCallback {
        let store = Arc::clone(&self.store);
        let dispatcher = Arc::clone(&self.dispatcher);
        let audit = Arc::clone(&self.audit);
        Box::new(move || -> BoxFuture<'static, ()> {
            Box::pin(async move {
                fire_scheduled(&store, dispatcher.as_ref(), &audit, &user_id, &task_id, template)
                    .await;
            })
        })
    }
}

/// Timer body: dispatch the task if it is still scheduled.
///
/// The task is claimed (moved to `dispatched`) under the store lock before
/// the dispatch call, so a cancelling event arriving mid-dispatch is a no-op.
async fn fire_scheduled(
    store: &EventStore,
    dispatcher: &dyn Dispatcher,
    audit: &AuditLog,
    user_id: &str,
    task_id: &str,
    template: Option<String>,
) {
    let claimed = store.with_user_mut(user_id, |state| {
        let task = state.task_mut(task_id)?;
        if task.status != TaskStatus::Scheduled {
            return None;
        }
        let snapshot = task.clone();
        task.status = TaskStatus::Dispatched;
        Some(snapshot)
    });

    let Some(task) = claimed else {
        tracing::debug!("⏭️ Task {} is no longer scheduled, skipping", task_id);
        return;
    };

    if let Err(e) = dispatcher.dispatch(&task).await {
        audit.record(AuditRecord::DispatchFailed {
            task_id: task.id.clone(),
            user_id: user_id.to_string(),
            error: e.to_string(),
        });
    }

    audit.record(AuditRecord::CampaignExecuted {
        template,
        user_id: user_id.to_string(),
        task_id: task.id,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use nudge_core::error::NudgeError;
    use nudge_core::template::TemplateDef;
    use nudge_core::traits::ManualClock;
    use nudge_core::types::Lifecycle;
    use serde_json::{Map, json};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingDispatcher {
        sent: Mutex<Vec<Task>>,
        fail: bool,
    }

    impl RecordingDispatcher {
        fn failing() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                fail: true,
            }
        }

        fn sent(&self) -> Vec<Task> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Dispatcher for RecordingDispatcher {
        fn name(&self) -> &str {
            "recording"
        }

        async fn dispatch(&self, task: &Task) -> Result<()> {
            self.sent.lock().unwrap().push(task.clone());
            if self.fail {
                Err(NudgeError::Dispatch("executor unavailable".into()))
            } else {
                Ok(())
            }
        }
    }

    struct FailingResolver;

    #[async_trait]
    impl VariableResolver for FailingResolver {
        async fn resolve(&self, _event: &Event, _rule: &CampaignRule) -> Result<Map<String, Value>> {
            Err(NudgeError::Resolver("profile service down".into()))
        }
    }

    struct Harness {
        engine: DecisionEngine,
        dispatcher: Arc<RecordingDispatcher>,
        scheduler: Arc<TimerScheduler>,
    }

    impl Harness {
        fn new(rules: RuleTable) -> Self {
            Self::with_dispatcher(rules, RecordingDispatcher::default())
        }

        fn with_dispatcher(rules: RuleTable, dispatcher: RecordingDispatcher) -> Self {
            let clock = Arc::new(ManualClock::new(Utc::now()));
            let scheduler = Arc::new(TimerScheduler::new(clock.clone()));
            let dispatcher = Arc::new(dispatcher);
            let engine = DecisionEngine::new(
                Arc::new(EventStore::new()),
                scheduler.clone(),
                dispatcher.clone(),
            )
            .with_rules(rules)
            .with_clock(clock);
            Self {
                engine,
                dispatcher,
                scheduler,
            }
        }

        fn tasks(&self, user_id: &str) -> Vec<Task> {
            self.engine.store().user_state(user_id).tasks
        }

        fn audit_count(&self, kind: &str) -> usize {
            self.engine.audit().count(kind)
        }
    }

    fn event(name: &str, id: &str) -> Event {
        Event::new(name, "u1", "gtm-core").with_id(id)
    }

    fn nudge_rules() -> RuleTable {
        let mut rules = RuleTable::new();
        rules.insert(
            "signup_completed",
            CampaignRule::email("activation_nudge_v1")
                .with_delay("24h")
                .with_cancel_if("activated"),
        );
        rules
    }

    async fn hours(n: u64) {
        tokio::time::sleep(Duration::from_secs(n * 3600)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_signup_duplicate_then_activation_cancels_nudge() {
        let h = Harness::new(nudge_rules());

        assert_eq!(h.engine.ingest(event("signup_completed", "e1")).await, IngestOutcome::Received);
        let state = h.engine.store().user_state("u1");
        assert_eq!(state.status, Lifecycle::SignedUp);
        assert_eq!(state.tasks.len(), 1);
        let task = state.tasks[0].clone();
        assert_eq!(task.status, TaskStatus::Scheduled);
        assert_eq!(task.template(), Some("activation_nudge_v1"));
        assert!(h.scheduler.is_armed(&task.id));

        assert_eq!(h.engine.ingest(event("signup_completed", "e1")).await, IngestOutcome::Duplicate);
        assert_eq!(h.tasks("u1").len(), 1);
        assert_eq!(h.engine.store().event_count(), 1);

        assert_eq!(h.engine.ingest(event("activated", "e2")).await, IngestOutcome::Received);
        let state = h.engine.store().user_state("u1");
        assert_eq!(state.status, Lifecycle::Activated);
        assert_eq!(state.tasks[0].status, TaskStatus::Cancelled);
        assert!(!h.scheduler.is_armed(&task.id));
        assert_eq!(h.audit_count("campaign_cancelled"), 1);

        hours(25).await;
        assert!(h.dispatcher.sent().is_empty());
        assert_eq!(h.tasks("u1")[0].status, TaskStatus::Cancelled);
        assert_eq!(h.audit_count("campaign_executed"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_task_fires_and_dispatches() {
        let h = Harness::new(nudge_rules());
        h.engine.ingest(event("signup_completed", "e1")).await;
        assert_eq!(h.audit_count("campaign_scheduled"), 1);

        hours(23).await;
        assert!(h.dispatcher.sent().is_empty());

        hours(2).await;
        let sent = h.dispatcher.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(h.tasks("u1")[0].status, TaskStatus::Dispatched);
        assert_eq!(h.audit_count("campaign_executed"), 1);
        match &sent[0].payload {
            TaskPayload::Email(email) => {
                assert_eq!(email.template, "activation_nudge_v1");
                assert_eq!(email.to.as_deref(), Some("user_u1@example.com"));
                assert_eq!(email.context.event, "signup_completed");
                assert_eq!(email.context.product, "GTM Core Product");
            }
            other => panic!("expected email payload, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_fire_is_noop() {
        let h = Harness::new(nudge_rules());
        h.engine.ingest(event("signup_completed", "e1")).await;
        hours(25).await;
        assert_eq!(h.dispatcher.sent().len(), 1);

        h.engine.ingest(event("activated", "e2")).await;
        assert_eq!(h.tasks("u1")[0].status, TaskStatus::Dispatched);
        assert_eq!(h.audit_count("campaign_cancelled"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_delayed_campaign_suppressed() {
        let mut rules = RuleTable::new();
        rules.insert(
            "signup_completed_delayed",
            CampaignRule::email("activation_nudge_v1")
                .with_delay("24h")
                .with_cancel_if("first_value_action"),
        );
        let h = Harness::new(rules);

        h.engine.ingest(event("signup_completed_delayed", "e1")).await;
        h.engine.ingest(event("signup_completed_delayed", "e2")).await;
        assert_eq!(h.tasks("u1").len(), 1);
        assert_eq!(h.scheduler.armed_count(), 1);
        assert_eq!(h.audit_count("campaign_duplicate_prevented"), 1);

        // Once the first one has fired, the campaign can be scheduled again.
        hours(25).await;
        h.engine.ingest(event("signup_completed_delayed", "e3")).await;
        let tasks = h.tasks("u1");
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].status, TaskStatus::Dispatched);
        assert_eq!(tasks[1].status, TaskStatus::Scheduled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_dispatch_leaves_task_pending() {
        let mut rules = RuleTable::new();
        rules.insert(
            "signup_completed",
            CampaignRule::email("welcome_v1").with_param("campaign_id", json!("welcome-2024")),
        );
        let h = Harness::new(rules);

        h.engine
            .ingest(event("signup_completed", "e1").with_property("email", json!("ada@example.com")))
            .await;

        let sent = h.dispatcher.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].status, TaskStatus::Pending);
        let tasks = h.tasks("u1");
        assert_eq!(tasks[0].status, TaskStatus::Pending);
        assert!(tasks[0].cancel_condition.is_none());
        assert_eq!(h.scheduler.armed_count(), 0);
        assert_eq!(h.audit_count("email_dispatch"), 1);

        let decision = h
            .engine
            .audit()
            .records()
            .into_iter()
            .find(|r| r.kind() == "decision")
            .unwrap();
        match decision {
            AuditRecord::Decision { campaign, decision, rule_template, .. } => {
                assert_eq!(campaign, "welcome-2024");
                assert_eq!(decision, "send_email");
                assert_eq!(rule_template.as_deref(), Some("welcome_v1"));
            }
            other => panic!("unexpected record {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_rules_are_not_deduplicated() {
        let mut rules = RuleTable::new();
        rules.insert("feature_used", CampaignRule::email("feature_discovery_1"));
        let h = Harness::new(rules);

        h.engine.ingest(event("feature_used", "e1")).await;
        h.engine.ingest(event("feature_used", "e2")).await;
        assert_eq!(h.tasks("u1").len(), 2);
        assert_eq!(h.dispatcher.sent().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_rule_records_no_decision() {
        let h = Harness::new(nudge_rules());
        h.engine.ingest(event("page_viewed", "e1")).await;
        assert!(h.tasks("u1").is_empty());
        assert_eq!(h.audit_count("no_decision"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_template_aborts() {
        let mut rules = RuleTable::new();
        rules.insert("signup_completed", CampaignRule::email("does_not_exist"));
        let h = Harness::new(rules);

        h.engine.ingest(event("signup_completed", "e1")).await;
        assert!(h.tasks("u1").is_empty());
        assert!(h.dispatcher.sent().is_empty());
        assert_eq!(h.audit_count("template_not_found"), 1);
        // The lifecycle transition itself still happened.
        assert_eq!(h.engine.store().user_state("u1").status, Lifecycle::SignedUp);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_variable_gate() {
        let mut templates = TemplateRegistry::new();
        templates.insert("sms_v1", TemplateDef::new(&["user.email", "user.phone"]));
        let mut rules = RuleTable::new();
        rules.insert("signup_completed", CampaignRule::email("sms_v1").with_delay("1h"));
        let h = Harness::new(rules);
        let engine = h.engine.with_templates(templates);

        engine.ingest(event("signup_completed", "e1")).await;
        assert!(engine.store().user_state("u1").tasks.is_empty());
        assert!(h.dispatcher.sent().is_empty());
        assert_eq!(h.scheduler.armed_count(), 0);

        let record = engine.audit().records().into_iter().find(|r| r.is_error()).unwrap();
        match record {
            AuditRecord::MissingVariables { template, missing, .. } => {
                assert_eq!(template, "sms_v1");
                assert_eq!(missing, vec!["user.phone"]);
            }
            other => panic!("unexpected record {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolver_failure_aborts() {
        let mut rules = RuleTable::new();
        rules.insert("signup_completed", CampaignRule::email("welcome_v1"));
        let h = Harness::new(rules);
        let engine = h.engine.with_resolver(Arc::new(FailingResolver));

        engine.ingest(event("signup_completed", "e1")).await;
        assert!(engine.store().user_state("u1").tasks.is_empty());
        assert!(h.dispatcher.sent().is_empty());
        assert_eq!(engine.audit().count("payload_failed"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_generic_task_payload() {
        let mut rule = CampaignRule::new("crm_sync");
        rule.extra.insert("pipeline".into(), json!("trials"));
        let mut rules = RuleTable::new();
        rules.insert("trial_started", rule);
        let h = Harness::new(rules);

        h.engine.ingest(event("trial_started", "e1")).await;
        let sent = h.dispatcher.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind.as_str(), "crm_sync");
        let json = serde_json::to_value(&sent[0].payload).unwrap();
        assert_eq!(json, json!({"userId": "u1", "pipeline": "trials"}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_failure_is_swallowed() {
        let mut rules = RuleTable::new();
        rules.insert("signup_completed", CampaignRule::email("welcome_v1"));
        let h = Harness::with_dispatcher(rules, RecordingDispatcher::failing());

        assert_eq!(h.engine.ingest(event("signup_completed", "e1")).await, IngestOutcome::Received);
        assert_eq!(h.tasks("u1")[0].status, TaskStatus::Pending);
        assert_eq!(h.audit_count("dispatch_failed"), 1);
        assert_eq!(h.audit_count("decision"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_delayed_dispatch_keeps_dispatched_status() {
        let h = Harness::with_dispatcher(nudge_rules(), RecordingDispatcher::failing());
        h.engine.ingest(event("signup_completed", "e1")).await;
        hours(25).await;
        assert_eq!(h.tasks("u1")[0].status, TaskStatus::Dispatched);
        assert_eq!(h.audit_count("dispatch_failed"), 1);
        assert_eq!(h.audit_count("campaign_executed"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_transition_skips_engine() {
        let h = Harness::new(nudge_rules());
        let outcome = h.engine.ingest(event("activated", "e1")).await;
        assert_eq!(outcome, IngestOutcome::InvalidTransition);
        assert_eq!(outcome.reason(), Some("invalid_transition"));
        assert_eq!(h.engine.store().event_count(), 0);
        assert!(!h.engine.store().has_processed("e1"));
        assert_eq!(h.audit_count("no_decision"), 0);
        assert_eq!(h.audit_count("event_ignored"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_can_cancel_and_trigger() {
        let mut rules = RuleTable::new();
        rules.insert(
            "trial_started",
            CampaignRule::email("pricing_explainer_v1")
                .with_delay("1h")
                .with_cancel_if("plan_upgraded"),
        );
        rules.insert("plan_upgraded", CampaignRule::email("welcome_v1"));
        let h = Harness::new(rules);

        h.engine.ingest(event("trial_started", "e1")).await;
        h.engine.ingest(event("plan_upgraded", "e2")).await;

        let tasks = h.tasks("u1");
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].status, TaskStatus::Cancelled);
        assert_eq!(tasks[1].status, TaskStatus::Pending);
        assert_eq!(tasks[1].template(), Some("welcome_v1"));

        hours(2).await;
        let sent = h.dispatcher.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].template(), Some("welcome_v1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unparseable_delay_fires_immediately() {
        let mut rules = RuleTable::new();
        rules.insert("trial_started", CampaignRule::email("pricing_explainer_v1").with_delay("soon"));
        let h = Harness::new(rules);

        h.engine.ingest(event("trial_started", "e1")).await;
        assert_eq!(h.tasks("u1")[0].status, TaskStatus::Scheduled);

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(h.tasks("u1")[0].status, TaskStatus::Dispatched);
        assert_eq!(h.dispatcher.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_users_are_isolated() {
        let h = Harness::new(nudge_rules());
        h.engine
            .ingest(Event::new("signup_completed", "u1", "gtm-core").with_id("e1"))
            .await;
        h.engine
            .ingest(Event::new("signup_completed", "u2", "gtm-core").with_id("e2"))
            .await;
        assert_eq!(h.scheduler.armed_count(), 2);

        h.engine
            .ingest(Event::new("activated", "u1", "gtm-core").with_id("e3"))
            .await;
        hours(25).await;

        assert_eq!(h.tasks("u1")[0].status, TaskStatus::Cancelled);
        assert_eq!(h.tasks("u2")[0].status, TaskStatus::Dispatched);
        assert_eq!(h.dispatcher.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_range_delay_aborts_without_task() {
        let mut rules = RuleTable::new();
        rules.insert(
            "trial_started",
            CampaignRule::email("pricing_explainer_v1").with_delay("99999999999h"),
        );
        let h = Harness::new(rules);

        let outcome = h.engine.ingest(event("trial_started", "e1")).await;
        assert_eq!(outcome, IngestOutcome::Received);
        assert!(h.tasks("u1").is_empty());
        assert_eq!(h.scheduler.armed_count(), 0);
        assert_eq!(h.audit_count("payload_failed"), 1);
        assert_eq!(h.audit_count("campaign_scheduled"), 0);
    }

    /// Marks the task cancelled just before arming, as a concurrent
    /// cancelling event would.
    struct CancelOnArm {
        inner: Arc<TimerScheduler>,
        store: Arc<EventStore>,
    }

    impl Scheduler for CancelOnArm {
        fn schedule(&self, task_id: &str, run_at: DateTime<Utc>, callback: TimerCallback) {
            self.store.with_user_mut("u1", |state| {
                if let Some(task) = state.task_mut(task_id) {
                    task.status = TaskStatus::Cancelled;
                }
            });
            self.inner.schedule(task_id, run_at, callback);
        }

        fn cancel(&self, task_id: &str) {
            self.inner.cancel(task_id);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_arming_leaves_no_timer() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let timers = Arc::new(TimerScheduler::new(clock.clone()));
        let store = Arc::new(EventStore::new());
        let scheduler = Arc::new(CancelOnArm {
            inner: timers.clone(),
            store: store.clone(),
        });
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let engine = DecisionEngine::new(store, scheduler, dispatcher.clone())
            .with_rules(nudge_rules())
            .with_clock(clock);

        engine.ingest(event("signup_completed", "e1")).await;
        let tasks = engine.store().user_state("u1").tasks;
        assert_eq!(tasks[0].status, TaskStatus::Cancelled);
        assert!(!timers.is_armed(&tasks[0].id));
        assert_eq!(timers.armed_count(), 0);

        hours(25).await;
        assert!(dispatcher.sent().is_empty());
    }
}
