//! Campaign rules: the read-only table mapping event names to task recipes.

use std::collections::BTreeMap;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{NudgeError, Result};
use crate::template::TemplateRegistry;
use crate::types::TaskKind;

/// One campaign rule, keyed in the [`RuleTable`] by the triggering event name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignRule {
    /// Task kind to create, e.g. "send_email".
    pub task: TaskKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    /// Delay before dispatch, e.g. "24h". Absent means dispatch immediately.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<String>,
    /// Event name that cancels the scheduled task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_if: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activation_hint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback_url: Option<String>,
    /// Any other keys, carried into generic payloads untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CampaignRule {
    /// Rule that dispatches `task` immediately with no template.
    pub fn new(task: impl Into<TaskKind>) -> Self {
        Self {
            task: task.into(),
            template: None,
            delay: None,
            cancel_if: None,
            params: None,
            feature: None,
            feature_url: None,
            activation_hint: None,
            feedback_url: None,
            extra: Map::new(),
        }
    }

    /// Templated email rule.
    pub fn email(template: &str) -> Self {
        Self::new(TaskKind::SendEmail).with_template(template)
    }

    pub fn with_template(mut self, template: &str) -> Self {
        self.template = Some(template.to_string());
        self
    }

    pub fn with_delay(mut self, delay: &str) -> Self {
        self.delay = Some(delay.to_string());
        self
    }

    pub fn with_cancel_if(mut self, event_name: &str) -> Self {
        self.cancel_if = Some(event_name.to_string());
        self
    }

    pub fn with_feature(mut self, feature: &str) -> Self {
        self.feature = Some(feature.to_string());
        self
    }

    pub fn with_param(mut self, key: &str, value: Value) -> Self {
        self.params
            .get_or_insert_with(Map::new)
            .insert(key.to_string(), value);
        self
    }

    /// Parsed delay, or `None` when the rule dispatches immediately.
    ///
    /// A present but unparseable delay is still a delay (of zero).
    pub fn delay(&self) -> Option<TimeDelta> {
        self.delay
            .as_deref()
            .filter(|d| !d.trim().is_empty())
            .map(parse_delay)
    }

    pub fn is_delayed(&self) -> bool {
        self.delay().is_some()
    }

    /// `params.campaign_id`, used to label audit records.
    pub fn campaign_id(&self) -> Option<&str> {
        self.params.as_ref()?.get("campaign_id")?.as_str()
    }

    /// Shallow copy of the rule's fields without the task kind.
    pub fn fields_without_task(&self) -> Result<Map<String, Value>> {
        let mut fields = match serde_json::to_value(self)? {
            Value::Object(map) => map,
            other => {
                return Err(NudgeError::Config(format!(
                    "campaign rule serialized to non-object: {other}"
                )));
            }
        };
        fields.remove("task");
        Ok(fields)
    }
}

/// Parse a delay string such as "24h" into a duration.
///
/// Only hours are understood: a run of digits followed by `h`. Any other
/// suffix, a missing number or an overflowing value is a zero delay.
pub fn parse_delay(delay: &str) -> TimeDelta {
    let delay = delay.trim();
    let Some(digits) = delay.strip_suffix('h') else {
        return TimeDelta::zero();
    };
    let digits = digits.trim();
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return TimeDelta::zero();
    }
    let Ok(hours) = digits.parse::<i64>() else {
        return TimeDelta::zero();
    };

    hours
        .checked_mul(60 * 60)
        .and_then(TimeDelta::try_seconds)
        .unwrap_or_else(TimeDelta::zero)
}

/// Event name → campaign rule. Loaded once, read-only afterwards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleTable(BTreeMap<String, CampaignRule>);

impl RuleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in onboarding campaigns.
    pub fn builtin() -> Self {
        let mut table = Self::new();
        table.insert("signup_completed", CampaignRule::email("welcome_v1"));
        table.insert(
            "signup_completed_delayed",
            CampaignRule::email("activation_nudge_v1")
                .with_delay("24h")
                .with_cancel_if("first_value_action"),
        );
        table.insert(
            "pricing_viewed",
            CampaignRule::email("pricing_explainer_v1")
                .with_delay("1h")
                .with_cancel_if("plan_upgraded"),
        );
        table.insert(
            "feature_used",
            CampaignRule::email("feature_discovery_1").with_feature("reports"),
        );
        table.insert(
            "subscription_cancelled",
            CampaignRule::email("churn_feedback_v1"),
        );
        table
    }

    pub fn insert(&mut self, event_name: &str, rule: CampaignRule) {
        self.0.insert(event_name.to_string(), rule);
    }

    pub fn get(&self, event_name: &str) -> Option<&CampaignRule> {
        self.0.get(event_name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &CampaignRule)> {
        self.0.iter()
    }

    /// Check the table against the template registry.
    ///
    /// A templated rule without a template name is rejected. A template name
    /// the registry doesn't know is only warned about: the engine reports it
    /// per event when the rule fires.
    pub fn validate(&self, templates: &TemplateRegistry) -> Result<()> {
        for (event_name, rule) in &self.0 {
            if !rule.task.is_templated() {
                continue;
            }
            let Some(template) = rule.template.as_deref() else {
                return Err(NudgeError::Config(format!(
                    "campaign '{event_name}' has task '{}' but no template",
                    rule.task
                )));
            };
            if templates.get(template).is_none() {
                tracing::warn!(
                    "⚠️ Campaign '{}' references unknown template '{}'",
                    event_name,
                    template
                );
            }
        }
        Ok(())
    }
}
