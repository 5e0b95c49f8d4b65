//! Audit trail: one structured record per decision the engine makes.
//! Records go to `tracing` (target `nudge::audit`) and into a bounded
//! in-memory ring buffer that the gateway and tests can read back.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A decision or failure the engine reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditRecord {
    /// Event dropped before the decision engine (duplicate id or invalid transition).
    EventIgnored {
        event: String,
        event_id: Option<String>,
        user_id: String,
        reason: String,
    },
    CampaignCancelled {
        template: Option<String>,
        user_id: String,
        task_id: String,
        reason: String,
    },
    NoDecision {
        event: String,
        user_id: String,
    },
    TemplateNotFound {
        template: Option<String>,
        campaign: String,
        user_id: String,
    },
    MissingVariables {
        template: String,
        user_id: String,
        missing: Vec<String>,
        variables: serde_json::Value,
    },
    PayloadFailed {
        campaign: String,
        user_id: String,
        error: String,
    },
    EmailDispatch {
        template: String,
        user_id: String,
        status: String,
    },
    CampaignDuplicatePrevented {
        template: Option<String>,
        user_id: String,
    },
    CampaignScheduled {
        template: Option<String>,
        user_id: String,
        task_id: String,
        run_at: DateTime<Utc>,
    },
    /// Immediate dispatch decision.
    Decision {
        event: String,
        decision: String,
        campaign: String,
        rule_template: Option<String>,
        user_id: String,
        task_id: String,
    },
    CampaignExecuted {
        template: Option<String>,
        user_id: String,
        task_id: String,
    },
    DispatchFailed {
        task_id: String,
        user_id: String,
        error: String,
    },
}

impl AuditRecord {
    /// The `type` tag, e.g. "campaign_scheduled".
    pub fn kind(&self) -> &'static str {
        match self {
            AuditRecord::EventIgnored { .. } => "event_ignored",
            AuditRecord::CampaignCancelled { .. } => "campaign_cancelled",
            AuditRecord::NoDecision { .. } => "no_decision",
            AuditRecord::TemplateNotFound { .. } => "template_not_found",
            AuditRecord::MissingVariables { .. } => "missing_variables",
            AuditRecord::PayloadFailed { .. } => "payload_failed",
            AuditRecord::EmailDispatch { .. } => "email_dispatch",
            AuditRecord::CampaignDuplicatePrevented { .. } => "campaign_duplicate_prevented",
            AuditRecord::CampaignScheduled { .. } => "campaign_scheduled",
            AuditRecord::Decision { .. } => "decision",
            AuditRecord::CampaignExecuted { .. } => "campaign_executed",
            AuditRecord::DispatchFailed { .. } => "dispatch_failed",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            AuditRecord::TemplateNotFound { .. }
                | AuditRecord::MissingVariables { .. }
                | AuditRecord::PayloadFailed { .. }
                | AuditRecord::DispatchFailed { .. }
        )
    }
}

/// An audit record with the time it was written.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub record: AuditRecord,
}

/// Bounded audit log (oldest entries drop first).
pub struct AuditLog {
    capacity: usize,
    entries: Mutex<VecDeque<AuditEntry>>,
}

impl AuditLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    /// Emit a record to the log stream and keep it in the buffer.
    pub fn record(&self, record: AuditRecord) {
        let json = serde_json::to_string(&record).unwrap_or_else(|_| format!("{record:?}"));
        if record.is_error() {
            tracing::error!(target: "nudge::audit", kind = record.kind(), record = %json);
        } else {
            tracing::info!(target: "nudge::audit", kind = record.kind(), record = %json);
        }

        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.push_back(AuditEntry {
            at: Utc::now(),
            record,
        });
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    /// Buffered entries, oldest first.
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Buffered records, oldest first.
    pub fn records(&self) -> Vec<AuditRecord> {
        self.entries().into_iter().map(|e| e.record).collect()
    }

    /// Number of buffered records with the given `type` tag.
    pub fn count(&self, kind: &str) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|e| e.record.kind() == kind)
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new(1000)
    }
}
