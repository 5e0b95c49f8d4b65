//! Task dispatch: delivers tasks to the remote executor over an HTTP webhook.

use std::time::Duration;

use async_trait::async_trait;
use nudge_core::config::DispatchConfig;
use nudge_core::error::{NudgeError, Result};
use nudge_core::traits::Dispatcher;
use nudge_core::types::Task;

/// POSTs the task JSON to a webhook (e.g. an n8n workflow).
///
/// URLs containing "mock" are simulated: the task is logged and reported
/// delivered without any network I/O.
pub struct WebhookDispatcher {
    url: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl WebhookDispatcher {
    pub fn new(url: &str, timeout: Duration) -> Self {
        Self {
            url: url.to_string(),
            timeout,
            client: reqwest::Client::new(),
        }
    }

    pub fn from_config(config: &DispatchConfig) -> Self {
        Self::new(&config.webhook_url, Duration::from_secs(config.timeout_secs))
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn is_simulated(&self) -> bool {
        self.url.contains("mock")
    }
}

#[async_trait]
impl Dispatcher for WebhookDispatcher {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn dispatch(&self, task: &Task) -> Result<()> {
        tracing::info!("📤 Dispatching task {} ({}) to {}", task.id, task.kind, self.url);

        if self.is_simulated() {
            let body = serde_json::to_string(task)?;
            tracing::info!("🧪 Simulated dispatch for task {}: {}", task.id, body);
            return Ok(());
        }

        let resp = self
            .client
            .post(&self.url)
            .json(task)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| NudgeError::Dispatch(format!("Webhook send failed: {e}")))?;

        if resp.status().is_success() {
            tracing::info!("✅ Task {} dispatched ({})", task.id, resp.status());
            Ok(())
        } else {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            Err(NudgeError::Dispatch(format!("Webhook error {status}: {body}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use nudge_core::types::{GenericPayload, TaskKind, TaskPayload, TaskStatus};

    fn task() -> Task {
        Task {
            id: "t1".into(),
            kind: TaskKind::from("crm_sync"),
            payload: TaskPayload::Generic(GenericPayload {
                user_id: "u1".into(),
                fields: Default::default(),
            }),
            status: TaskStatus::Pending,
            cancel_condition: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_mock_url_is_simulated() {
        let dispatcher = WebhookDispatcher::new("http://mock.local/hook", Duration::from_secs(1));
        assert!(dispatcher.dispatch(&task()).await.is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_webhook_is_error() {
        let dispatcher = WebhookDispatcher::new("http://127.0.0.1:9/hook", Duration::from_secs(1));
        let err = dispatcher.dispatch(&task()).await.unwrap_err();
        assert!(matches!(err, NudgeError::Dispatch(_)));
    }

    #[test]
    fn test_from_config() {
        let dispatcher = WebhookDispatcher::from_config(&DispatchConfig::default());
        assert_eq!(dispatcher.url(), "http://localhost:5678/webhook-test/gtm-task");
        assert_eq!(dispatcher.name(), "webhook");
    }
}
