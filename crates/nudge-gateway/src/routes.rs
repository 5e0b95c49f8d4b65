//! API route handlers for the gateway.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use chrono::{DateTime, Utc};
use nudge_core::error::{NudgeError, Result};
use nudge_core::types::{Event, GenericPayload, Task, TaskKind, TaskPayload, TaskStatus, UserState};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::sync::Arc;

use crate::server::AppState;

const DEFAULT_AUDIT_LIMIT: usize = 100;

/// Health check endpoint.
pub async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "nudge-gateway",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// System information endpoint.
pub async fn system_info(State(state): State<Arc<AppState>>) -> Json<Value> {
    let store = state.engine.store();
    Json(json!({
        "product": state.config.product.name,
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "dispatcher": state.engine.dispatcher().name(),
        "campaigns": state.engine.rules().len(),
        "users": store.user_count(),
        "events": store.event_count(),
        "gateway": {
            "host": state.config.gateway.host,
            "port": state.config.gateway.port,
        }
    }))
}

/// Wire shape of an incoming event before validation.
#[derive(Debug, Deserialize)]
struct EventBody {
    event: String,
    #[serde(default)]
    event_id: Option<String>,
    user_id: String,
    product: String,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    properties: Option<Map<String, Value>>,
}

/// Parse and validate an event body.
///
/// `event_id` must be a UUID when present; `timestamp` must be RFC 3339 and
/// defaults to now; `properties` defaults to an empty object.
pub fn parse_event(body: &str) -> Result<Event> {
    let raw: EventBody =
        serde_json::from_str(body).map_err(|e| NudgeError::InvalidEvent(e.to_string()))?;

    let mut issues = Vec::new();
    if let Some(id) = &raw.event_id
        && uuid::Uuid::parse_str(id).is_err()
    {
        issues.push(format!("event_id: '{id}' is not a valid uuid"));
    }
    let timestamp = match raw.timestamp.as_deref() {
        None => Utc::now(),
        Some(ts) => match DateTime::parse_from_rfc3339(ts) {
            Ok(parsed) => parsed.with_timezone(&Utc),
            Err(e) => {
                issues.push(format!("timestamp: '{ts}' is not an RFC 3339 datetime ({e})"));
                Utc::now()
            }
        },
    };
    if !issues.is_empty() {
        return Err(NudgeError::InvalidEvent(issues.join("; ")));
    }

    Ok(Event {
        event: raw.event,
        event_id: raw.event_id,
        user_id: raw.user_id,
        product: raw.product,
        timestamp,
        properties: raw.properties.unwrap_or_default(),
    })
}

/// Ingest an event: dedup, lifecycle check, then the decision engine.
pub async fn post_event(
    State(state): State<Arc<AppState>>,
    body: String,
) -> (StatusCode, Json<Value>) {
    let event = match parse_event(&body) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!("⚠️ Rejected event: {e}");
            let details = match e {
                NudgeError::InvalidEvent(details) => details,
                other => other.to_string(),
            };
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "Invalid event schema", "details": details})),
            );
        }
    };

    tracing::debug!("📥 Event {} for user {}", event.event, event.user_id);
    let event_id = event.event_id.clone();
    let outcome = state.engine.ingest(event).await;

    let body = match outcome.reason() {
        Some(reason) => json!({"status": "ignored", "reason": reason, "eventId": event_id}),
        None => json!({"status": "received", "eventId": event_id}),
    };
    (StatusCode::OK, Json(body))
}

/// Build a task from a manual dispatch body.
///
/// Requires non-empty `id` and `type`. A body that is not a full task is
/// wrapped as a pending generic task around its `payload` object.
fn task_from_body(body: &str) -> Option<Task> {
    let value: Value = serde_json::from_str(body).ok()?;
    let id = value.get("id")?.as_str().filter(|s| !s.is_empty())?;
    let kind = value.get("type")?.as_str().filter(|s| !s.is_empty())?;

    if let Ok(task) = serde_json::from_value::<Task>(value.clone()) {
        return Some(task);
    }

    let mut fields = value
        .get("payload")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    let user_id = fields
        .remove("userId")
        .or_else(|| value.get("userId").cloned())
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_default();

    Some(Task {
        id: id.to_string(),
        kind: TaskKind::from(kind),
        payload: TaskPayload::Generic(GenericPayload { user_id, fields }),
        status: TaskStatus::Pending,
        cancel_condition: None,
        created_at: Utc::now(),
    })
}

/// Hand a task straight to the dispatcher, bypassing the decision engine.
pub async fn dispatch_task(
    State(state): State<Arc<AppState>>,
    body: String,
) -> (StatusCode, Json<Value>) {
    let Some(task) = task_from_body(&body) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "Invalid task payload"})),
        );
    };

    match state.engine.dispatcher().dispatch(&task).await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({"status": "dispatched", "taskId": task.id})),
        ),
        Err(e) => {
            tracing::error!("❌ Manual dispatch of task {} failed: {e}", task.id);
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({"error": "Failed to dispatch task", "details": e.to_string()})),
            )
        }
    }
}

/// Current lifecycle state and tasks for a user.
pub async fn get_user(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> std::result::Result<Json<UserState>, (StatusCode, Json<Value>)> {
    state.engine.store().find_user(&user_id).map(Json).ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("User '{user_id}' not found")})),
        )
    })
}

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    pub limit: Option<usize>,
}

/// Most recent audit records, oldest first.
pub async fn list_audit(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AuditQuery>,
) -> Json<Value> {
    let entries = state.engine.audit().entries();
    let limit = query.limit.unwrap_or(DEFAULT_AUDIT_LIMIT);
    let recent = &entries[entries.len().saturating_sub(limit)..];
    Json(json!({
        "total": entries.len(),
        "entries": recent,
    }))
}
