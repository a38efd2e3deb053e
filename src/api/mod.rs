//! HTTP handlers for health, stats, metrics and inbound sends.

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::error::EngineError;
use crate::metrics::encode_metrics;
use crate::notification::{NotificationPayload, NotificationRequest, Priority, SendResult};
use crate::server::AppState;

pub async fn health(State(state): State<AppState>) -> Response {
    let report = state.engine.health().await;
    let status = if report.status == "healthy" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report)).into_response()
}

pub async fn stats(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.engine.snapshot();
    let queue = state.engine.queue_stats().await;
    Json(json!({
        "metrics": snapshot,
        "queue": queue,
    }))
}

pub async fn metrics() -> Result<Response, EngineError> {
    let body = encode_metrics().map_err(|e| EngineError::Internal(e.to_string()))?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub user_id: String,
    pub title: String,
    pub body: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub icon: Option<String>,
    pub tag: Option<String>,
    pub entity_id: Option<String>,
    #[serde(default)]
    pub data: Map<String, Value>,
    pub priority: Option<Priority>,
    pub batchable: Option<bool>,
    pub dedup_key: Option<String>,
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(default)]
    pub bypass_rate_limit: bool,
}

impl SendRequest {
    fn into_request(self) -> Result<NotificationRequest, EngineError> {
        if self.user_id.trim().is_empty() {
            return Err(EngineError::Validation("userId must not be empty".into()));
        }
        if self.title.trim().is_empty() {
            return Err(EngineError::Validation("title must not be empty".into()));
        }

        let mut payload = NotificationPayload::new(self.kind, self.title, self.body);
        payload.icon = self.icon;
        payload.tag = self.tag;
        payload.entity_id = self.entity_id;
        payload.data = self.data;

        let mut builder = NotificationRequest::builder(self.user_id, payload)
            .bypass_rate_limit(self.bypass_rate_limit);
        if let Some(priority) = self.priority {
            builder = builder.priority(priority);
        }
        if let Some(batchable) = self.batchable {
            builder = builder.batchable(batchable);
        }
        if let Some(key) = self.dedup_key {
            builder = builder.dedup_key(key);
        }
        if let Some(at) = self.scheduled_for {
            builder = builder.scheduled_for(at);
        }
        Ok(builder.build())
    }
}

pub async fn send_notification(
    State(state): State<AppState>,
    Json(body): Json<SendRequest>,
) -> Result<Json<SendResult>, EngineError> {
    let request = body.into_request()?;
    let result = state.engine.send(request).await?;
    Ok(Json(result))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_request_validation() {
        let req = SendRequest {
            user_id: "  ".to_string(),
            title: "t".to_string(),
            body: "b".to_string(),
            kind: "TASK_DEADLINE".to_string(),
            icon: None,
            tag: None,
            entity_id: None,
            data: Map::new(),
            priority: None,
            batchable: None,
            dedup_key: None,
            scheduled_for: None,
            bypass_rate_limit: false,
        };
        assert!(matches!(
            req.into_request(),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn test_send_request_deserializes_camel_case() {
        let json = r#"{
            "userId": "u1",
            "title": "Report due",
            "body": "Due in an hour",
            "type": "TASK_DEADLINE",
            "dedupKey": "task-1",
            "priority": "HIGH"
        }"#;
        let req: SendRequest = serde_json::from_str(json).unwrap();
        let request = req.into_request().unwrap();
        assert_eq!(request.user_id, "u1");
        assert_eq!(request.payload.kind, "TASK_DEADLINE");
        assert_eq!(request.priority, Priority::High);
        assert_eq!(request.dedup_key.as_deref(), Some("task-1"));
        assert!(!request.batchable);
    }
}
