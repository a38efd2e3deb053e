use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::classifier;

/// Notification priority levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Priority {
    /// Weight used for ordering when draining mixed partitions
    pub fn as_weight(&self) -> u8 {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
            Priority::Critical => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "LOW",
            Priority::Normal => "NORMAL",
            Priority::High => "HIGH",
            Priority::Critical => "CRITICAL",
        }
    }
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.as_weight().cmp(&other.as_weight())
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// An action button attached to a notification
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationAction {
    pub action: String,
    pub title: String,
}

/// The renderable content of a notification
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPayload {
    pub title: String,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    /// Tag used by the client to coalesce or replace displayed notifications
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<NotificationAction>,
    /// Domain kind, e.g. "TASK_DEADLINE" or "SECURITY_ALERT"
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub require_interaction: bool,
}

impl NotificationPayload {
    pub fn new(kind: impl Into<String>, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            icon: None,
            tag: None,
            actions: Vec::new(),
            kind: kind.into(),
            entity_id: None,
            data: Map::new(),
            require_interaction: false,
        }
    }
}

/// A request to deliver one notification to one user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub user_id: String,
    pub payload: NotificationPayload,
    pub priority: Priority,
    /// Whether the engine may fold this item into a summary batch
    pub batchable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dedup_key: Option<String>,
    /// Earliest time the item may be dispatched
    pub scheduled_for: DateTime<Utc>,
    #[serde(default)]
    pub bypass_rate_limit: bool,
}

impl NotificationRequest {
    pub fn builder(user_id: impl Into<String>, payload: NotificationPayload) -> RequestBuilder {
        RequestBuilder {
            user_id: user_id.into(),
            payload,
            priority: None,
            batchable: None,
            dedup_key: None,
            scheduled_for: None,
            bypass_rate_limit: false,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_for <= now
    }
}

/// Builder applying the classification and batchability defaults
pub struct RequestBuilder {
    user_id: String,
    payload: NotificationPayload,
    priority: Option<Priority>,
    batchable: Option<bool>,
    dedup_key: Option<String>,
    scheduled_for: Option<DateTime<Utc>>,
    bypass_rate_limit: bool,
}

impl RequestBuilder {
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn batchable(mut self, batchable: bool) -> Self {
        self.batchable = Some(batchable);
        self
    }

    pub fn dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }

    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    pub fn bypass_rate_limit(mut self, bypass: bool) -> Self {
        self.bypass_rate_limit = bypass;
        self
    }

    pub fn build(self) -> NotificationRequest {
        let priority = self
            .priority
            .unwrap_or_else(|| classifier::classify(&self.payload, None));
        let batchable = self
            .batchable
            .unwrap_or(!matches!(priority, Priority::Critical | Priority::High));
        NotificationRequest {
            user_id: self.user_id,
            payload: self.payload,
            priority,
            batchable,
            dedup_key: self.dedup_key,
            scheduled_for: self.scheduled_for.unwrap_or_else(Utc::now),
            bypass_rate_limit: self.bypass_rate_limit,
        }
    }
}

/// Lifecycle state of a queued item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ItemStatus {
    Pending,
    Success,
    Failed,
}

/// A notification waiting in the queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: Uuid,
    pub request: NotificationRequest,
    pub created_at: DateTime<Utc>,
    /// Number of failed dispatch attempts so far
    pub attempts: u32,
    pub status: ItemStatus,
}

impl QueueItem {
    pub fn new(request: NotificationRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            request,
            created_at: Utc::now(),
            attempts: 0,
            status: ItemStatus::Pending,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.request.is_due(now)
    }

    pub fn user_id(&self) -> &str {
        &self.request.user_id
    }

    pub fn priority(&self) -> Priority {
        self.request.priority
    }

    pub fn mark_delivered(&mut self) {
        self.status = ItemStatus::Success;
    }

    pub fn mark_failed(&mut self) {
        self.status = ItemStatus::Failed;
    }
}

/// A composed group of items delivered as one payload
#[derive(Debug, Clone)]
pub struct Batch {
    pub id: Uuid,
    pub user_id: String,
    pub kind: String,
    pub priority: Priority,
    /// Summarised payload covering every member item
    pub payload: NotificationPayload,
    pub items: Vec<QueueItem>,
    pub created_at: DateTime<Utc>,
}

impl Batch {
    pub fn size(&self) -> usize {
        self.items.len()
    }
}

/// Outcome returned to the caller of a send
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendResult {
    pub sent: bool,
    pub queued: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SendResult {
    pub fn sent(item_id: Uuid) -> Self {
        Self {
            sent: true,
            queued: false,
            item_id: Some(item_id),
            batch_id: None,
            error: None,
        }
    }

    pub fn queued(item_id: Uuid) -> Self {
        Self {
            sent: false,
            queued: true,
            item_id: Some(item_id),
            batch_id: None,
            error: None,
        }
    }

    pub fn queued_with_error(item_id: Uuid, error: impl Into<String>) -> Self {
        Self {
            sent: false,
            queued: true,
            item_id: Some(item_id),
            batch_id: None,
            error: Some(error.into()),
        }
    }

    pub fn suppressed(error: impl Into<String>) -> Self {
        Self {
            sent: false,
            queued: false,
            item_id: None,
            batch_id: None,
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }

    #[test]
    fn test_priority_serde_uppercase() {
        let json = serde_json::to_string(&Priority::Critical).unwrap();
        assert_eq!(json, "\"CRITICAL\"");
        let back: Priority = serde_json::from_str("\"HIGH\"").unwrap();
        assert_eq!(back, Priority::High);
    }

    #[test]
    fn test_builder_defaults() {
        let payload = NotificationPayload::new("TASK_DEADLINE", "Report", "Due in 1h");
        let request = NotificationRequest::builder("user-1", payload).build();
        assert_eq!(request.priority, Priority::Normal);
        assert!(request.batchable);
        assert!(request.dedup_key.is_none());
        assert!(!request.bypass_rate_limit);
    }

    #[test]
    fn test_builder_high_priority_not_batchable() {
        let payload = NotificationPayload::new("SECURITY_ALERT", "Login", "New device");
        let request = NotificationRequest::builder("user-1", payload).build();
        assert_eq!(request.priority, Priority::Critical);
        assert!(!request.batchable);
    }

    #[test]
    fn test_explicit_batchable_wins_over_default() {
        let payload = NotificationPayload::new("TASK_OVERDUE", "Report", "Overdue");
        let request = NotificationRequest::builder("user-1", payload)
            .batchable(true)
            .build();
        assert_eq!(request.priority, Priority::High);
        assert!(request.batchable);
    }

    #[test]
    fn test_queue_item_due() {
        let payload = NotificationPayload::new("TASK_DEADLINE", "t", "b");
        let request = NotificationRequest::builder("user-1", payload)
            .scheduled_for(Utc::now() + chrono::Duration::hours(1))
            .build();
        let item = QueueItem::new(request);
        assert!(!item.is_due(Utc::now()));
        assert!(item.is_due(Utc::now() + chrono::Duration::hours(2)));
    }

    #[test]
    fn test_queue_item_status_transitions() {
        let payload = NotificationPayload::new("TASK_DEADLINE", "t", "b");
        let request = NotificationRequest::builder("user-1", payload).build();
        let mut item = QueueItem::new(request);
        assert_eq!(item.status, ItemStatus::Pending);

        item.mark_delivered();
        assert_eq!(item.status, ItemStatus::Success);

        item.mark_failed();
        assert_eq!(item.status, ItemStatus::Failed);
    }

    #[test]
    fn test_payload_kind_serialized_as_type() {
        let payload = NotificationPayload::new("TASK_DEADLINE", "t", "b");
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "TASK_DEADLINE");
    }
}
