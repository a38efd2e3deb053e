//! Type-keyed batch summarisers.
//!
//! Each summariser folds a group of same-kind items into one payload
//! that names up to two of them and counts the rest.

use serde_json::{json, Map, Value};

use crate::notification::{NotificationAction, NotificationPayload, QueueItem};

/// Produce the combined payload for a batch of same-kind items.
pub fn summarize(kind: &str, items: &[QueueItem]) -> NotificationPayload {
    let (title, body) = match kind {
        "TASK_DEADLINE" => (
            format!("{} task deadlines approaching", items.len()),
            named_body(items),
        ),
        "HABIT_REMINDER" => (
            format!("{} habits waiting for check-in", items.len()),
            named_body(items),
        ),
        "CALENDAR_EVENT" => (
            format!("{} upcoming events", items.len()),
            named_body(items),
        ),
        _ => (
            format!("{} new notifications", items.len()),
            named_body(items),
        ),
    };

    let mut data = Map::new();
    data.insert("batchSize".to_string(), json!(items.len()));
    let entity_ids: Vec<Value> = items
        .iter()
        .filter_map(|i| i.request.payload.entity_id.as_deref())
        .map(|id| json!(id))
        .collect();
    data.insert("entityIds".to_string(), Value::Array(entity_ids));

    NotificationPayload {
        title,
        body,
        icon: items
            .first()
            .and_then(|i| i.request.payload.icon.clone()),
        tag: Some(format!("batch-{}", kind.to_lowercase())),
        actions: vec![
            NotificationAction {
                action: "view_all".to_string(),
                title: "View All".to_string(),
            },
            NotificationAction {
                action: "snooze_all".to_string(),
                title: "Snooze All".to_string(),
            },
        ],
        kind: kind.to_string(),
        entity_id: None,
        data,
        require_interaction: false,
    }
}

/// "A, B +N others" naming at most the first two items
fn named_body(items: &[QueueItem]) -> String {
    let titles: Vec<&str> = items
        .iter()
        .take(2)
        .map(|i| i.request.payload.title.as_str())
        .collect();
    let named = titles.join(", ");
    match items.len().saturating_sub(2) {
        0 => named,
        1 => format!("{} +1 other", named),
        n => format!("{} +{} others", named, n),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::NotificationRequest;

    fn item(kind: &str, title: &str, entity_id: Option<&str>) -> QueueItem {
        let mut payload = NotificationPayload::new(kind, title, "body");
        payload.entity_id = entity_id.map(str::to_string);
        QueueItem::new(NotificationRequest::builder("u1", payload).build())
    }

    #[test]
    fn test_three_task_deadlines() {
        let items = vec![
            item("TASK_DEADLINE", "Ship report", Some("t1")),
            item("TASK_DEADLINE", "Review PR", Some("t2")),
            item("TASK_DEADLINE", "Pay invoice", Some("t3")),
        ];
        let payload = summarize("TASK_DEADLINE", &items);
        assert_eq!(payload.title, "3 task deadlines approaching");
        assert_eq!(payload.body, "Ship report, Review PR +1 other");
        assert_eq!(payload.data["batchSize"], 3);
        assert_eq!(
            payload.data["entityIds"],
            serde_json::json!(["t1", "t2", "t3"])
        );
    }

    #[test]
    fn test_two_items_no_suffix() {
        let items = vec![
            item("HABIT_REMINDER", "Meditate", None),
            item("HABIT_REMINDER", "Stretch", None),
        ];
        let payload = summarize("HABIT_REMINDER", &items);
        assert_eq!(payload.body, "Meditate, Stretch");
    }

    #[test]
    fn test_many_items_pluralized() {
        let items: Vec<_> = (0..5)
            .map(|i| item("CALENDAR_EVENT", &format!("Event {}", i), None))
            .collect();
        let payload = summarize("CALENDAR_EVENT", &items);
        assert!(payload.body.ends_with("+3 others"));
    }

    #[test]
    fn test_actions_and_tag() {
        let items = vec![
            item("TASK_DEADLINE", "A", None),
            item("TASK_DEADLINE", "B", None),
        ];
        let payload = summarize("TASK_DEADLINE", &items);
        assert_eq!(payload.tag.as_deref(), Some("batch-task_deadline"));
        let actions: Vec<&str> = payload.actions.iter().map(|a| a.title.as_str()).collect();
        assert_eq!(actions, vec!["View All", "Snooze All"]);
    }

    #[test]
    fn test_unknown_kind_uses_default_summary() {
        let items = vec![item("SUGGESTION", "A", None), item("SUGGESTION", "B", None)];
        let payload = summarize("SUGGESTION", &items);
        assert_eq!(payload.title, "2 new notifications");
    }
}
