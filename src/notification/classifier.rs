//! Priority classification from notification kind.
//!
//! A caller-supplied hint always wins; otherwise the kind string maps
//! to a default priority. Unknown kinds classify as Normal.

use super::types::{NotificationPayload, Priority};

pub fn classify(payload: &NotificationPayload, hint: Option<Priority>) -> Priority {
    if let Some(priority) = hint {
        return priority;
    }
    classify_kind(&payload.kind)
}

pub fn classify_kind(kind: &str) -> Priority {
    match kind {
        "SECURITY_ALERT" | "SYSTEM_CRITICAL" => Priority::Critical,
        "TASK_OVERDUE" => Priority::High,
        "TASK_DEADLINE" | "HABIT_REMINDER" | "CALENDAR_EVENT" => Priority::Normal,
        "WEEKLY_DIGEST" | "SUGGESTION" => Priority::Low,
        _ => Priority::Normal,
    }
}
