//! Notification data model and priority classification.

pub mod classifier;
pub mod types;

pub use types::{
    Batch, ItemStatus, NotificationAction, NotificationPayload, NotificationRequest, Priority,
    QueueItem, RequestBuilder, SendResult,
};
