//! Outbound delivery interface.
//!
//! The engine retries through this trait, so implementations should be
//! safe to invoke more than once for the same payload.

use async_trait::async_trait;

use crate::notification::NotificationPayload;

/// Error returned by a delivery attempt
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("Delivery timed out")]
    Timeout,
    #[error("Delivery rejected: {0}")]
    Rejected(String),
    #[error("Transport unavailable: {0}")]
    Unavailable(String),
}

/// Outbound channel the dispatcher hands finished payloads to
#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    async fn deliver(
        &self,
        user_id: &str,
        payload: &NotificationPayload,
    ) -> Result<(), TransportError>;
}

/// Transport that logs instead of delivering. Used when no real
/// transport is configured.
pub struct NoopTransport;

#[async_trait]
impl DeliveryTransport for NoopTransport {
    async fn deliver(
        &self,
        user_id: &str,
        payload: &NotificationPayload,
    ) -> Result<(), TransportError> {
        tracing::info!(
            user_id = %user_id,
            kind = %payload.kind,
            title = %payload.title,
            "Delivered notification (noop transport)"
        );
        Ok(())
    }
}
