//! Outbound notification gateway.
//!
//! One attempt per call, no retry of its own: the switch scan decides what a
//! failure means (it retries on the next scan).

mod resend;
mod templates;

pub use resend::{ResendNotifier, DEFAULT_RESEND_URL};
pub use templates::SwitchReleaseEmail;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Notification sending error
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("no mail provider configured")]
    NotConfigured,

    #[error("request failed: {0}")]
    Transport(String),

    #[error("provider rejected message with status {status}")]
    Rejected { status: u16 },

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// A fully rendered message for a single recipient.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub to: String,
    pub subject: String,
    pub text: String,
    pub html: String,
}

/// Trait for notification providers
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: &Notification) -> Result<(), NotifyError>;
}

/// Used when no provider is configured. Always fails, so an armed switch is
/// never marked triggered without a delivery.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledNotifier;

#[async_trait]
impl Notifier for DisabledNotifier {
    async fn send(&self, message: &Notification) -> Result<(), NotifyError> {
        tracing::warn!(to = %message.to, "notification dropped: no mail provider configured");
        Err(NotifyError::NotConfigured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_notifier_always_fails() {
        let msg = Notification {
            to: "heir@example.com".into(),
            subject: "s".into(),
            text: "t".into(),
            html: "h".into(),
        };
        assert!(matches!(
            DisabledNotifier.send(&msg).await,
            Err(NotifyError::NotConfigured)
        ));
    }
}
