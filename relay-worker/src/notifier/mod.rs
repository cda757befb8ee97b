pub mod credentials;
pub mod fcm;

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use log::info;
use relay_utilities::logger::redact_token;
use thiserror::Error;

pub use credentials::{CredentialsError, ServiceAccount, TokenProvider};
pub use fcm::FcmSender;

#[derive(Debug, Error)]
pub enum SendError {
    #[error("not authorized to send notifications: {0}")]
    NotAuthorized(String),
    #[error("device token rejected: {0}")]
    InvalidToken(String),
    #[error("notification service unavailable: {0}")]
    Unavailable(String),
}

/// Delivers a single push notification and returns the provider's receipt id.
#[async_trait]
pub trait NotificationSender: Send + Sync + 'static {
    async fn send(&self, device_token: &str, title: &str, body: &str) -> Result<String, SendError>;

    /// Whether the sender is configured and able to accept work.
    fn is_ready(&self) -> bool {
        true
    }
}

/// Writes notifications to the log instead of delivering them.
#[derive(Default)]
pub struct LoggingSender {
    sent: AtomicU64,
}

impl LoggingSender {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NotificationSender for LoggingSender {
    async fn send(&self, device_token: &str, title: &str, body: &str) -> Result<String, SendError> {
        let sequence = self.sent.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            "Notification for {} (not delivered): {} / {}",
            redact_token(device_token),
            title,
            body
        );
        Ok(format!("logged/{sequence}"))
    }
}
