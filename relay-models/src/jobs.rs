use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Title attached to every push notification sent for a job.
pub const NOTIFICATION_TITLE: &str = "Incoming message";

/// Job consumed from the work queue. Every field is required; a payload missing
/// one of them does not decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationJob {
    pub identifier: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub device_id: String,
    pub text: String,
}

impl NotificationJob {
    pub fn from_json(data: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(data)
    }

    /// Returns the reason a decoded job cannot be processed, if any.
    pub fn invalid_reason(&self) -> Option<&'static str> {
        if self.identifier.trim().is_empty() {
            Some("identifier is blank")
        } else if self.device_id.trim().is_empty() {
            Some("deviceId is blank")
        } else {
            None
        }
    }
}

/// Announcement published to the result topic once a job is done.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRecord {
    pub identifier: String,
    pub deliver_at: String,
}

impl ResultRecord {
    pub fn new(identifier: impl Into<String>, deliver_at: DateTime<Utc>) -> Self {
        Self {
            identifier: identifier.into(),
            deliver_at: format_timestamp(deliver_at),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_json(data: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(data)
    }
}

/// Row persisted for each completed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionRecord {
    pub identifier: String,
    pub deliver_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// ISO-8601 in UTC with millisecond precision, e.g. `2024-05-01T10:00:00.123Z`.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}
