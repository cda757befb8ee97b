use async_trait::async_trait;
use log::{error, info, warn};
use relay_utilities::logger::redact_token;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};

use super::{
    NotificationSender, SendError,
    credentials::{CredentialsError, ServiceAccount, TokenProvider},
};

const FCM_ENDPOINT: &str = "https://fcm.googleapis.com";

/// FCM error codes that mean the device token itself will never work.
const TOKEN_ERROR_CODES: [&str; 2] = ["UNREGISTERED", "INVALID_ARGUMENT"];

#[derive(Deserialize)]
struct SendResponse {
    name: String,
}

/// Sends through the FCM HTTP v1 API using a service account.
pub struct FcmSender {
    client: reqwest::Client,
    send_url: String,
    tokens: TokenProvider,
}

impl FcmSender {
    pub fn new(project_id: &str, account: ServiceAccount) -> Result<Self, CredentialsError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|err| CredentialsError::Transport(err.to_string()))?;
        Self::with_endpoint(project_id, account, client, FCM_ENDPOINT)
    }

    /// Same as `new` but against another API host, e.g. an emulator.
    pub fn with_endpoint(
        project_id: &str,
        account: ServiceAccount,
        client: reqwest::Client,
        endpoint: &str,
    ) -> Result<Self, CredentialsError> {
        let tokens = TokenProvider::new(account, client.clone())?;
        let send_url = format!(
            "{}/v1/projects/{}/messages:send",
            endpoint.trim_end_matches('/'),
            project_id
        );
        info!("FCM sender initialized for project {}", project_id);
        Ok(Self {
            client,
            send_url,
            tokens,
        })
    }
}

#[async_trait]
impl NotificationSender for FcmSender {
    async fn send(&self, device_token: &str, title: &str, body: &str) -> Result<String, SendError> {
        let access_token = self.tokens.access_token().await.map_err(|err| match err {
            CredentialsError::Transport(message) => SendError::Unavailable(message),
            other => SendError::NotAuthorized(other.to_string()),
        })?;

        let response = self
            .client
            .post(&self.send_url)
            .bearer_auth(access_token)
            .json(&message_body(device_token, title, body))
            .send()
            .await
            .map_err(|err| SendError::Unavailable(err.to_string()))?;

        let status = response.status();
        if status.is_success() {
            let sent: SendResponse = response
                .json()
                .await
                .map_err(|err| SendError::Unavailable(err.to_string()))?;
            info!(
                "FCM notification sent successfully: {} to {}",
                sent.name,
                redact_token(device_token)
            );
            return Ok(sent.name);
        }

        let text = response.text().await.unwrap_or_default();
        let err = classify(status, &text);
        match err {
            SendError::NotAuthorized(_) => {
                self.tokens.invalidate();
                error!("Failed to send FCM notification to {}: {}", redact_token(device_token), err);
            }
            _ => warn!("Failed to send FCM notification to {}: {}", redact_token(device_token), err),
        }
        Err(err)
    }
}

pub(crate) fn message_body(device_token: &str, title: &str, body: &str) -> Value {
    json!({
        "message": {
            "token": device_token,
            "notification": {
                "title": title,
                "body": body,
            },
            "android": {
                "priority": "high",
            },
            "apns": {
                "headers": {
                    "apns-priority": "10",
                },
            },
        }
    })
}

/// Map a failed FCM response onto the sender error taxonomy.
pub(crate) fn classify(status: StatusCode, body: &str) -> SendError {
    let detail = format!("{status}: {body}");
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return SendError::NotAuthorized(detail);
    }
    if status == StatusCode::NOT_FOUND {
        return SendError::InvalidToken(detail);
    }

    let Ok(parsed) = serde_json::from_str::<Value>(body) else {
        return SendError::Unavailable(detail);
    };
    let error = &parsed["error"];
    let detail_codes = error["details"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|entry| entry["errorCode"].as_str());
    let mut codes = error["status"].as_str().into_iter().chain(detail_codes);

    if codes.any(|code| TOKEN_ERROR_CODES.contains(&code)) {
        SendError::InvalidToken(detail)
    } else {
        SendError::Unavailable(detail)
    }
}
