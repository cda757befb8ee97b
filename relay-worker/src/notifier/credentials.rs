use std::{fmt, fs, path::Path};

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use log::{debug, info};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const MESSAGING_SCOPE: &str = "https://www.googleapis.com/auth/firebase.messaging";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const ASSERTION_LIFETIME_SECS: i64 = 3600;
/// Cached access tokens are refreshed this long before they expire.
const REFRESH_MARGIN_SECS: i64 = 60;

#[derive(Debug, Error)]
pub enum CredentialsError {
    #[error("service account not configured")]
    NotConfigured,
    #[error("failed to read service account file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid service account JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid service account key: {0}")]
    Key(#[from] jsonwebtoken::errors::Error),
    #[error("token request rejected: {0}")]
    Rejected(String),
    #[error("token request failed: {0}")]
    Transport(String),
}

/// The parts of a Google service account key file needed to mint access tokens.
#[derive(Clone, Deserialize)]
pub struct ServiceAccount {
    #[serde(default)]
    pub project_id: Option<String>,
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

impl fmt::Debug for ServiceAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceAccount")
            .field("project_id", &self.project_id)
            .field("client_email", &self.client_email)
            .field("token_uri", &self.token_uri)
            .finish_non_exhaustive()
    }
}

impl ServiceAccount {
    pub fn from_json(json: &str) -> Result<Self, CredentialsError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, CredentialsError> {
        let content = fs::read_to_string(path).map_err(|source| CredentialsError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&content)
    }

    /// Load from the key file when it exists, otherwise from the inline JSON.
    pub fn load(path: Option<&Path>, json: Option<&str>) -> Result<Self, CredentialsError> {
        match (path, json) {
            (Some(path), _) if path.exists() => {
                info!("Loading service account from {}", path.display());
                Self::from_file(path)
            }
            (_, Some(json)) => Self::from_json(json),
            (Some(path), None) => Self::from_file(path),
            (None, None) => Err(CredentialsError::NotConfigured),
        }
    }
}

#[derive(Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: DateTime<Utc>,
}

impl CachedToken {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now + Duration::seconds(REFRESH_MARGIN_SECS) < self.expires_at
    }
}

/// Exchanges signed service account assertions for OAuth access tokens and caches them.
pub struct TokenProvider {
    account: ServiceAccount,
    key: EncodingKey,
    client: reqwest::Client,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenProvider {
    pub fn new(account: ServiceAccount, client: reqwest::Client) -> Result<Self, CredentialsError> {
        let key = EncodingKey::from_rsa_pem(account.private_key.as_bytes())?;
        Ok(Self {
            account,
            key,
            client,
            cached: Mutex::new(None),
        })
    }

    /// RS256-signed JWT asserting the messaging scope, valid for one hour from `now`.
    pub fn assertion(&self, now: DateTime<Utc>) -> Result<String, CredentialsError> {
        let claims = Claims {
            iss: &self.account.client_email,
            scope: MESSAGING_SCOPE,
            aud: &self.account.token_uri,
            iat: now.timestamp(),
            exp: now.timestamp() + ASSERTION_LIFETIME_SECS,
        };
        Ok(jsonwebtoken::encode(
            &Header::new(Algorithm::RS256),
            &claims,
            &self.key,
        )?)
    }

    pub async fn access_token(&self) -> Result<String, CredentialsError> {
        let now = Utc::now();
        let cached = self
            .cached
            .lock()
            .as_ref()
            .filter(|token| token.is_fresh(now))
            .map(|token| token.value.clone());
        if let Some(token) = cached {
            return Ok(token);
        }

        let fresh = self.exchange(now).await?;
        debug!("Access token refreshed, valid until {}", fresh.expires_at);
        let value = fresh.value.clone();
        *self.cached.lock() = Some(fresh);
        Ok(value)
    }

    /// Drop the cached token so the next request mints a new one.
    pub fn invalidate(&self) {
        self.cached.lock().take();
    }

    async fn exchange(&self, now: DateTime<Utc>) -> Result<CachedToken, CredentialsError> {
        let assertion = self.assertion(now)?;
        let response = self
            .client
            .post(&self.account.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await
            .map_err(|err| CredentialsError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!("{status}: {body}");
            return Err(if status.is_server_error() {
                CredentialsError::Transport(message)
            } else {
                CredentialsError::Rejected(message)
            });
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|err| CredentialsError::Transport(err.to_string()))?;
        Ok(CachedToken {
            value: token.access_token,
            expires_at: now + Duration::seconds(token.expires_in),
        })
    }
}
