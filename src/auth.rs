//! Google OAuth access tokens for the Sheets API.
//!
//! The token cache (`token.json`) uses the google-auth "authorized user"
//! layout, so a cache written by other Google tooling works unchanged:
//!
//! ```json
//! { "token": "...", "refresh_token": "...", "token_uri": "...",
//!   "client_id": "...", "client_secret": "...", "expiry": "2025-01-01T00:00:00Z" }
//! ```
//!
//! A cached token is used until one minute before expiry, then refreshed
//! with the refresh-token grant and written back. The interactive consent
//! flow that creates the first refresh token is not handled here; without a
//! refresh token, fetching fails with [`Error::SourceUnavailable`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::error::{Error, Result};

pub const SHEETS_READONLY_SCOPE: &str = "https://www.googleapis.com/auth/spreadsheets.readonly";

/// Supplies bearer tokens to the Sheets client.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn access_token(&self) -> Result<String>;
}

/// A fixed token, for tests and for callers that manage auth themselves.
pub struct StaticToken(pub String);

#[async_trait]
impl TokenProvider for StaticToken {
    async fn access_token(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// On-disk authorized-user credentials.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthorizedUser {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AuthorizedUser {
    /// Whether the cached access token can still be used at `now`.
    ///
    /// A token without an expiry is trusted; a token expiring within the
    /// next minute is not.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        if self.token.is_none() {
            return false;
        }
        match self.expiry.as_deref() {
            None => true,
            Some(raw) => match DateTime::parse_from_rfc3339(raw) {
                Ok(expiry) => expiry.with_timezone(&Utc) > now + chrono::Duration::seconds(60),
                Err(_) => false,
            },
        }
    }

    /// Fill missing client id/secret from a client-secrets file
    /// (`{"installed": {...}}` or `{"web": {...}}`).
    fn merge_client_secrets(&mut self, secrets: &Value) {
        let section = secrets
            .get("installed")
            .or_else(|| secrets.get("web"))
            .unwrap_or(secrets);
        if self.client_id.is_none() {
            self.client_id = section["client_id"].as_str().map(String::from);
        }
        if self.client_secret.is_none() {
            self.client_secret = section["client_secret"].as_str().map(String::from);
        }
        if self.refresh_token.is_none() {
            self.refresh_token = section["refresh_token"].as_str().map(String::from);
        }
    }
}

#[derive(Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Token provider backed by the token cache and the credentials file.
pub struct CachedOAuth {
    token_path: PathBuf,
    credentials_path: PathBuf,
    token_uri: String,
    http: reqwest::Client,
    state: Mutex<Option<AuthorizedUser>>,
}

impl CachedOAuth {
    pub fn new(
        token_path: impl Into<PathBuf>,
        credentials_path: impl Into<PathBuf>,
        token_uri: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::SourceUnavailable(format!("http client: {}", e)))?;
        Ok(Self {
            token_path: token_path.into(),
            credentials_path: credentials_path.into(),
            token_uri: token_uri.into(),
            http,
            state: Mutex::new(None),
        })
    }

    fn load(&self) -> Result<AuthorizedUser> {
        let mut user = match read_json(&self.token_path)? {
            Some(v) => serde_json::from_value::<AuthorizedUser>(v).map_err(|e| {
                Error::SourceUnavailable(format!(
                    "unreadable token cache {}: {}",
                    self.token_path.display(),
                    e
                ))
            })?,
            None => AuthorizedUser::default(),
        };

        if user.client_id.is_none() || user.client_secret.is_none() || user.refresh_token.is_none()
        {
            match read_json(&self.credentials_path)? {
                Some(secrets) => user.merge_client_secrets(&secrets),
                None if user.token.is_none() => {
                    return Err(Error::SourceUnavailable(format!(
                        "Google credentials file not found at {}. Download credentials.json from Google Cloud Console.",
                        self.credentials_path.display()
                    )));
                }
                None => {}
            }
        }

        Ok(user)
    }

    async fn refresh(&self, user: &mut AuthorizedUser) -> Result<()> {
        let (Some(refresh_token), Some(client_id), Some(client_secret)) = (
            user.refresh_token.clone(),
            user.client_id.clone(),
            user.client_secret.clone(),
        ) else {
            return Err(Error::SourceUnavailable(format!(
                "no refresh token available; authorize this application once so that {} holds a refresh_token",
                self.token_path.display()
            )));
        };

        let token_uri = user.token_uri.clone().unwrap_or_else(|| self.token_uri.clone());
        tracing::debug!(%token_uri, "refreshing Google access token");

        let response = self
            .http
            .post(&token_uri)
            .form(&[
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
                ("refresh_token", refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|e| Error::SourceUnavailable(format!("token refresh failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::SourceUnavailable(format!(
                "token refresh rejected ({}): {}",
                status, body
            )));
        }

        let refreshed: RefreshResponse = response
            .json()
            .await
            .map_err(|e| Error::SourceUnavailable(format!("bad token response: {}", e)))?;

        user.token = Some(refreshed.access_token);
        user.expiry = refreshed.expires_in.map(|secs| {
            (Utc::now() + chrono::Duration::seconds(secs))
                .format("%Y-%m-%dT%H:%M:%SZ")
                .to_string()
        });
        if user.scopes.is_none() {
            user.scopes = Some(vec![SHEETS_READONLY_SCOPE.to_string()]);
        }

        self.save(user)
    }

    fn save(&self, user: &AuthorizedUser) -> Result<()> {
        let text = serde_json::to_string_pretty(user)
            .map_err(|e| Error::SourceUnavailable(format!("cannot encode token cache: {}", e)))?;
        std::fs::write(&self.token_path, text).map_err(|e| {
            Error::SourceUnavailable(format!(
                "cannot write token cache {}: {}",
                self.token_path.display(),
                e
            ))
        })
    }
}

#[async_trait]
impl TokenProvider for CachedOAuth {
    async fn access_token(&self) -> Result<String> {
        let mut state = self.state.lock().await;
        if state.is_none() {
            *state = Some(self.load()?);
        }
        let Some(user) = state.as_mut() else {
            return Err(Error::SourceUnavailable("token state unavailable".into()));
        };

        if !user.is_fresh(Utc::now()) {
            self.refresh(user).await?;
        }

        user.token
            .clone()
            .ok_or_else(|| Error::SourceUnavailable("token refresh returned no access token".into()))
    }
}

fn read_json(path: &Path) -> Result<Option<Value>> {
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(path)
        .map_err(|e| Error::SourceUnavailable(format!("cannot read {}: {}", path.display(), e)))?;
    serde_json::from_str(&text)
        .map(Some)
        .map_err(|e| Error::SourceUnavailable(format!("invalid JSON in {}: {}", path.display(), e)))
}
