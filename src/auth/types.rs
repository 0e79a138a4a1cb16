// Authentication types

use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};

/// Token type used when the token endpoint does not name one
pub const DEFAULT_TOKEN_TYPE: &str = "Bearer";

/// Settings needed to open an authenticated session
#[derive(Clone)]
pub struct AccessConfig {
    /// Base URL of the REST API
    pub instance_url: String,

    /// Authorization server for the refresh grant (defaults to `instance_url`)
    pub login_url: Option<String>,

    pub client_id: String,
    pub refresh_token: String,

    /// Previously issued access token, if the caller has one on hand
    pub access_token: Option<String>,

    /// Sent as `User-Agent` on every request the core issues
    pub user_agent: String,
}

impl std::fmt::Debug for AccessConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessConfig")
            .field("instance_url", &self.instance_url)
            .field("login_url", &self.login_url)
            .field("client_id", &self.client_id)
            .field("refresh_token", &"[REDACTED]")
            .field("access_token", &self.access_token.as_ref().map(|_| "[REDACTED]"))
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

/// An issued access token
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub value: String,
    pub token_type: String,
    pub issued_at: DateTime<Utc>,
}

impl AccessToken {
    /// Value for the `Authorization` header
    pub fn authorization(&self) -> String {
        format!("{} {}", self.token_type, self.value)
    }

    /// Short prefix that is safe to log
    pub fn preview(&self) -> &str {
        let end = self
            .value
            .char_indices()
            .nth(8)
            .map_or(self.value.len(), |(idx, _)| idx);
        &self.value[..end]
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &"[REDACTED]")
            .field("token_type", &self.token_type)
            .field("issued_at", &self.issued_at)
            .finish()
    }
}

/// Complete credential set for one session
///
/// The refresh token is fixed at construction. The access token is only ever
/// replaced as a whole.
#[derive(Clone)]
pub struct Credentials {
    pub instance_url: Url,
    pub login_url: Url,
    pub client_id: String,
    refresh_token: String,
    pub access_token: Option<AccessToken>,
}

impl Credentials {
    pub(crate) fn new(
        instance_url: Url,
        login_url: Url,
        client_id: String,
        refresh_token: String,
        access_token: Option<AccessToken>,
    ) -> Self {
        Self {
            instance_url,
            login_url,
            client_id,
            refresh_token,
            access_token,
        }
    }

    pub fn refresh_token(&self) -> &str {
        &self.refresh_token
    }

    pub fn is_authenticated(&self) -> bool {
        self.access_token.is_some()
    }

    pub fn token_issued_at(&self) -> Option<DateTime<Utc>> {
        self.access_token.as_ref().map(|t| t.issued_at)
    }

    /// Install the result of a successful refresh
    pub(crate) fn apply(&mut self, response: TokenEndpointResponse) {
        if let Some(instance_url) = response.instance_url {
            if instance_url != self.instance_url {
                tracing::info!("Instance URL changed to {}", instance_url);
            }
            self.instance_url = instance_url;
        }
        self.access_token = Some(AccessToken {
            value: response.access_token,
            token_type: response.token_type,
            issued_at: response.issued_at,
        });
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("instance_url", &self.instance_url.as_str())
            .field("login_url", &self.login_url.as_str())
            .field("client_id", &self.client_id)
            .field("refresh_token", &"[REDACTED]")
            .field("access_token", &self.access_token)
            .finish()
    }
}

/// Result of one refresh-token grant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenEndpointResponse {
    pub access_token: String,
    pub instance_url: Option<Url>,
    pub issued_at: DateTime<Utc>,
    pub token_type: String,
    pub id_url: Option<String>,
    pub scope: Option<String>,
}

/// Refresh grant form body
#[derive(Serialize)]
pub struct RefreshTokenForm<'a> {
    pub grant_type: &'a str,
    pub client_id: &'a str,
    pub refresh_token: &'a str,
}

/// Token endpoint JSON body
///
/// Every field is optional at this layer so a missing `access_token` is
/// reported as a protocol error rather than a generic parse failure.
#[derive(Deserialize)]
pub struct RefreshTokenResponse {
    pub access_token: Option<String>,
    pub instance_url: Option<String>,
    pub token_type: Option<String>,
    /// Milliseconds since the epoch, sent as a string by most servers
    pub issued_at: Option<serde_json::Value>,
    pub id: Option<String>,
    pub scope: Option<String>,
}

/// OAuth2 error body
#[derive(Deserialize)]
pub struct OAuthErrorResponse {
    pub error: String,
    pub error_description: Option<String>,
}
