// Token refresh logic

use chrono::{DateTime, Utc};
use reqwest::{Method, Url};
use std::sync::Arc;
use std::time::Duration;

use super::credentials::require_non_empty;
use super::types::{
    OAuthErrorResponse, RefreshTokenForm, RefreshTokenResponse, TokenEndpointResponse,
    DEFAULT_TOKEN_TYPE,
};
use crate::error::{AccessError, Result};
use crate::response::ResponseEnvelope;
use crate::transport::{parse_http_url, send_with_deadline, HttpTransport, OutboundRequest};

/// Path of the OAuth2 token endpoint under the authorization server
pub const TOKEN_PATH: &str = "/services/oauth2/token";

/// Build the token endpoint URL for an authorization server
pub fn token_endpoint_url(auth_server_uri: &str) -> Result<Url> {
    parse_http_url("authorization server", auth_server_uri)?;
    parse_http_url(
        "token endpoint",
        &format!("{}{}", auth_server_uri.trim_end_matches('/'), TOKEN_PATH),
    )
}

/// Executes the OAuth2 refresh-token grant
///
/// Holds no state between calls and never retries; the caller decides what a
/// failure means.
pub struct TokenEndpointClient {
    transport: Arc<dyn HttpTransport>,
    user_agent: String,
}

impl TokenEndpointClient {
    pub fn new(transport: Arc<dyn HttpTransport>, user_agent: impl Into<String>) -> Self {
        Self {
            transport,
            user_agent: user_agent.into(),
        }
    }

    /// Exchange a refresh token for a new access token
    pub async fn refresh(
        &self,
        auth_server_uri: &str,
        client_id: &str,
        refresh_token: &str,
        timeout: Duration,
    ) -> Result<TokenEndpointResponse> {
        let url = token_endpoint_url(auth_server_uri)?;
        require_non_empty("client_id", client_id)?;
        require_non_empty("refresh_token", refresh_token)?;

        tracing::debug!(
            "Token refresh request: url={}, client_id={}...",
            url,
            &client_id[..client_id.char_indices().nth(8).map_or(client_id.len(), |(i, _)| i)]
        );

        let form = RefreshTokenForm {
            grant_type: "refresh_token",
            client_id,
            refresh_token,
        };

        let request = OutboundRequest::new(Method::POST, url.as_str())?
            .header("accept", "application/json")?
            .header("user-agent", &self.user_agent)?
            .form(&form)?;

        // One deadline for the whole grant: send and body read together
        match tokio::time::timeout(timeout, self.exchange(&request, timeout)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    url = %url,
                    timeout_ms = timeout.as_millis() as u64,
                    "Token refresh deadline exceeded"
                );
                Err(AccessError::timed_out(format!(
                    "token refresh via {} timed out after {}ms",
                    url,
                    timeout.as_millis()
                )))
            }
        }
    }

    /// Send the grant and read the full token response
    async fn exchange(&self, request: &OutboundRequest, timeout: Duration) -> Result<TokenEndpointResponse> {
        let raw = send_with_deadline(self.transport.as_ref(), request, timeout).await?;
        let response = ResponseEnvelope::new(raw);
        let status = response.status_code();

        // A body that dies mid-read on the token endpoint is a network failure
        let body = response.body_text().await.map_err(|e| match e {
            AccessError::BodyRead(message) => {
                AccessError::transport(format!("token response body: {}", message))
            }
            other => other,
        })?;

        if status != 200 {
            tracing::error!("Token refresh failed: status={}, body={}", status, body);

            if let Ok(oauth_error) = serde_json::from_str::<OAuthErrorResponse>(&body) {
                tracing::error!(
                    "Token endpoint error details: error={}, description={}",
                    oauth_error.error,
                    oauth_error.error_description.as_deref().unwrap_or("-")
                );
            }

            return Err(AccessError::auth_rejected(status, &body));
        }

        let token = parse_token_response(&body)?;

        tracing::info!(
            "Token refreshed, issued at: {}",
            token.issued_at.to_rfc3339()
        );

        Ok(token)
    }
}

/// Parse a 200 token endpoint body
pub fn parse_token_response(body: &str) -> Result<TokenEndpointResponse> {
    let data: RefreshTokenResponse = serde_json::from_str(body)
        .map_err(|e| AccessError::Protocol(format!("Failed to parse token response: {}", e)))?;

    let access_token = data
        .access_token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| {
            AccessError::Protocol("Token response does not contain access_token".to_string())
        })?;

    let instance_url = match data.instance_url.filter(|u| !u.is_empty()) {
        Some(url) => Some(parse_http_url("instance_url", &url).map_err(|_| {
            AccessError::Protocol(format!("Token response has invalid instance_url '{}'", url))
        })?),
        None => None,
    };

    let token_type = data
        .token_type
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_TOKEN_TYPE.to_string());

    let issued_at = data
        .issued_at
        .as_ref()
        .and_then(parse_issued_at)
        .unwrap_or_else(Utc::now);

    Ok(TokenEndpointResponse {
        access_token,
        instance_url,
        issued_at,
        token_type,
        id_url: data.id,
        scope: data.scope,
    })
}

/// `issued_at` is epoch milliseconds, as a string or a number
fn parse_issued_at(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    let millis = match value {
        serde_json::Value::String(s) => s.trim().parse::<i64>().ok()?,
        serde_json::Value::Number(n) => n.as_i64()?,
        _ => return None,
    };
    DateTime::<Utc>::from_timestamp_millis(millis)
}
