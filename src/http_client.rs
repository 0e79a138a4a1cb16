use chrono::{DateTime, Utc};
use reqwest::header::HeaderValue;
use reqwest::Url;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{AccessConfig, AccessToken, AuthManager};
use crate::error::{AccessError, Result};
use crate::response::ResponseEnvelope;
use crate::transport::{send_with_deadline, HttpTransport, OutboundRequest};

const UNAUTHORIZED: u16 = 401;

/// Authenticated access to a REST API
///
/// Signs every request with the current access token. A 401 triggers one
/// refresh and one retry of the original request; whatever the retry returns
/// is handed back. Safe to share behind an `Arc` across tasks.
pub struct AuthenticatedAccess {
    /// Transport for resource requests
    transport: Arc<dyn HttpTransport>,

    /// Token state and refresh coalescing
    auth_manager: AuthManager,

    user_agent: HeaderValue,
}

impl AuthenticatedAccess {
    /// Create an access layer. Fails with `InvalidArgument` on bad settings.
    pub fn new(config: AccessConfig, transport: Arc<dyn HttpTransport>) -> Result<Self> {
        let user_agent = HeaderValue::from_str(config.user_agent.trim()).map_err(|e| {
            AccessError::InvalidArgument(format!("user_agent is not a valid header value: {}", e))
        })?;
        if user_agent.is_empty() {
            return Err(AccessError::InvalidArgument(
                "user_agent must not be empty".to_string(),
            ));
        }

        let auth_manager = AuthManager::new(&config, transport.clone())?;

        Ok(Self {
            transport,
            auth_manager,
            user_agent,
        })
    }

    /// Execute a request with automatic authentication
    ///
    /// Every network operation (initial refresh, request, refresh on 401,
    /// retry) is bounded by `timeout` on its own.
    pub async fn execute(&self, request: &OutboundRequest, timeout: Duration) -> Result<ResponseEnvelope> {
        let request_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
        let method = request.method().clone();
        let url = request.url().clone();

        tracing::debug!(
            request_id = %request_id,
            method = %method,
            url = %url,
            "Executing request"
        );

        let snapshot = self.auth_manager.current_token(timeout).await?;
        let response = self.send_signed(request, &snapshot.token, timeout, 1).await?;

        if response.status_code() != UNAUTHORIZED {
            tracing::debug!(
                request_id = %request_id,
                status = response.status_code(),
                "Request completed"
            );
            return Ok(response);
        }

        tracing::warn!(
            request_id = %request_id,
            method = %method,
            url = %url,
            "Received 401, refreshing token and retrying once..."
        );

        let refreshed = match self.auth_manager.refresh_after(snapshot.epoch, timeout).await {
            Ok(refreshed) => refreshed,
            Err(e) => {
                tracing::error!(
                    request_id = %request_id,
                    error = %e,
                    "Token refresh after 401 failed"
                );
                return Err(e);
            }
        };

        let retry = self.send_signed(request, &refreshed.token, timeout, 2).await?;

        if retry.status_code() == UNAUTHORIZED {
            tracing::warn!(
                request_id = %request_id,
                url = %url,
                "Retried request was rejected again, returning 401 to caller"
            );
        } else {
            tracing::debug!(
                request_id = %request_id,
                status = retry.status_code(),
                "Retried request completed"
            );
        }

        Ok(retry)
    }

    /// Authenticate now instead of on the first request
    pub async fn authenticate(&self, timeout: Duration) -> Result<()> {
        self.auth_manager.force_refresh(timeout).await.map(|_| ())
    }

    /// Drop the current token; the next request re-authenticates
    pub async fn invalidate(&self) {
        self.auth_manager.invalidate().await;
    }

    pub async fn is_authenticated(&self) -> bool {
        self.auth_manager.is_authenticated().await
    }

    /// Base URL of the REST API, updated when the token endpoint moves it
    pub async fn instance_url(&self) -> Url {
        self.auth_manager.instance_url().await
    }

    pub async fn token_issued_at(&self) -> Option<DateTime<Utc>> {
        self.auth_manager.token_issued_at().await
    }

    /// Number of refresh grants sent since creation
    pub fn refresh_count(&self) -> u64 {
        self.auth_manager.refresh_count()
    }

    /// Sign a copy of `request` with `token` and send it
    async fn send_signed(
        &self,
        request: &OutboundRequest,
        token: &AccessToken,
        timeout: Duration,
        attempt: u32,
    ) -> Result<ResponseEnvelope> {
        let authorization = HeaderValue::from_str(&token.authorization()).map_err(|_| {
            AccessError::Protocol("access token is not a valid header value".to_string())
        })?;
        let signed = request.signed(authorization, &self.user_agent);

        tracing::debug!(
            attempt = attempt,
            method = %signed.method(),
            url = %signed.url(),
            token = %token.preview(),
            "Sending signed request"
        );

        let raw = send_with_deadline(self.transport.as_ref(), &signed, timeout).await?;
        Ok(ResponseEnvelope::new(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TOKEN_PATH;
    use crate::transport::mock::{Reply, ScriptedTransport};
    use serde_json::json;

    const TIMEOUT: Duration = Duration::from_secs(5);
    const RESOURCE: &str = "/services/data/v61.0/";

    fn config(access_token: Option<&str>) -> AccessConfig {
        AccessConfig {
            instance_url: "https://na1.example.com".to_string(),
            login_url: None,
            client_id: "client".to_string(),
            refresh_token: "refresh".to_string(),
            access_token: access_token.map(str::to_string),
            user_agent: "rest-access-test/1.0".to_string(),
        }
    }

    fn access(transport: &Arc<ScriptedTransport>, access_token: Option<&str>) -> AuthenticatedAccess {
        AuthenticatedAccess::new(config(access_token), transport.clone()).unwrap()
    }

    fn token_reply(token: &str) -> Reply {
        Reply::json(200, json!({"access_token": token, "token_type": "Bearer"}))
    }

    fn resource_request() -> OutboundRequest {
        OutboundRequest::get(&format!("https://na1.example.com{}", RESOURCE)).unwrap()
    }

    fn authorizations(transport: &ScriptedTransport, path: &str) -> Vec<String> {
        transport
            .requests()
            .iter()
            .filter(|r| r.url().path() == path)
            .map(|r| r.header_value("authorization").unwrap_or_default().to_string())
            .collect()
    }

    #[test]
    fn test_rejects_bad_construction_input() {
        let transport: Arc<dyn HttpTransport> = Arc::new(ScriptedTransport::new());

        let mut cfg = config(None);
        cfg.user_agent = "".to_string();
        assert!(matches!(
            AuthenticatedAccess::new(cfg, transport.clone()),
            Err(AccessError::InvalidArgument(_))
        ));

        let mut cfg = config(None);
        cfg.user_agent = "bad\nagent".to_string();
        assert!(matches!(
            AuthenticatedAccess::new(cfg, transport.clone()),
            Err(AccessError::InvalidArgument(_))
        ));

        let mut cfg = config(None);
        cfg.instance_url = "not a url".to_string();
        assert!(matches!(
            AuthenticatedAccess::new(cfg, transport),
            Err(AccessError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_unauthenticated_call_refreshes_then_sends() {
        let transport = Arc::new(ScriptedTransport::new());
        transport
            .reply(TOKEN_PATH, token_reply("fresh"))
            .reply(RESOURCE, Reply::json(200, json!({"sobjects": "/sobjects"})));
        let access = access(&transport, None);

        let response = access.execute(&resource_request(), TIMEOUT).await.unwrap();

        assert_eq!(response.status_code(), 200);
        assert_eq!(access.refresh_count(), 1);
        assert_eq!(authorizations(&transport, RESOURCE), vec!["Bearer fresh"]);

        // Token request first, then the resource request
        let paths: Vec<String> = transport
            .requests()
            .iter()
            .map(|r| r.url().path().to_string())
            .collect();
        assert_eq!(paths, vec![TOKEN_PATH.to_string(), RESOURCE.to_string()]);
    }

    #[tokio::test]
    async fn test_caller_authorization_is_overwritten_and_request_untouched() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.reply(RESOURCE, Reply::status(200));
        let access = access(&transport, Some("current"));

        let request = resource_request()
            .header("Authorization", "OAuth caller-supplied")
            .unwrap()
            .header("Content-Type", "application/json")
            .unwrap();
        access.execute(&request, TIMEOUT).await.unwrap();

        let sent = &transport.requests()[0];
        assert_eq!(sent.header_value("authorization"), Some("Bearer current"));
        assert_eq!(sent.header_value("content-type"), Some("application/json"));
        assert_eq!(sent.header_value("user-agent"), Some("rest-access-test/1.0"));
        assert_eq!(request.header_value("authorization"), Some("OAuth caller-supplied"));
    }

    #[tokio::test]
    async fn test_401_triggers_one_refresh_and_one_retry() {
        let transport = Arc::new(ScriptedTransport::new());
        transport
            .reply(TOKEN_PATH, token_reply("fresh"))
            .reply(RESOURCE, Reply::status(401).body("[{\"errorCode\":\"INVALID_SESSION_ID\"}]"))
            .reply(RESOURCE, Reply::json(200, json!({"sobjects": "/sobjects"})));
        let access = access(&transport, Some("stale"));

        let response = access.execute(&resource_request(), TIMEOUT).await.unwrap();

        assert_eq!(response.status_code(), 200);
        assert!(response.body_text().await.unwrap().contains("sobjects"));
        assert_eq!(access.refresh_count(), 1);
        assert_eq!(
            authorizations(&transport, RESOURCE),
            vec!["Bearer stale", "Bearer fresh"]
        );
    }

    #[tokio::test]
    async fn test_second_401_is_returned_without_another_refresh() {
        let transport = Arc::new(ScriptedTransport::new());
        transport
            .reply(TOKEN_PATH, token_reply("also-rejected"))
            .reply(RESOURCE, Reply::status(401).body("session expired"));
        let access = access(&transport, Some("stale"));

        let response = access.execute(&resource_request(), TIMEOUT).await.unwrap();

        assert_eq!(response.status_code(), 401);
        assert_eq!(response.body_text().await.unwrap(), "session expired");
        assert_eq!(access.refresh_count(), 1);
        assert_eq!(transport.count(TOKEN_PATH), 1);
        assert_eq!(transport.count(RESOURCE), 2);
        // The token is kept; only a failed refresh clears it
        assert!(access.is_authenticated().await);
    }

    #[tokio::test]
    async fn test_other_statuses_pass_through() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.reply(
            RESOURCE,
            Reply::json(
                405,
                json!([{"errorCode": "METHOD_NOT_ALLOWED", "message": "HTTP Method 'POST' not allowed. Allowed are GET,HEAD"}]),
            ),
        );
        let access = access(&transport, Some("current"));

        let request = OutboundRequest::post(&format!("https://na1.example.com{}", RESOURCE)).unwrap();
        let response = access.execute(&request, TIMEOUT).await.unwrap();

        assert_eq!(response.status_code(), 405);
        assert!(response.body_text().await.unwrap().contains("not allowed"));
        assert_eq!(access.refresh_count(), 0);
        assert_eq!(transport.count(TOKEN_PATH), 0);
    }

    #[tokio::test]
    async fn test_failed_refresh_sends_nothing() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.reply(
            TOKEN_PATH,
            Reply::json(400, json!({"error": "invalid_grant", "error_description": "expired access/refresh token"})),
        );
        let access = access(&transport, None);

        let err = access.execute(&resource_request(), TIMEOUT).await.unwrap_err();

        assert!(matches!(err, AccessError::AuthRejected { status: 400, .. }));
        assert_eq!(transport.count(RESOURCE), 0);
        assert!(!access.is_authenticated().await);
    }

    #[tokio::test]
    async fn test_failed_refresh_after_401_leaves_unauthenticated() {
        let transport = Arc::new(ScriptedTransport::new());
        transport
            .reply(TOKEN_PATH, Reply::json(400, json!({"error": "invalid_grant"})))
            .reply(RESOURCE, Reply::status(401));
        let access = access(&transport, Some("stale"));

        let err = access.execute(&resource_request(), TIMEOUT).await.unwrap_err();

        assert_eq!(err.status(), Some(400));
        assert_eq!(transport.count(RESOURCE), 1);
        assert!(!access.is_authenticated().await);
    }

    #[tokio::test]
    async fn test_next_call_recovers_after_failed_refresh() {
        let transport = Arc::new(ScriptedTransport::new());
        transport
            .reply(TOKEN_PATH, Reply::failure(AccessError::transport("connection reset")))
            .reply(TOKEN_PATH, token_reply("recovered"))
            .reply(RESOURCE, Reply::status(200));
        let access = access(&transport, None);

        let err = access.execute(&resource_request(), TIMEOUT).await.unwrap_err();
        assert!(err.is_retryable());

        let response = access.execute(&resource_request(), TIMEOUT).await.unwrap();
        assert_eq!(response.status_code(), 200);
        assert_eq!(access.refresh_count(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_calls_coalesce_into_one_refresh() {
        let transport = Arc::new(ScriptedTransport::new());
        transport
            .reply(TOKEN_PATH, token_reply("shared").delayed(Duration::from_millis(50)))
            .reply(RESOURCE, Reply::status(200));
        let access = Arc::new(access(&transport, None));

        let calls: Vec<_> = (0..10)
            .map(|_| {
                let access = access.clone();
                tokio::spawn(async move { access.execute(&resource_request(), TIMEOUT).await })
            })
            .collect();

        for call in calls {
            assert_eq!(call.await.unwrap().unwrap().status_code(), 200);
        }

        assert_eq!(transport.count(TOKEN_PATH), 1);
        assert_eq!(access.refresh_count(), 1);
        assert!(authorizations(&transport, RESOURCE)
            .iter()
            .all(|a| a == "Bearer shared"));
    }

    #[tokio::test]
    async fn test_concurrent_401s_coalesce_into_one_refresh() {
        let transport = Arc::new(ScriptedTransport::new());
        transport
            .reply(TOKEN_PATH, token_reply("fresh").delayed(Duration::from_millis(50)))
            .reply(RESOURCE, Reply::status(401));
        let access = Arc::new(access(&transport, Some("stale")));

        let calls: Vec<_> = (0..8)
            .map(|_| {
                let access = access.clone();
                tokio::spawn(async move { access.execute(&resource_request(), TIMEOUT).await })
            })
            .collect();

        for call in calls {
            // The scripted resource keeps answering 401; each call still ends after one retry
            assert_eq!(call.await.unwrap().unwrap().status_code(), 401);
        }

        assert_eq!(transport.count(TOKEN_PATH), 1);

        // Calls that saw the refresh in flight skip the stale attempt
        let sent = authorizations(&transport, RESOURCE);
        let stale = sent.iter().filter(|a| *a == "Bearer stale").count();
        assert!(stale >= 1);
        assert_eq!(sent.len(), 8 + stale);
        assert!(sent.iter().all(|a| a == "Bearer stale" || a == "Bearer fresh"));
    }

    #[tokio::test]
    async fn test_call_during_refresh_is_signed_with_new_token() {
        let transport = Arc::new(ScriptedTransport::new());
        transport
            .reply(TOKEN_PATH, token_reply("fresh").delayed(Duration::from_millis(300)))
            .reply(RESOURCE, Reply::status(401))
            .reply(RESOURCE, Reply::status(200));
        let access = Arc::new(access(&transport, Some("stale")));

        let first = {
            let access = access.clone();
            tokio::spawn(async move { access.execute(&resource_request(), TIMEOUT).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Starts while the 401 recovery of the first call is refreshing
        let second = access.execute(&resource_request(), TIMEOUT).await.unwrap();
        assert_eq!(second.status_code(), 200);
        assert_eq!(first.await.unwrap().unwrap().status_code(), 200);

        assert_eq!(access.refresh_count(), 1);
        assert_eq!(
            authorizations(&transport, RESOURCE),
            vec!["Bearer stale", "Bearer fresh", "Bearer fresh"]
        );
    }

    #[tokio::test]
    async fn test_timed_out_refresh_leaves_unauthenticated() {
        let transport = Arc::new(ScriptedTransport::new());
        transport
            .reply(TOKEN_PATH, token_reply("late").delayed(Duration::from_millis(300)))
            .reply(RESOURCE, Reply::status(200));
        let access = access(&transport, None);

        let err = access
            .execute(&resource_request(), Duration::from_millis(20))
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert!(!access.is_authenticated().await);
        assert_eq!(transport.count(RESOURCE), 0);
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.reply(RESOURCE, Reply::status(200).delayed(Duration::from_millis(300)));
        let access = access(&transport, Some("current"));

        let err = access
            .execute(&resource_request(), Duration::from_millis(20))
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        // A slow resource says nothing about the token
        assert!(access.is_authenticated().await);
    }

    #[tokio::test]
    async fn test_token_type_from_endpoint_is_used() {
        let transport = Arc::new(ScriptedTransport::new());
        transport
            .reply(TOKEN_PATH, Reply::json(200, json!({"access_token": "abc", "token_type": "OAuth"})))
            .reply(RESOURCE, Reply::status(200));
        let access = access(&transport, None);

        access.execute(&resource_request(), TIMEOUT).await.unwrap();
        assert_eq!(authorizations(&transport, RESOURCE), vec!["OAuth abc"]);
    }

    #[tokio::test]
    async fn test_authenticate_and_invalidate() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.reply(
            TOKEN_PATH,
            Reply::json(200, json!({"access_token": "t", "instance_url": "https://na7.example.com"})),
        );
        let access = access(&transport, None);

        access.authenticate(TIMEOUT).await.unwrap();
        assert!(access.is_authenticated().await);
        assert!(access.token_issued_at().await.is_some());
        assert_eq!(access.instance_url().await.as_str(), "https://na7.example.com/");

        access.invalidate().await;
        assert!(!access.is_authenticated().await);
    }
}
