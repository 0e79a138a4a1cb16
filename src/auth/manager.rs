use chrono::{DateTime, Utc};
use reqwest::Url;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

use super::credentials;
use super::refresh::TokenEndpointClient;
use super::types::{AccessConfig, AccessToken, Credentials};
use crate::error::{AccessError, Result};
use crate::transport::HttpTransport;

/// Token a request was signed with, tagged with the refresh epoch it
/// belongs to
#[derive(Debug, Clone)]
pub struct TokenSnapshot {
    pub token: AccessToken,
    pub epoch: u64,
}

/// Mutable session state guarded by one lock
struct Session {
    credentials: Credentials,

    /// Bumped every time a refresh attempt completes or the token is dropped
    epoch: u64,

    /// Outcome of the most recent refresh if it failed
    last_failure: Option<AccessError>,
}

/// Authentication manager
/// Owns the access token and makes sure only one refresh runs at a time
pub struct AuthManager {
    session: RwLock<Session>,

    /// Held for the whole duration of a refresh grant
    refresh_gate: Mutex<()>,

    /// Client for refresh requests
    endpoint: TokenEndpointClient,

    /// Number of refresh grants actually sent
    refresh_count: AtomicU64,
}

impl AuthManager {
    /// Create a manager from validated configuration
    pub fn new(config: &AccessConfig, transport: Arc<dyn HttpTransport>) -> Result<Self> {
        let credentials = credentials::from_config(config)?;
        tracing::debug!(
            "Auth manager created for {} (pre-authenticated: {})",
            credentials.instance_url,
            credentials.is_authenticated()
        );

        Ok(Self {
            session: RwLock::new(Session {
                credentials,
                epoch: 0,
                last_failure: None,
            }),
            refresh_gate: Mutex::new(()),
            endpoint: TokenEndpointClient::new(transport, config.user_agent.clone()),
            refresh_count: AtomicU64::new(0),
        })
    }

    /// Get the current token, authenticating first if there is none
    ///
    /// While a refresh is in flight the token it is replacing is not handed
    /// out; the caller waits for the refresh and gets its outcome.
    pub async fn current_token(&self, timeout: Duration) -> Result<TokenSnapshot> {
        match self.refresh_gate.try_lock() {
            Ok(idle) => drop(idle),
            Err(_) => return self.await_refresh(timeout).await,
        }

        let observed = {
            let session = self.session.read().await;
            if let Some(ref token) = session.credentials.access_token {
                return Ok(TokenSnapshot {
                    token: token.clone(),
                    epoch: session.epoch,
                });
            }
            session.epoch
        };

        tracing::debug!("No access token yet, authenticating...");
        self.refresh_after(observed, timeout).await
    }

    /// Replace the token observed at `stale_epoch`
    ///
    /// If another caller finished a refresh after that epoch, its outcome is
    /// reused instead of sending a second grant.
    pub async fn refresh_after(&self, stale_epoch: u64, timeout: Duration) -> Result<TokenSnapshot> {
        let _gate = self.refresh_gate.lock().await;

        if let Some(outcome) = self.completed_since(stale_epoch).await {
            tracing::debug!("Reusing refresh completed by a concurrent request");
            return outcome;
        }

        self.refresh_locked(timeout).await
    }

    /// Wait for the refresh holding the gate and take its outcome
    async fn await_refresh(&self, timeout: Duration) -> Result<TokenSnapshot> {
        tracing::debug!("Refresh in flight, waiting for it...");
        let _gate = self.refresh_gate.lock().await;

        {
            let session = self.session.read().await;
            if let Some(ref token) = session.credentials.access_token {
                return Ok(TokenSnapshot {
                    token: token.clone(),
                    epoch: session.epoch,
                });
            }
            if let Some(ref failure) = session.last_failure {
                return Err(failure.clone());
            }
        }

        // Token was dropped without a refresh; do one ourselves
        self.refresh_locked(timeout).await
    }

    /// Force a refresh now, coalescing with one already in flight
    pub async fn force_refresh(&self, timeout: Duration) -> Result<TokenSnapshot> {
        let observed = self.session.read().await.epoch;
        self.refresh_after(observed, timeout).await
    }

    /// Outcome of a refresh that finished after `epoch`, if there was one
    async fn completed_since(&self, epoch: u64) -> Option<Result<TokenSnapshot>> {
        let session = self.session.read().await;
        if session.epoch == epoch {
            return None;
        }

        match (&session.credentials.access_token, &session.last_failure) {
            (Some(token), _) => Some(Ok(TokenSnapshot {
                token: token.clone(),
                epoch: session.epoch,
            })),
            (None, Some(failure)) => Some(Err(failure.clone())),
            // Token was dropped without a refresh; do one ourselves
            (None, None) => None,
        }
    }

    /// Send the refresh grant. Caller must hold `refresh_gate`.
    async fn refresh_locked(&self, timeout: Duration) -> Result<TokenSnapshot> {
        let (login_url, client_id, refresh_token) = {
            let session = self.session.read().await;
            let creds = &session.credentials;
            (
                creds.login_url.clone(),
                creds.client_id.clone(),
                creds.refresh_token().to_string(),
            )
        };

        tracing::info!("Refreshing access token via {}...", login_url);
        self.refresh_count.fetch_add(1, Ordering::SeqCst);

        let result = self
            .endpoint
            .refresh(login_url.as_str(), &client_id, &refresh_token, timeout)
            .await;

        // Nothing is written until the grant has fully completed
        let mut session = self.session.write().await;
        session.epoch += 1;

        match result {
            Ok(response) => {
                session.credentials.apply(response);
                session.last_failure = None;
                let token = session
                    .credentials
                    .access_token
                    .clone()
                    .ok_or_else(|| AccessError::Protocol("refresh produced no token".to_string()))?;
                tracing::info!(
                    "✅ Access token refreshed (token: {}...)",
                    token.preview()
                );
                Ok(TokenSnapshot {
                    token,
                    epoch: session.epoch,
                })
            }
            Err(e) => {
                tracing::error!("Token refresh failed: {}", e);
                session.credentials.access_token = None;
                session.last_failure = Some(e.clone());
                Err(e)
            }
        }
    }

    /// Drop the current token; the next request re-authenticates
    pub async fn invalidate(&self) {
        let mut session = self.session.write().await;
        if session.credentials.access_token.take().is_some() {
            tracing::debug!("Access token invalidated");
        }
        session.epoch += 1;
        session.last_failure = None;
    }

    pub async fn is_authenticated(&self) -> bool {
        self.session.read().await.credentials.is_authenticated()
    }

    /// Resource-facing base URL, as last reported by the token endpoint
    pub async fn instance_url(&self) -> Url {
        self.session.read().await.credentials.instance_url.clone()
    }

    pub async fn token_issued_at(&self) -> Option<DateTime<Utc>> {
        self.session.read().await.credentials.token_issued_at()
    }

    /// Number of refresh grants sent since creation
    pub fn refresh_count(&self) -> u64 {
        self.refresh_count.load(Ordering::SeqCst)
    }
}
