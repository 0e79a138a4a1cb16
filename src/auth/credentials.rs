// Credential validation
// Turns caller-supplied settings into a checked credential set

use chrono::Utc;

use super::types::{AccessConfig, AccessToken, Credentials, DEFAULT_TOKEN_TYPE};
use crate::error::{AccessError, Result};
use crate::transport::parse_http_url;

/// Build credentials from configuration, failing fast on bad input
pub fn from_config(config: &AccessConfig) -> Result<Credentials> {
    let instance_url = parse_http_url("instance_url", &config.instance_url)?;
    let login_url = match config.login_url.as_deref() {
        Some(url) => parse_http_url("login_url", url)?,
        None => instance_url.clone(),
    };

    require_non_empty("client_id", &config.client_id)?;
    require_non_empty("refresh_token", &config.refresh_token)?;

    let access_token = match config.access_token.as_deref() {
        Some(token) => {
            require_non_empty("access_token", token)?;
            Some(AccessToken {
                value: token.to_string(),
                token_type: DEFAULT_TOKEN_TYPE.to_string(),
                issued_at: Utc::now(),
            })
        }
        None => None,
    };

    Ok(Credentials::new(
        instance_url,
        login_url,
        config.client_id.clone(),
        config.refresh_token.clone(),
        access_token,
    ))
}

/// Reject empty or whitespace-only values
pub fn require_non_empty(name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(AccessError::InvalidArgument(format!("{} must not be empty", name)));
    }
    Ok(())
}
