use anyhow::{Context, Result};
use clap::Parser;
use reqwest::Method;
use std::time::Duration;

use crate::auth::AccessConfig;
use crate::transport::{parse_http_url, OutboundRequest};

/// Authenticated REST client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Base URL of the REST API instance
    #[arg(short = 'i', long, env = "INSTANCE_URL")]
    pub instance_url: Option<String>,

    /// Authorization server for the refresh grant (defaults to the instance URL)
    #[arg(long, env = "LOGIN_URL")]
    pub login_url: Option<String>,

    /// OAuth2 client (consumer) id
    #[arg(short = 'c', long, env = "CLIENT_ID")]
    pub client_id: Option<String>,

    /// OAuth2 refresh token
    #[arg(short = 't', long, env = "REFRESH_TOKEN", hide_env_values = true)]
    pub refresh_token: Option<String>,

    /// REST API version used for the default path
    #[arg(long, env = "API_VERSION", default_value = "61.0")]
    pub api_version: String,

    /// User-Agent sent with every request
    #[arg(long, env = "USER_AGENT")]
    pub user_agent: Option<String>,

    /// HTTP method
    #[arg(short = 'X', long, default_value = "GET")]
    pub method: String,

    /// Path relative to the instance URL (defaults to /services/data/v<API_VERSION>/)
    #[arg(short = 'p', long)]
    pub path: Option<String>,

    /// Request body
    #[arg(short = 'd', long)]
    pub data: Option<String>,

    /// Extra request header, "Name: value" (repeatable)
    #[arg(short = 'H', long = "header")]
    pub headers: Vec<String>,

    /// Print response status and headers before the body
    #[arg(long)]
    pub include: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    /// Timeout for each network operation in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "30")]
    pub http_timeout: u64,
}

#[derive(Clone, Debug)]
pub struct Config {
    // Session
    pub instance_url: String,
    pub login_url: Option<String>,
    pub client_id: String,
    pub refresh_token: String,
    pub api_version: String,
    pub user_agent: String,

    // Request
    pub method: Method,
    pub path: String,
    pub body: Option<String>,
    pub headers: Vec<(String, String)>,
    pub include_headers: bool,

    // HTTP client
    pub http_max_connections: usize,
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,

    // Logging
    pub log_level: String,
    pub log_format: LogFormat,
}

#[derive(Clone, Debug, PartialEq)]
pub enum LogFormat {
    Text,
    Json,
}

impl Config {
    /// Load configuration from all sources with priority: CLI > ENV > defaults
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        Self::from_args(CliArgs::parse())
    }

    /// Resolve parsed arguments into a configuration
    pub fn from_args(args: CliArgs) -> Result<Self> {
        let api_version = args.api_version;

        let headers = args
            .headers
            .iter()
            .map(|h| parse_header(h))
            .collect::<Result<Vec<_>>>()?;

        let config = Config {
            instance_url: args
                .instance_url
                .context("INSTANCE_URL is required (use -i or set INSTANCE_URL env var)")?,

            login_url: args.login_url.filter(|s| !s.trim().is_empty()),

            client_id: args
                .client_id
                .context("CLIENT_ID is required (use -c or set CLIENT_ID env var)")?,

            refresh_token: args
                .refresh_token
                .context("REFRESH_TOKEN is required (use -t or set REFRESH_TOKEN env var)")?,

            user_agent: args.user_agent.unwrap_or_else(default_user_agent),

            method: parse_method(&args.method)?,

            path: args
                .path
                .unwrap_or_else(|| default_resource_path(&api_version)),

            body: args.data,
            headers,
            include_headers: args.include,

            http_max_connections: std::env::var("HTTP_MAX_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(20),

            http_connect_timeout: std::env::var("HTTP_CONNECT_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(30),

            http_request_timeout: args.http_timeout,

            log_level: args.log_level,
            log_format: parse_log_format(&args.log_format),

            api_version,
        };

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        parse_http_url("INSTANCE_URL", &self.instance_url)?;
        if let Some(ref login_url) = self.login_url {
            parse_http_url("LOGIN_URL", login_url)?;
        }

        if self.client_id.trim().is_empty() {
            anyhow::bail!("CLIENT_ID must not be empty");
        }
        if self.refresh_token.trim().is_empty() {
            anyhow::bail!("REFRESH_TOKEN must not be empty");
        }
        if !self.path.starts_with('/') {
            anyhow::bail!("Request path must start with '/': {}", self.path);
        }
        if self.http_request_timeout == 0 {
            anyhow::bail!("HTTP_REQUEST_TIMEOUT must be at least 1 second");
        }

        Ok(())
    }

    /// Settings for the access layer
    pub fn access_config(&self) -> AccessConfig {
        AccessConfig {
            instance_url: self.instance_url.clone(),
            login_url: self.login_url.clone(),
            client_id: self.client_id.clone(),
            refresh_token: self.refresh_token.clone(),
            access_token: None,
            user_agent: self.user_agent.clone(),
        }
    }

    /// Per-operation network timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.http_request_timeout)
    }

    /// Build the configured request against `instance_url`
    pub fn build_request(&self, instance_url: &str) -> Result<OutboundRequest> {
        let url = format!("{}{}", instance_url.trim_end_matches('/'), self.path);
        let mut request = OutboundRequest::new(self.method.clone(), &url)?;

        for (name, value) in &self.headers {
            request = request.header(name, value)?;
        }

        if let Some(ref body) = self.body {
            if request.header_value("content-type").is_none() {
                request = request.header("content-type", "application/json")?;
            }
            request = request.body(body.clone());
        }

        Ok(request)
    }
}

/// Versioned REST resource root
fn default_resource_path(api_version: &str) -> String {
    format!("/services/data/v{}/", api_version.trim_start_matches('v'))
}

fn default_user_agent() -> String {
    format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}

/// Parse an HTTP method name
fn parse_method(s: &str) -> Result<Method> {
    Method::from_bytes(s.trim().to_uppercase().as_bytes())
        .with_context(|| format!("Invalid HTTP method: {}", s))
}

/// Parse a "Name: value" header argument
fn parse_header(s: &str) -> Result<(String, String)> {
    let (name, value) = s
        .split_once(':')
        .with_context(|| format!("Header must look like 'Name: value': {}", s))?;
    let name = name.trim();
    if name.is_empty() {
        anyhow::bail!("Header name is empty: {}", s);
    }
    Ok((name.to_string(), value.trim().to_string()))
}

/// Parse log format from string
fn parse_log_format(s: &str) -> LogFormat {
    match s.to_lowercase().as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    }
}
