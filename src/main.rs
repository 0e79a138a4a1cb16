use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;

use rest_access::config::{Config, LogFormat};
use rest_access::{AuthenticatedAccess, ReqwestTransport};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (for log level)
    let config = Config::load()?;
    config.validate()?;

    init_logging(&config);

    tracing::info!("🚀 REST access starting...");
    tracing::debug!("Instance: {}", config.instance_url);

    let transport = Arc::new(
        ReqwestTransport::new(
            config.http_max_connections,
            Duration::from_secs(config.http_connect_timeout),
        )
        .context("Failed to create HTTP transport")?,
    );
    tracing::debug!("HTTP transport initialized with connection pooling");

    let access = Arc::new(
        AuthenticatedAccess::new(config.access_config(), transport)
            .context("Invalid access configuration")?,
    );

    let timeout = config.request_timeout();

    tracing::info!("Initializing authentication...");
    if let Err(e) = access.authenticate(timeout).await {
        tracing::error!("❌ Authentication failed: {}", e);
        tracing::error!("");
        tracing::error!("🔧 Troubleshooting steps:");
        tracing::error!("   1. Check your network connection");
        tracing::error!("   2. Verify CLIENT_ID and REFRESH_TOKEN are valid");
        tracing::error!("   3. Set LOGIN_URL if the token endpoint is not on the instance");
        tracing::error!("");
        anyhow::bail!("Startup failed: unable to obtain an access token");
    }

    // The token endpoint may have moved the session to another instance
    let instance_url = access.instance_url().await;
    let request = config.build_request(instance_url.as_str())?;

    tracing::info!("{} {}", request.method(), request.url());
    let response = access
        .execute(&request, timeout)
        .await
        .with_context(|| format!("{} {} failed", request.method(), request.url()))?;

    let status = response.status_code();
    if config.include_headers {
        println!("HTTP {}", status);
        for (name, value) in response.headers() {
            println!("{}: {}", name, value.to_str().unwrap_or("<binary>"));
        }
        println!();
    }

    let body = response
        .body_text()
        .await
        .context("Failed to read response body")?;
    if !body.is_empty() {
        println!("{}", body);
    }

    tracing::info!(
        "Completed with status {} ({} token refreshes)",
        status,
        access.refresh_count()
    );

    ensure_success(status)
}

/// Turn a non-2xx status into the process error
fn ensure_success(status: u16) -> Result<()> {
    if !(200..300).contains(&status) {
        anyhow::bail!("Request failed with status {}", status);
    }
    Ok(())
}

/// Initialize tracing with the configured level and format
fn init_logging(config: &Config) {
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    // Logs go to stderr so the response body can be piped
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true);

    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}
