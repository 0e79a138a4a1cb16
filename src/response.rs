// Buffered response envelope
// The body stream is drained once and every later read sees the cached buffer

use bytes::{Bytes, BytesMut};
use encoding_rs::Encoding;
use futures::StreamExt;
use reqwest::header::HeaderMap;
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, OnceCell};

use crate::error::{AccessError, Result};
use crate::transport::{BodyStream, RawResponse};

/// HTTP response with a single-read-safe body
///
/// Status and headers are available immediately. The body is pulled from the
/// transport on first access and cached, including a failed read, so every
/// accessor (and every concurrent caller) observes the same outcome.
pub struct ResponseEnvelope {
    status: u16,
    headers: HeaderMap,
    stream: Mutex<Option<BodyStream>>,
    body: OnceCell<Result<Bytes>>,
}

impl ResponseEnvelope {
    pub fn new(raw: RawResponse) -> Self {
        Self {
            status: raw.status,
            headers: raw.headers,
            stream: Mutex::new(Some(raw.body)),
            body: OnceCell::new(),
        }
    }

    pub fn status_code(&self) -> u16 {
        self.status
    }

    /// True for 2xx statuses
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Case-insensitive header lookup. Non-text values are reported as absent.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Charset declared in `Content-Type`, if any
    pub fn charset(&self) -> Option<String> {
        let content_type = self.header("content-type")?;
        content_type
            .split(';')
            .skip(1)
            .filter_map(|param| param.split_once('='))
            .find(|(key, _)| key.trim().eq_ignore_ascii_case("charset"))
            .map(|(_, value)| value.trim().trim_matches('"').to_ascii_lowercase())
    }

    /// The full body. Drains the transport stream on first call.
    pub async fn body_bytes(&self) -> Result<Bytes> {
        self.body.get_or_init(|| self.drain()).await.clone()
    }

    /// Body decoded with the `Content-Type` charset, UTF-8 when none is declared
    pub async fn body_text(&self) -> Result<String> {
        let charset = self.charset().unwrap_or_else(|| "utf-8".to_string());
        self.body_text_with(&charset).await
    }

    /// Body decoded with an explicit charset
    ///
    /// Accepts any WHATWG encoding label (`utf-8`, `iso-8859-1`,
    /// `shift_jis`, ...). Unknown labels fail with `InvalidArgument`.
    pub async fn body_text_with(&self, charset: &str) -> Result<String> {
        let bytes = self.body_bytes().await?;
        decode(&bytes, charset)
    }

    /// Body parsed as JSON
    pub async fn body_json<T: DeserializeOwned>(&self) -> Result<T> {
        let bytes = self.body_bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| {
            AccessError::Protocol(format!("response body is not the expected JSON: {}", e))
        })
    }

    async fn drain(&self) -> Result<Bytes> {
        // Taken exactly once; only a cancelled first read can leave it empty
        let Some(mut stream) = self.stream.lock().await.take() else {
            return Err(AccessError::BodyRead(
                "body stream was consumed by an interrupted read".to_string(),
            ));
        };

        let mut buffer = BytesMut::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(chunk) => buffer.extend_from_slice(&chunk),
                Err(e) => {
                    let message = match e {
                        AccessError::BodyRead(message) => message,
                        other => other.to_string(),
                    };
                    tracing::warn!(
                        status = self.status,
                        bytes_read = buffer.len(),
                        error = %message,
                        "Response body stream failed"
                    );
                    return Err(AccessError::BodyRead(message));
                }
            }
        }

        tracing::trace!(status = self.status, bytes = buffer.len(), "Response body buffered");
        Ok(buffer.freeze())
    }
}

impl std::fmt::Debug for ResponseEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseEnvelope")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("buffered", &self.body.initialized())
            .finish()
    }
}

/// Decode bytes with a WHATWG encoding label
fn decode(bytes: &[u8], charset: &str) -> Result<String> {
    let encoding = Encoding::for_label(charset.trim().as_bytes()).ok_or_else(|| {
        AccessError::InvalidArgument(format!("unsupported charset '{}'", charset.trim()))
    })?;

    let (text, had_errors) = encoding.decode_without_bom_handling(bytes);
    if had_errors {
        tracing::debug!(
            charset = encoding.name(),
            "Response body had invalid sequences, replaced with U+FFFD"
        );
    }
    Ok(text.into_owned())
}
