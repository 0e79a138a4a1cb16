// HTTP transport capability
// The access core only talks to the network through `HttpTransport`

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, Url};
use serde::Serialize;
use std::time::Duration;

use crate::error::{AccessError, Result};

/// One-shot response body stream
pub type BodyStream = BoxStream<'static, Result<Bytes>>;

/// A caller-constructed HTTP request
///
/// Header names are case-insensitive and setting a header twice keeps the
/// last value. The access core never mutates a request it is given; it signs
/// a copy.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Option<Bytes>,
}

impl OutboundRequest {
    /// Create a request for an absolute http(s) URL
    pub fn new(method: Method, url: &str) -> Result<Self> {
        Ok(Self {
            method,
            url: parse_http_url("request url", url)?,
            headers: HeaderMap::new(),
            body: None,
        })
    }

    pub fn get(url: &str) -> Result<Self> {
        Self::new(Method::GET, url)
    }

    pub fn head(url: &str) -> Result<Self> {
        Self::new(Method::HEAD, url)
    }

    pub fn post(url: &str) -> Result<Self> {
        Self::new(Method::POST, url)
    }

    pub fn put(url: &str) -> Result<Self> {
        Self::new(Method::PUT, url)
    }

    pub fn patch(url: &str) -> Result<Self> {
        Self::new(Method::PATCH, url)
    }

    pub fn delete(url: &str) -> Result<Self> {
        Self::new(Method::DELETE, url)
    }

    /// Set a header, replacing any previous value for the same name
    pub fn header(mut self, name: &str, value: &str) -> Result<Self> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| AccessError::InvalidArgument(format!("invalid header name '{}': {}", name, e)))?;
        let value = HeaderValue::from_str(value).map_err(|e| {
            AccessError::InvalidArgument(format!("invalid value for header '{}': {}", name, e))
        })?;
        self.headers.insert(name, value);
        Ok(self)
    }

    /// Attach a raw body
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Attach a JSON body and set `Content-Type: application/json`
    pub fn json<T: Serialize + ?Sized>(self, value: &T) -> Result<Self> {
        let body = serde_json::to_vec(value)
            .map_err(|e| AccessError::InvalidArgument(format!("body is not serializable: {}", e)))?;
        Ok(self.header("content-type", "application/json")?.body(body))
    }

    /// Attach a form-encoded body
    pub fn form<T: Serialize + ?Sized>(self, value: &T) -> Result<Self> {
        let body = serde_urlencoded::to_string(value)
            .map_err(|e| AccessError::InvalidArgument(format!("form is not encodable: {}", e)))?;
        Ok(self
            .header("content-type", "application/x-www-form-urlencoded")?
            .body(body))
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Case-insensitive header lookup
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn body_bytes(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// Copy of this request with `Authorization` overwritten and a default
    /// `User-Agent` filled in when the caller did not set one
    pub(crate) fn signed(&self, authorization: HeaderValue, user_agent: &HeaderValue) -> Self {
        let mut signed = self.clone();
        signed
            .headers
            .insert(reqwest::header::AUTHORIZATION, authorization);
        if !signed.headers.contains_key(reqwest::header::USER_AGENT) {
            signed
                .headers
                .insert(reqwest::header::USER_AGENT, user_agent.clone());
        }
        signed
    }
}

/// Raw response handed back by a transport
pub struct RawResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: BodyStream,
}

impl RawResponse {
    pub fn new(status: u16, headers: HeaderMap, body: BodyStream) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// Response whose body is already in memory
    pub fn from_bytes(status: u16, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        let body: Bytes = body.into();
        Self::new(status, headers, futures::stream::once(async move { Ok(body) }).boxed())
    }
}

impl std::fmt::Debug for RawResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Network capability consumed by the access core
///
/// Implementations own connection pooling, TLS and redirects. They must
/// return `AccessError::Transport` for network-level failures and must not
/// interpret HTTP status codes.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: &OutboundRequest, timeout: Duration) -> Result<RawResponse>;
}

/// Send through a transport, enforcing the deadline regardless of whether
/// the transport honours it
pub async fn send_with_deadline(
    transport: &dyn HttpTransport,
    request: &OutboundRequest,
    timeout: Duration,
) -> Result<RawResponse> {
    match tokio::time::timeout(timeout, transport.send(request, timeout)).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(
                method = %request.method(),
                url = %request.url(),
                timeout_ms = timeout.as_millis() as u64,
                "Request deadline exceeded"
            );
            Err(AccessError::timed_out(format!(
                "{} {} timed out after {}ms",
                request.method(),
                request.url(),
                timeout.as_millis()
            )))
        }
    }
}

/// Parse an absolute http(s) URL
pub fn parse_http_url(label: &str, value: &str) -> Result<Url> {
    let url = Url::parse(value)
        .map_err(|e| AccessError::InvalidArgument(format!("{} '{}' is not a valid URL: {}", label, value, e)))?;

    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(AccessError::InvalidArgument(format!(
                "{} '{}' must use http or https, not '{}'",
                label, value, other
            )))
        }
    }

    if url.host_str().map_or(true, str::is_empty) {
        return Err(AccessError::InvalidArgument(format!(
            "{} '{}' has no host",
            label, value
        )));
    }

    Ok(url)
}

/// Production transport backed by a pooled reqwest client
pub struct ReqwestTransport {
    /// Shared HTTP client with connection pooling
    client: Client,
}

impl ReqwestTransport {
    /// Create a transport with the given pool size and connect timeout
    pub fn new(max_connections: usize, connect_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(max_connections)
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| AccessError::transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client })
    }

    /// Wrap an already configured client
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: &OutboundRequest, timeout: Duration) -> Result<RawResponse> {
        tracing::debug!(
            method = %request.method(),
            url = %request.url(),
            "Sending HTTP request"
        );

        let mut builder = self
            .client
            .request(request.method().clone(), request.url().clone())
            .headers(request.headers().clone())
            .timeout(timeout);
        if let Some(body) = request.body_bytes() {
            builder = builder.body(body.clone());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| classify_error(e, request.url()))?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();

        tracing::debug!(status = status, "Received HTTP response");

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| AccessError::BodyRead(e.to_string())))
            .boxed();

        Ok(RawResponse::new(status, headers, body))
    }
}

/// Categorize a reqwest error for logging and map it to the taxonomy
fn classify_error(e: reqwest::Error, url: &Url) -> AccessError {
    let error_kind = if e.is_timeout() {
        "timeout"
    } else if e.is_connect() {
        "connection_failed"
    } else if e.is_request() {
        "request_error"
    } else if e.is_body() {
        "body_error"
    } else if e.is_decode() {
        "decode_error"
    } else {
        "unknown"
    };

    tracing::warn!(
        error_kind = error_kind,
        error = %e,
        url = %url,
        "HTTP request error"
    );

    let message = format!("HTTP request failed: {} (kind: {})", e, error_kind);
    if e.is_timeout() {
        AccessError::timed_out(message)
    } else {
        AccessError::transport(message)
    }
}

/// Scripted in-memory transport for tests
#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// A canned reply for one request
    #[derive(Debug, Clone)]
    pub struct Reply {
        status: u16,
        headers: Vec<(String, String)>,
        chunks: Vec<Bytes>,
        body_error: Option<String>,
        stall: bool,
        failure: Option<AccessError>,
        delay: Option<Duration>,
    }

    impl Reply {
        pub fn status(status: u16) -> Self {
            Self {
                status,
                headers: Vec::new(),
                chunks: Vec::new(),
                body_error: None,
                stall: false,
                failure: None,
                delay: None,
            }
        }

        /// JSON reply with `Content-Type: application/json`
        pub fn json(status: u16, value: serde_json::Value) -> Self {
            Self::status(status)
                .header("content-type", "application/json")
                .body(value.to_string())
        }

        /// The transport fails instead of producing a response
        pub fn failure(error: AccessError) -> Self {
            let mut reply = Self::status(0);
            reply.failure = Some(error);
            reply
        }

        pub fn header(mut self, name: &str, value: &str) -> Self {
            self.headers.push((name.to_string(), value.to_string()));
            self
        }

        /// Append a body chunk
        pub fn body(mut self, chunk: impl Into<String>) -> Self {
            self.chunks.push(Bytes::from(chunk.into()));
            self
        }

        /// Make the body stream fail after the chunks already added
        pub fn broken_body(mut self, message: &str) -> Self {
            self.body_error = Some(message.to_string());
            self
        }

        /// Make the body stream hang after the chunks already added
        pub fn stalled_body(mut self) -> Self {
            self.stall = true;
            self
        }

        /// Hold the reply back for `delay`
        pub fn delayed(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        fn into_response(self) -> Result<RawResponse> {
            if let Some(failure) = self.failure {
                return Err(failure);
            }

            let mut headers = HeaderMap::new();
            for (name, value) in &self.headers {
                let name = HeaderName::from_bytes(name.as_bytes())
                    .map_err(|e| AccessError::InvalidArgument(e.to_string()))?;
                let value = HeaderValue::from_str(value)
                    .map_err(|e| AccessError::InvalidArgument(e.to_string()))?;
                headers.append(name, value);
            }

            let mut items: Vec<Result<Bytes>> = self.chunks.into_iter().map(Ok).collect();
            if let Some(message) = self.body_error {
                items.push(Err(AccessError::BodyRead(message)));
            }

            let body = futures::stream::iter(items);
            let body = if self.stall {
                body.chain(futures::stream::pending()).boxed()
            } else {
                body.boxed()
            };

            Ok(RawResponse::new(self.status, headers, body))
        }
    }

    struct Route {
        path: String,
        replies: VecDeque<Reply>,
    }

    /// Transport that replays scripted replies per URL path and records
    /// every request it sees
    ///
    /// Replies for a path are consumed in order; the last one repeats.
    #[derive(Default)]
    pub struct ScriptedTransport {
        routes: Mutex<Vec<Route>>,
        sent: Mutex<Vec<OutboundRequest>>,
    }

    impl ScriptedTransport {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue a reply for requests whose URL path equals `path`
        pub fn reply(&self, path: &str, reply: Reply) -> &Self {
            let mut routes = self.routes.lock().expect("routes lock poisoned");
            match routes.iter_mut().find(|r| r.path == path) {
                Some(route) => route.replies.push_back(reply),
                None => routes.push(Route {
                    path: path.to_string(),
                    replies: VecDeque::from([reply]),
                }),
            }
            self
        }

        /// Every request sent so far, in order
        pub fn requests(&self) -> Vec<OutboundRequest> {
            self.sent.lock().expect("sent lock poisoned").clone()
        }

        /// Number of requests sent to `path`
        pub fn count(&self, path: &str) -> usize {
            self.sent
                .lock()
                .expect("sent lock poisoned")
                .iter()
                .filter(|r| r.url().path() == path)
                .count()
        }

        fn next_reply(&self, path: &str) -> Option<Reply> {
            let mut routes = self.routes.lock().expect("routes lock poisoned");
            let route = routes.iter_mut().find(|r| r.path == path)?;
            if route.replies.len() > 1 {
                route.replies.pop_front()
            } else {
                route.replies.front().cloned()
            }
        }
    }

    #[async_trait]
    impl HttpTransport for ScriptedTransport {
        async fn send(&self, request: &OutboundRequest, _timeout: Duration) -> Result<RawResponse> {
            self.sent
                .lock()
                .expect("sent lock poisoned")
                .push(request.clone());

            let reply = self.next_reply(request.url().path()).ok_or_else(|| {
                AccessError::transport(format!("no scripted reply for {}", request.url()))
            })?;

            if let Some(delay) = reply.delay {
                tokio::time::sleep(delay).await;
            }

            reply.into_response()
        }
    }
}
