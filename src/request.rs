//! Request builder: one outbound HTTP round trip.
//!
//! DESIGN
//! ======
//! `RequestBuilder` assembles method, URL, headers, and body, then hands a
//! plain `HttpRequest` to an `HttpTransport`. The transport trait is the seam
//! tests substitute; `ReqwestTransport` is the production implementation.
//! Status classification lives here, not in the transport: non-2xx becomes
//! `RequestFailed`, and the error body is read best-effort.
//!
//! The builder never retries. Retry policy belongs to `Packet`.

use std::fmt;
use std::io::Read;
use std::time::Duration;

use tracing::{debug, error};

use crate::config::{ClientConfig, DEFAULT_USER_AGENT};
use crate::error::ClientError;

/// Responses shorter than this are logged verbatim at debug level.
const RESPONSE_LOG_LIMIT: usize = 1000;

pub const HEADER_USER_AGENT: &str = "User-Agent";
pub const HEADER_CONTENT_TYPE: &str = "Content-Type";
pub const HEADER_CONTENT_LENGTH: &str = "Content-Length";

// =============================================================================
// METHOD / CONTENT TYPE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }

    /// POST and PUT carry a body; GET and DELETE never do.
    #[must_use]
    pub fn has_body(self) -> bool {
        matches!(self, Self::Post | Self::Put)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Method> for reqwest::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => Self::GET,
            Method::Post => Self::POST,
            Method::Put => Self::PUT,
            Method::Delete => Self::DELETE,
        }
    }
}

/// Body kinds. The MIME string for each comes from `ContentTypes` in config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentType {
    Form,
    Json,
    Image,
    Text,
}

impl ContentType {
    #[must_use]
    pub fn default_mime(self) -> &'static str {
        match self {
            Self::Form => "application/x-www-form-urlencoded",
            Self::Json => "application/json",
            Self::Image => "image/jpeg",
            Self::Text => "text/plain",
        }
    }
}

// =============================================================================
// WIRE TYPES
// =============================================================================

/// A fully assembled request, ready for a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    /// Case-insensitive header lookup.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Raw transport response. `body` is `None` when it could not be read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Option<String>,
}

impl HttpResponse {
    #[must_use]
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self { status, body: Some(body.into()) }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

// =============================================================================
// TRANSPORT
// =============================================================================

/// Performs exactly one HTTP round trip. Enables fakes in tests.
#[async_trait::async_trait]
pub trait HttpTransport: Send + Sync {
    /// Send `request` and return the status and body.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Transport`] when no status was received.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, ClientError>;
}

/// `reqwest`-backed transport. User agent, timeouts, and proxy are fixed at construction.
pub struct ReqwestTransport {
    http: reqwest::Client,
}

impl ReqwestTransport {
    /// Build the HTTP client from config.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Config`] for an unusable proxy URL and
    /// [`ClientError::HttpClientBuild`] if the client cannot be built.
    pub fn new(config: &ClientConfig) -> Result<Self, ClientError> {
        let mut builder = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.timeouts.request())
            .connect_timeout(config.timeouts.connect());
        if let Some(proxy_url) = &config.proxy_url {
            let proxy = reqwest::Proxy::all(proxy_url)
                .map_err(|e| ClientError::Config(format!("invalid proxy url '{proxy_url}': {e}")))?;
            builder = builder.proxy(proxy);
        }
        let http = builder
            .build()
            .map_err(|e| ClientError::HttpClientBuild(e.to_string()))?;
        Ok(Self { http })
    }
}

#[async_trait::async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, ClientError> {
        let mut builder = self.http.request(request.method.into(), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response.text().await.ok();
        Ok(HttpResponse { status, body })
    }
}

// =============================================================================
// REQUEST BUILDER
// =============================================================================

/// Assembles and sends a single request.
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    method: Method,
    url: String,
    headers: Vec<(String, String)>,
    form: String,
    body: Option<Vec<u8>>,
    content_type: String,
    timeout: Option<Duration>,
    user_agent: String,
    log_failures: bool,
}

impl RequestBuilder {
    #[must_use]
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            form: String::new(),
            body: None,
            content_type: ContentType::Form.default_mime().to_string(),
            timeout: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            log_failures: true,
        }
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    #[must_use]
    pub fn form_data(&self) -> &str {
        &self.form
    }

    #[must_use]
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Add a header. A later header with the same name (any case) replaces an earlier one.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        merge_header(&mut self.headers, name.into(), value.into());
        self
    }

    #[must_use]
    pub fn headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (name, value) in headers {
            merge_header(&mut self.headers, name.into(), value.into());
        }
        self
    }

    #[must_use]
    pub fn content_type(mut self, mime: impl Into<String>) -> Self {
        self.content_type = mime.into();
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Whether a failed round trip is logged at error level (true) or debug.
    #[must_use]
    pub fn log_failures(mut self, enabled: bool) -> Self {
        self.log_failures = enabled;
        self
    }

    /// Fill the `{prefix}` placeholder of a regional URL (e.g. `bs1-`).
    #[must_use]
    pub fn location_prefix(mut self, prefix: &str) -> Self {
        self.url = self.url.replace("{prefix}", prefix);
        self
    }

    /// Append `key=value` to the form body without encoding the value.
    #[must_use]
    pub fn form_param(mut self, key: &str, value: &str) -> Self {
        if !self.form.is_empty() {
            self.form.push('&');
        }
        self.form.push_str(key);
        self.form.push('=');
        self.form.push_str(value);
        self
    }

    /// Append `key=value` to the form body, URL-encoding the value.
    #[must_use]
    pub fn form_param_encoded(self, key: &str, value: &str) -> Self {
        let encoded = urlencoding::encode(value);
        self.form_param(key, &encoded)
    }

    /// Replace the form body. The data must already be encoded.
    #[must_use]
    pub fn set_form_data(mut self, data: impl Into<String>) -> Self {
        self.form = data.into();
        self
    }

    /// Send raw bytes instead of form data.
    #[must_use]
    pub fn body(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.body = Some(bytes.into());
        self
    }

    /// Drain `reader` and send its contents instead of form data.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidRequest`] if the reader fails.
    pub fn body_reader(mut self, mut reader: impl Read) -> Result<Self, ClientError> {
        let mut bytes = Vec::new();
        reader
            .read_to_end(&mut bytes)
            .map_err(|e| ClientError::InvalidRequest(format!("body stream unreadable: {e}")))?;
        self.body = Some(bytes);
        Ok(self)
    }

    /// Finalize headers and body.
    ///
    /// Defaults go in first so caller headers replace them. `Content-Length`
    /// is computed last from the actual body.
    #[must_use]
    pub fn build(self) -> HttpRequest {
        let mut headers = vec![
            (HEADER_USER_AGENT.to_string(), self.user_agent),
            (HEADER_CONTENT_TYPE.to_string(), self.content_type),
        ];
        for (name, value) in self.headers {
            merge_header(&mut headers, name, value);
        }

        let body = if self.method.has_body() {
            let data = self.body.unwrap_or_else(|| self.form.into_bytes());
            merge_header(&mut headers, HEADER_CONTENT_LENGTH.to_string(), data.len().to_string());
            Some(data)
        } else {
            None
        };

        HttpRequest { method: self.method, url: self.url, headers, body, timeout: self.timeout }
    }

    /// Perform the round trip and return the body text.
    ///
    /// # Errors
    ///
    /// [`ClientError::RequestFailed`] on non-2xx, [`ClientError::Transport`]
    /// when the transport fails or a success body cannot be read.
    pub async fn send(self, transport: &dyn HttpTransport) -> Result<String, ClientError> {
        let log_failures = self.log_failures;
        let request = self.build();
        let method = request.method;
        let url = request.url.clone();

        let header_names: Vec<&str> = request.headers.iter().map(|(k, _)| k.as_str()).collect();
        debug!(
            %method,
            %url,
            headers = ?header_names,
            body_len = request.body.as_ref().map_or(0, Vec::len),
            timeout = ?request.timeout,
            "opening connection"
        );

        let response = match transport.send(request).await {
            Ok(response) => response,
            Err(e) => {
                if log_failures {
                    error!(%method, %url, error = %e, "request could not be sent");
                } else {
                    debug!(%method, %url, error = %e, "request could not be sent");
                }
                return Err(e);
            }
        };

        let status = response.status;
        if !response.is_success() {
            let body = response.body.unwrap_or_default();
            if log_failures {
                error!(%method, %url, status, body = %body, "request failed");
            } else {
                debug!(%method, %url, status, body = %body, "request failed");
            }
            return Err(ClientError::RequestFailed { status, body });
        }

        let Some(text) = response.body else {
            return Err(ClientError::Transport(format!("{method} {url}: response body unreadable")));
        };
        if text.len() < RESPONSE_LOG_LIMIT {
            debug!(status, body = %text.replace('\n', ""), "response");
        } else {
            debug!(status, len = text.len(), "response");
        }
        Ok(text)
    }

    /// Perform the round trip and parse the body as JSON.
    ///
    /// # Errors
    ///
    /// As [`RequestBuilder::send`], plus [`ClientError::MalformedResponse`]
    /// when the body is not JSON.
    pub async fn send_json(self, transport: &dyn HttpTransport) -> Result<serde_json::Value, ClientError> {
        let text = self.send(transport).await?;
        parse_json(&text)
    }
}

/// Parse a response body as JSON.
///
/// # Errors
///
/// Returns [`ClientError::MalformedResponse`] when `text` is not JSON.
pub fn parse_json(text: &str) -> Result<serde_json::Value, ClientError> {
    serde_json::from_str(text.trim()).map_err(|e| ClientError::MalformedResponse(e.to_string()))
}

fn merge_header(headers: &mut Vec<(String, String)>, name: String, value: String) {
    headers.retain(|(k, _)| !k.eq_ignore_ascii_case(&name));
    headers.push((name, value));
}

#[cfg(test)]
#[path = "request_test.rs"]
mod tests;
