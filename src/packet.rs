//! Packet: one logical remote operation, executable inline or in the background.
//!
//! ARCHITECTURE
//! ============
//! A `PacketSpec` is the immutable description of an endpoint (URL template,
//! method, body encoding, content type, timeout, visibility). A `Packet<T>`
//! binds a spec to per-call parameters and a response transform. There is
//! exactly one packet type; endpoints differ only in the data they carry.
//!
//! `execute` runs on the caller's task. `execute_async` submits the same
//! work to the `Dispatcher` and returns a `PacketHandle`.
//!
//! ERROR HANDLING
//! ==============
//! A 401 on an authenticated packet triggers one session renewal and one
//! resend. A second 401 marks the session terminated and surfaces
//! `AuthenticationFailed`. Other errors pass through unchanged, except that
//! retryable ones are retried up to `packet_retries` times with linear backoff.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::dispatcher::{Dispatcher, PacketHandle};
use crate::error::{ClientError, ErrorCode};
use crate::request::{ContentType, HttpTransport, Method, RequestBuilder, parse_json};
use crate::session::{HEADER_ACCESS_TOKEN, Session};

// =============================================================================
// URL TEMPLATE
// =============================================================================

/// A URL with `{name}` placeholders. `{prefix}` is the regional host prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlTemplate(String);

impl UrlTemplate {
    #[must_use]
    pub fn new(template: impl Into<String>) -> Self {
        Self(template.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Substitute placeholders. Parameter values are percent-encoded; the
    /// prefix is inserted verbatim.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidRequest`] for a placeholder with no value
    /// or an unterminated `{`.
    pub fn expand(&self, params: &[(String, String)], prefix: &str) -> Result<String, ClientError> {
        let mut out = String::with_capacity(self.0.len());
        let mut rest = self.0.as_str();

        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let Some(close) = after.find('}') else {
                return Err(ClientError::InvalidRequest(format!("unterminated placeholder in '{}'", self.0)));
            };
            let name = &after[..close];
            if name == "prefix" {
                out.push_str(prefix);
            } else {
                let Some((_, value)) = params.iter().find(|(k, _)| k == name) else {
                    return Err(ClientError::InvalidRequest(format!("missing url parameter '{name}' for '{}'", self.0)));
                };
                out.push_str(&urlencoding::encode(value));
            }
            rest = &after[close + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }
}

impl fmt::Display for UrlTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// PACKET SPEC
// =============================================================================

/// How a packet's body is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyEncoding {
    /// No body.
    None,
    /// URL-encoded `key=value` pairs.
    Form,
    /// Caller-supplied bytes (JSON documents, images).
    Raw,
}

/// Immutable description of one remote operation.
#[derive(Debug, Clone)]
pub struct PacketSpec {
    pub name: String,
    pub url: UrlTemplate,
    pub method: Method,
    pub headers: Vec<(String, String)>,
    pub encoding: BodyEncoding,
    pub content_type: ContentType,
    pub timeout: Option<Duration>,
    /// Failures are logged at error level when true.
    pub user_visible: bool,
    /// Session headers are attached when true.
    pub authenticated: bool,
}

impl PacketSpec {
    #[must_use]
    pub fn new(name: impl Into<String>, method: Method, url: impl Into<String>) -> Self {
        let encoding = if method.has_body() { BodyEncoding::Form } else { BodyEncoding::None };
        Self {
            name: name.into(),
            url: UrlTemplate::new(url),
            method,
            headers: Vec::new(),
            encoding,
            content_type: ContentType::Form,
            timeout: None,
            user_visible: true,
            authenticated: true,
        }
    }

    /// Build a spec whose URL comes from the named endpoint in `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidRequest`] if the endpoint is not configured.
    pub fn from_endpoint(name: &str, method: Method, config: &ClientConfig) -> Result<Self, ClientError> {
        let template = config
            .endpoints
            .get(name)
            .ok_or_else(|| ClientError::InvalidRequest(format!("no endpoint configured for '{name}'")))?;
        Ok(Self::new(name, method, template))
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn encoding(mut self, encoding: BodyEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    #[must_use]
    pub fn content_type(mut self, content_type: ContentType) -> Self {
        self.content_type = content_type;
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn user_visible(mut self, visible: bool) -> Self {
        self.user_visible = visible;
        self
    }

    #[must_use]
    pub fn unauthenticated(mut self) -> Self {
        self.authenticated = false;
        self
    }
}

// =============================================================================
// PACKET CONTEXT
// =============================================================================

/// Everything a packet needs to run, passed explicitly instead of held in globals.
#[derive(Clone)]
pub struct PacketContext {
    transport: Arc<dyn HttpTransport>,
    session: Session,
    dispatcher: Dispatcher,
    config: Arc<ClientConfig>,
}

impl PacketContext {
    #[must_use]
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        session: Session,
        dispatcher: Dispatcher,
        config: Arc<ClientConfig>,
    ) -> Self {
        Self { transport, session, dispatcher, config }
    }

    #[must_use]
    pub fn transport(&self) -> &dyn HttpTransport {
        self.transport.as_ref()
    }

    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

// =============================================================================
// PACKET
// =============================================================================

type Transform<T> = Arc<dyn Fn(&str) -> Result<T, ClientError> + Send + Sync>;

/// A parameterized call to one endpoint plus the function that reads its response.
pub struct Packet<T> {
    spec: Arc<PacketSpec>,
    params: Vec<(String, String)>,
    form: Vec<(String, String)>,
    body: Option<Vec<u8>>,
    headers: Vec<(String, String)>,
    prefix: Option<String>,
    transform: Transform<T>,
}

impl<T> Clone for Packet<T> {
    fn clone(&self) -> Self {
        Self {
            spec: Arc::clone(&self.spec),
            params: self.params.clone(),
            form: self.form.clone(),
            body: self.body.clone(),
            headers: self.headers.clone(),
            prefix: self.prefix.clone(),
            transform: Arc::clone(&self.transform),
        }
    }
}

impl<T> fmt::Debug for Packet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("name", &self.spec.name)
            .field("method", &self.spec.method)
            .field("url", &self.spec.url)
            .field("params", &self.params)
            .field("body_len", &self.body.as_ref().map(Vec::len))
            .finish_non_exhaustive()
    }
}

impl Packet<serde_json::Value> {
    /// Response parsed as a JSON value.
    #[must_use]
    pub fn json(spec: Arc<PacketSpec>) -> Self {
        Self::new(spec, parse_json)
    }
}

impl Packet<String> {
    /// Response returned as text (JSON or HTML alike).
    #[must_use]
    pub fn text(spec: Arc<PacketSpec>) -> Self {
        Self::new(spec, |raw| Ok(raw.to_string()))
    }
}

impl Packet<()> {
    /// Response body ignored; only the status matters.
    #[must_use]
    pub fn discard(spec: Arc<PacketSpec>) -> Self {
        Self::new(spec, |_| Ok(()))
    }
}

impl<T: DeserializeOwned> Packet<T> {
    /// Response deserialized into `T`.
    #[must_use]
    pub fn decode(spec: Arc<PacketSpec>) -> Self {
        Self::new(spec, |raw| {
            serde_json::from_str(raw.trim()).map_err(|e| ClientError::MalformedResponse(e.to_string()))
        })
    }
}

impl<T> Packet<T> {
    pub fn new(spec: Arc<PacketSpec>, transform: impl Fn(&str) -> Result<T, ClientError> + Send + Sync + 'static) -> Self {
        Self {
            spec,
            params: Vec::new(),
            form: Vec::new(),
            body: None,
            headers: Vec::new(),
            prefix: None,
            transform: Arc::new(transform),
        }
    }

    #[must_use]
    pub fn spec(&self) -> &PacketSpec {
        &self.spec
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Chain a second transform onto the response.
    #[must_use]
    pub fn map<U>(self, f: impl Fn(T) -> Result<U, ClientError> + Send + Sync + 'static) -> Packet<U>
    where
        T: 'static,
        U: 'static,
    {
        let inner = self.transform;
        Packet {
            spec: self.spec,
            params: self.params,
            form: self.form,
            body: self.body,
            headers: self.headers,
            prefix: self.prefix,
            transform: Arc::new(move |raw| inner(raw).and_then(&f)),
        }
    }

    /// Fill the `{name}` placeholder of the URL template.
    #[must_use]
    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    /// Add a form field. The value is URL-encoded when sent.
    #[must_use]
    pub fn form(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.form.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn body(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.body = Some(bytes.into());
        self
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Override the configured regional prefix for this call.
    #[must_use]
    pub fn location_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Assemble the request this packet would send with `auth_headers`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidRequest`] if the URL template cannot be expanded.
    pub fn build_request(
        &self,
        config: &ClientConfig,
        auth_headers: &[(&'static str, String)],
    ) -> Result<RequestBuilder, ClientError> {
        let spec = &self.spec;
        let prefix = self.prefix.as_deref().unwrap_or(&config.location_prefix);
        let url = spec.url.expand(&self.params, prefix)?;

        let mut builder = RequestBuilder::new(spec.method, url)
            .user_agent(config.user_agent.clone())
            .content_type(config.content_types.mime(spec.content_type))
            .timeout(spec.timeout)
            .log_failures(spec.user_visible)
            .headers(auth_headers.iter().map(|(k, v)| (*k, v.clone())))
            .headers(spec.headers.iter().cloned())
            .headers(self.headers.iter().cloned());

        match spec.encoding {
            BodyEncoding::None => {}
            BodyEncoding::Form => {
                for (key, value) in &self.form {
                    builder = builder.form_param_encoded(key, value);
                }
            }
            BodyEncoding::Raw => {
                builder = builder.body(self.body.clone().unwrap_or_default());
            }
        }
        Ok(builder)
    }

    /// Run on the caller's task.
    ///
    /// # Errors
    ///
    /// Propagates [`ClientError::RequestFailed`], [`ClientError::MalformedResponse`],
    /// and [`ClientError::AuthenticationFailed`] unchanged.
    pub async fn execute(&self, ctx: &PacketContext) -> Result<T, ClientError> {
        let retries = ctx.config.packet_retries;
        let mut attempt = 0;
        loop {
            match self.execute_once(ctx).await {
                Ok(value) => return Ok(value),
                Err(e) if e.retryable() && attempt < retries => {
                    attempt += 1;
                    warn!(packet = %self.spec.name, error = %e, attempt, total = retries, "packet failed; retrying");
                    let backoff = ctx.config.retry_base_ms.saturating_mul(attempt as u64);
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Run on the dispatcher. Drop the handle to fire and forget.
    pub fn execute_async(&self, ctx: &PacketContext) -> PacketHandle<T>
    where
        T: Send + 'static,
    {
        let packet = self.clone();
        let job_ctx = ctx.clone();
        ctx.dispatcher
            .submit(self.spec.name.clone(), async move { packet.execute(&job_ctx).await })
    }

    async fn execute_once(&self, ctx: &PacketContext) -> Result<T, ClientError> {
        let raw = if self.spec.authenticated {
            self.send_authenticated(ctx).await?
        } else {
            self.build_request(&ctx.config, &[])?
                .send(ctx.transport())
                .await?
        };
        (self.transform)(&raw)
    }

    async fn send_authenticated(&self, ctx: &PacketContext) -> Result<String, ClientError> {
        let headers = ctx.session.auth_headers().await?;
        let first = self
            .build_request(&ctx.config, &headers)?
            .send(ctx.transport())
            .await;
        let Err(ClientError::RequestFailed { status: 401, .. }) = first else {
            return first;
        };

        let rejected = headers
            .iter()
            .find(|(k, _)| *k == HEADER_ACCESS_TOKEN)
            .map(|(_, v)| v.as_str())
            .unwrap_or_default();
        debug!(packet = %self.spec.name, "credentials rejected; renewing session");
        ctx.session.renew_rejected(rejected).await?;

        let headers = ctx.session.auth_headers().await?;
        match self
            .build_request(&ctx.config, &headers)?
            .send(ctx.transport())
            .await
        {
            Err(ClientError::RequestFailed { status: 401, .. }) => {
                let reason = format!("{} rejected credentials after refresh", self.spec.name);
                ctx.session.mark_terminated(reason.clone());
                Err(ClientError::AuthenticationFailed(reason))
            }
            other => other,
        }
    }
}

#[cfg(test)]
#[path = "packet_test.rs"]
mod tests;
