//! Error taxonomy shared by session, packet, dispatcher, and cache layers.
//!
//! DESIGN
//! ======
//! One enum for the whole runtime. It is `Clone` because a single outcome
//! (a refresh, a cache fetch) is handed to every task waiting on it.
//! `ErrorCode` gives each variant a grepable code and a retryable flag,
//! which the packet retry loop consults.

// =============================================================================
// ERROR
// =============================================================================

/// Errors produced while authenticating, sending packets, or resolving cache entries.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    /// Login or token refresh failed, or the service kept rejecting fresh tokens.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The service answered with a non-success HTTP status.
    #[error("request failed: status {status}")]
    RequestFailed { status: u16, body: String },

    /// The response body could not be parsed into the expected shape.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// A cache `get` could not resolve its entry. Wraps the fetch error.
    #[error("cache fetch failed for {key}: {source}")]
    CacheFetchFailed { key: String, source: Box<ClientError> },

    /// The HTTP round trip failed before a status line was received.
    #[error("transport failed: {0}")]
    Transport(String),

    /// The request could not be assembled (unknown endpoint, missing URL parameter, bad header).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A configuration value could not be parsed.
    #[error("config parse failed: {0}")]
    Config(String),

    /// The underlying HTTP client could not be constructed.
    #[error("HTTP client build failed: {0}")]
    HttpClientBuild(String),

    /// Work was submitted after the dispatcher shut down, or its worker went away.
    #[error("dispatcher closed")]
    DispatcherClosed,

    /// A fetch or job panicked instead of returning.
    #[error("internal failure: {0}")]
    Internal(String),
}

impl ClientError {
    /// HTTP status carried by this error, looking through cache wrappers.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::RequestFailed { status, .. } => Some(*status),
            Self::CacheFetchFailed { source, .. } => source.status(),
            _ => None,
        }
    }

    /// The innermost error, unwrapping any `CacheFetchFailed` layers.
    #[must_use]
    pub fn root(&self) -> &ClientError {
        match self {
            Self::CacheFetchFailed { source, .. } => source.root(),
            other => other,
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        Self::MalformedResponse(e.to_string())
    }
}

// =============================================================================
// ERROR CODES
// =============================================================================

/// Grepable error code and retryable flag.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}

impl ErrorCode for ClientError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed(_) => "E_AUTHENTICATION_FAILED",
            Self::RequestFailed { .. } => "E_REQUEST_FAILED",
            Self::MalformedResponse(_) => "E_MALFORMED_RESPONSE",
            Self::CacheFetchFailed { .. } => "E_CACHE_FETCH_FAILED",
            Self::Transport(_) => "E_TRANSPORT",
            Self::InvalidRequest(_) => "E_INVALID_REQUEST",
            Self::Config(_) => "E_CONFIG",
            Self::HttpClientBuild(_) => "E_HTTP_CLIENT_BUILD",
            Self::DispatcherClosed => "E_DISPATCHER_CLOSED",
            Self::Internal(_) => "E_INTERNAL",
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::RequestFailed { status: 429 | 500..=599, .. } => true,
            Self::CacheFetchFailed { source, .. } => source.retryable(),
            _ => false,
        }
    }
}

#[cfg(test)]
#[path = "error_test.rs"]
mod tests;
