//! Client configuration parsed from environment variables.
//!
//! Everything the core would otherwise hard-code (endpoint URL templates,
//! timeouts, proxy, content types, pool size, retry policy) lives here and is
//! handed to the runtime at construction.

use std::collections::HashMap;
use std::time::Duration;

use crate::request::ContentType;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 6.3; WOW64)";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_DISPATCHER_WORKERS: usize = 4;
pub const DEFAULT_PACKET_RETRIES: usize = 0;
pub const DEFAULT_RETRY_BASE_MS: u64 = 250;
pub const DEFAULT_TOKEN_EXPIRY_SKEW_SECS: u64 = 60;
pub const DEFAULT_JOIN_BASE_DOMAIN: &str = "https://join.skype.com/launch/";

/// Names of the endpoint templates the built-in packets look up.
pub mod endpoint {
    pub const CONVERSATION: &str = "conversation";
    pub const KICK: &str = "kick";
    pub const SET_ROLE: &str = "set_role";
    pub const SET_TOPIC: &str = "set_topic";
    pub const JOIN_URL: &str = "join_url";
    pub const USER_PROFILE: &str = "user_profile";
    pub const PROFILE_PICTURE: &str = "profile_picture";
    pub const GUEST_THREAD: &str = "guest_thread";

    pub const ALL: [&str; 8] =
        [CONVERSATION, KICK, SET_ROLE, SET_TOPIC, JOIN_URL, USER_PROFILE, PROFILE_PICTURE, GUEST_THREAD];
}

const MESSENGER_BASE: &str = "https://{prefix}client-s.gateway.messenger.live.com/v1";

// =============================================================================
// ENDPOINTS
// =============================================================================

/// Named URL templates. Placeholders are written `{name}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    templates: HashMap<String, String>,
}

impl Endpoints {
    /// An empty table. Every packet lookup fails until templates are added.
    #[must_use]
    pub fn empty() -> Self {
        Self { templates: HashMap::new() }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.templates.get(name).map(String::as_str)
    }

    pub fn insert(&mut self, name: impl Into<String>, template: impl Into<String>) {
        self.templates.insert(name.into(), template.into());
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.templates.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

impl Default for Endpoints {
    fn default() -> Self {
        let mut endpoints = Self::empty();
        endpoints.insert(endpoint::CONVERSATION, format!("{MESSENGER_BASE}/threads/{{conversation}}?view=msnp24Equivalent"));
        endpoints.insert(endpoint::KICK, format!("{MESSENGER_BASE}/threads/{{conversation}}/members/8:{{user}}"));
        endpoints.insert(endpoint::SET_ROLE, format!("{MESSENGER_BASE}/threads/{{conversation}}/members/8:{{user}}"));
        endpoints.insert(endpoint::SET_TOPIC, format!("{MESSENGER_BASE}/threads/{{conversation}}/properties?name=topic"));
        endpoints.insert(endpoint::JOIN_URL, "https://api.scheduler.skype.com/threads");
        endpoints.insert(endpoint::USER_PROFILE, "https://api.skype.com/users/{user}/profile");
        endpoints.insert(endpoint::PROFILE_PICTURE, "https://api.skype.com/users/{user}/profile/avatar");
        endpoints.insert(endpoint::GUEST_THREAD, "https://api.scheduler.skype.com/conversation/{space}");
        endpoints
    }
}

// =============================================================================
// CONTENT TYPES
// =============================================================================

/// MIME string for each body kind the packets send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentTypes {
    table: HashMap<ContentType, String>,
}

impl ContentTypes {
    /// MIME string for `kind`, falling back to the built-in value.
    #[must_use]
    pub fn mime(&self, kind: ContentType) -> &str {
        self.table
            .get(&kind)
            .map_or_else(|| kind.default_mime(), String::as_str)
    }

    pub fn insert(&mut self, kind: ContentType, mime: impl Into<String>) {
        self.table.insert(kind, mime.into());
    }
}

impl Default for ContentTypes {
    fn default() -> Self {
        let table = [ContentType::Form, ContentType::Json, ContentType::Image, ContentType::Text]
            .into_iter()
            .map(|kind| (kind, kind.default_mime().to_string()))
            .collect();
        Self { table }
    }
}

// =============================================================================
// CLIENT CONFIG
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub request_secs: u64,
    pub connect_secs: u64,
}

impl Timeouts {
    #[must_use]
    pub fn request(&self) -> Duration {
        Duration::from_secs(self.request_secs)
    }

    #[must_use]
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub user_agent: String,
    pub timeouts: Timeouts,
    pub proxy_url: Option<String>,
    /// Regional host prefix substituted for `{prefix}` in templates (e.g. `bs1-`).
    pub location_prefix: String,
    pub dispatcher_workers: usize,
    /// Extra attempts for retryable packet failures. Zero disables retry.
    pub packet_retries: usize,
    pub retry_base_ms: u64,
    /// Credentials are refreshed this long before they expire.
    pub token_expiry_skew_secs: u64,
    /// Launch page the service embeds in generated join links.
    pub join_base_domain: String,
    pub endpoints: Endpoints,
    pub content_types: ContentTypes,
}

impl ClientConfig {
    /// Build typed config from environment variables.
    ///
    /// Optional:
    /// - `WEBCHAT_USER_AGENT`
    /// - `WEBCHAT_REQUEST_TIMEOUT_SECS`: default 60
    /// - `WEBCHAT_CONNECT_TIMEOUT_SECS`: default 10
    /// - `WEBCHAT_PROXY_URL`
    /// - `WEBCHAT_LOCATION_PREFIX`: default empty
    /// - `WEBCHAT_DISPATCHER_WORKERS`: default 4
    /// - `WEBCHAT_PACKET_RETRIES`: default 0
    /// - `WEBCHAT_RETRY_BASE_MS`: default 250
    /// - `WEBCHAT_TOKEN_EXPIRY_SKEW_SECS`: default 60
    /// - `WEBCHAT_JOIN_BASE_DOMAIN`: default `https://join.skype.com/launch/`
    /// - `WEBCHAT_ENDPOINT_<NAME>`: overrides one endpoint template
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut endpoints = Endpoints::default();
        for name in endpoint::ALL {
            let key = format!("WEBCHAT_ENDPOINT_{}", name.to_ascii_uppercase());
            if let Some(template) = lookup(&key) {
                endpoints.insert(name, template);
            }
        }

        Self {
            user_agent: lookup("WEBCHAT_USER_AGENT").unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            timeouts: Timeouts {
                request_secs: parse_or(&lookup, "WEBCHAT_REQUEST_TIMEOUT_SECS", DEFAULT_REQUEST_TIMEOUT_SECS),
                connect_secs: parse_or(&lookup, "WEBCHAT_CONNECT_TIMEOUT_SECS", DEFAULT_CONNECT_TIMEOUT_SECS),
            },
            proxy_url: lookup("WEBCHAT_PROXY_URL").filter(|v| !v.trim().is_empty()),
            location_prefix: lookup("WEBCHAT_LOCATION_PREFIX").unwrap_or_default(),
            dispatcher_workers: parse_or(&lookup, "WEBCHAT_DISPATCHER_WORKERS", DEFAULT_DISPATCHER_WORKERS).max(1),
            packet_retries: parse_or(&lookup, "WEBCHAT_PACKET_RETRIES", DEFAULT_PACKET_RETRIES),
            retry_base_ms: parse_or(&lookup, "WEBCHAT_RETRY_BASE_MS", DEFAULT_RETRY_BASE_MS),
            token_expiry_skew_secs: parse_or(&lookup, "WEBCHAT_TOKEN_EXPIRY_SKEW_SECS", DEFAULT_TOKEN_EXPIRY_SKEW_SECS),
            join_base_domain: lookup("WEBCHAT_JOIN_BASE_DOMAIN")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_JOIN_BASE_DOMAIN.to_string()),
            endpoints,
            content_types: ContentTypes::default(),
        }
    }

    #[must_use]
    pub fn with_endpoint(mut self, name: impl Into<String>, template: impl Into<String>) -> Self {
        self.endpoints.insert(name, template);
        self
    }

    #[must_use]
    pub fn with_proxy(mut self, proxy_url: impl Into<String>) -> Self {
        self.proxy_url = Some(proxy_url.into());
        self
    }

    #[must_use]
    pub fn with_dispatcher_workers(mut self, workers: usize) -> Self {
        self.dispatcher_workers = workers.max(1);
        self
    }

    #[must_use]
    pub fn with_packet_retries(mut self, retries: usize, retry_base_ms: u64) -> Self {
        self.packet_retries = retries;
        self.retry_base_ms = retry_base_ms;
        self
    }

    #[must_use]
    pub fn token_expiry_skew(&self) -> Duration {
        Duration::from_secs(self.token_expiry_skew_secs)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    lookup(key)
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
