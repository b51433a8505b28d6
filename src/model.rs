//! Domain records held by the caches.
//!
//! Group and one-to-one conversations share one base record and differ only
//! in `ConversationKind`. Capability checks (`can_kick`, `can_set_topic`)
//! answer from the kind instead of from a type hierarchy.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ClientError;

/// Prefix the service puts on personal account ids (`8:alice`).
pub const MEMBER_PREFIX: &str = "8:";

/// `8:alice` → `alice`; other ids pass through.
#[must_use]
pub fn strip_member_prefix(id: &str) -> &str {
    id.strip_prefix(MEMBER_PREFIX).unwrap_or(id)
}

// =============================================================================
// USER
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub display_name: Option<String>,
    pub mood: Option<String>,
    pub avatar_url: Option<String>,
}

impl User {
    /// A record carrying only the username, used when an event names a user
    /// whose profile was never fetched.
    #[must_use]
    pub fn new(username: impl Into<String>) -> Self {
        Self { username: username.into(), display_name: None, mood: None, avatar_url: None }
    }

    /// Parse a profile document.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::MalformedResponse`] when `username` is missing.
    pub fn from_json(value: &Value) -> Result<Self, ClientError> {
        let username = text(value, "username")
            .ok_or_else(|| ClientError::MalformedResponse("user profile has no username".into()))?;

        let display_name = text(value, "displayname").or_else(|| {
            let name = [text(value, "firstname"), text(value, "lastname")]
                .into_iter()
                .flatten()
                .collect::<Vec<_>>()
                .join(" ");
            (!name.is_empty()).then_some(name)
        });

        Ok(Self {
            username,
            display_name,
            mood: text(value, "mood").or_else(|| text(value, "richMood")),
            avatar_url: text(value, "avatarUrl"),
        })
    }
}

// =============================================================================
// ROLE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Admin,
    User,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "Admin",
            Self::User => "User",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.eq_ignore_ascii_case("admin") {
            Some(Self::Admin)
        } else if raw.eq_ignore_ascii_case("user") {
            Some(Self::User)
        } else {
            None
        }
    }
}

// =============================================================================
// CONVERSATION
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInfo {
    pub creator: Option<String>,
    pub admins: Vec<String>,
    pub join_enabled: bool,
    pub permissions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationKind {
    Group(GroupInfo),
    OneToOne { participant: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub topic: String,
    pub history_enabled: bool,
    pub participants: Vec<String>,
    pub kind: ConversationKind,
}

impl Conversation {
    #[must_use]
    pub fn group(id: impl Into<String>, topic: impl Into<String>, info: GroupInfo) -> Self {
        Self {
            id: id.into(),
            topic: topic.into(),
            history_enabled: false,
            participants: Vec::new(),
            kind: ConversationKind::Group(info),
        }
    }

    #[must_use]
    pub fn one_to_one(participant: impl Into<String>) -> Self {
        let participant = participant.into();
        Self {
            id: format!("{MEMBER_PREFIX}{participant}"),
            topic: String::new(),
            history_enabled: false,
            participants: vec![participant.clone()],
            kind: ConversationKind::OneToOne { participant },
        }
    }

    #[must_use]
    pub fn participants(&self) -> &[String] {
        &self.participants
    }

    #[must_use]
    pub fn is_group(&self) -> bool {
        matches!(self.kind, ConversationKind::Group(_))
    }

    #[must_use]
    pub fn can_kick(&self) -> bool {
        self.is_group()
    }

    #[must_use]
    pub fn can_set_topic(&self) -> bool {
        self.is_group()
    }

    #[must_use]
    pub fn is_admin(&self, username: &str) -> bool {
        match &self.kind {
            ConversationKind::Group(info) => info.admins.iter().any(|a| a == username),
            ConversationKind::OneToOne { .. } => false,
        }
    }

    /// `None` when `username` is not a participant.
    #[must_use]
    pub fn role_of(&self, username: &str) -> Option<Role> {
        if !self.participants.iter().any(|p| p == username) {
            return None;
        }
        Some(if self.is_admin(username) { Role::Admin } else { Role::User })
    }

    /// Returns false if already present.
    pub fn add_participant(&mut self, username: &str) -> bool {
        if self.participants.iter().any(|p| p == username) {
            return false;
        }
        self.participants.push(username.to_string());
        true
    }

    /// Also drops the user from the admin list. Returns false if absent.
    pub fn remove_participant(&mut self, username: &str) -> bool {
        let before = self.participants.len();
        self.participants.retain(|p| p != username);
        if let ConversationKind::Group(info) = &mut self.kind {
            info.admins.retain(|a| a != username);
        }
        self.participants.len() != before
    }

    /// Group conversations only; returns false for one-to-one.
    pub fn set_role(&mut self, username: &str, role: Role) -> bool {
        let ConversationKind::Group(info) = &mut self.kind else {
            return false;
        };
        info.admins.retain(|a| a != username);
        if role == Role::Admin {
            info.admins.push(username.to_string());
        }
        true
    }

    /// Parse a thread document (`id`, `properties`, `members`).
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::MalformedResponse`] when `id` is missing.
    pub fn from_json(value: &Value) -> Result<Self, ClientError> {
        let id = text(value, "id")
            .ok_or_else(|| ClientError::MalformedResponse("conversation has no id".into()))?;
        let properties = &value["properties"];
        let topic = text(properties, "topic").unwrap_or_default();
        let history_enabled = flag(&properties["historydisclosed"]);

        if let Some(participant) = id.strip_prefix(MEMBER_PREFIX) {
            let mut conversation = Self::one_to_one(participant);
            conversation.topic = topic;
            conversation.history_enabled = history_enabled;
            return Ok(conversation);
        }

        let mut participants = Vec::new();
        let mut admins = Vec::new();
        for member in value["members"].as_array().into_iter().flatten() {
            let Some(member_id) = member["id"].as_str() else {
                continue;
            };
            let username = strip_member_prefix(member_id).to_string();
            if member["role"].as_str().and_then(Role::parse) == Some(Role::Admin) {
                admins.push(username.clone());
            }
            participants.push(username);
        }

        let permissions = match &properties["capabilities"] {
            Value::Array(items) => items.iter().filter_map(Value::as_str).map(str::to_string).collect(),
            Value::String(joined) => joined
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        };

        Ok(Self {
            id,
            topic,
            history_enabled,
            participants,
            kind: ConversationKind::Group(GroupInfo {
                creator: properties["creator"].as_str().map(|c| strip_member_prefix(c).to_string()),
                admins,
                join_enabled: flag(&properties["joiningenabled"]),
                permissions,
            }),
        })
    }
}

fn text(value: &Value, key: &str) -> Option<String> {
    value[key]
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// The service sends booleans both as JSON booleans and as `"true"` strings.
fn flag(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

#[cfg(test)]
#[path = "model_test.rs"]
mod tests;
