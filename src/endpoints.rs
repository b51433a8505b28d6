//! Endpoint descriptors: every remote operation as data.
//!
//! Each operation is a `PacketSpec` built once from the configured endpoint
//! table, plus a constructor that binds call parameters and picks the
//! response transform. Adding an endpoint means adding a spec and a method
//! here; no new packet type.

use std::sync::Arc;

use serde_json::{Value, json};

use crate::config::{ClientConfig, endpoint};
use crate::error::ClientError;
use crate::model::{Conversation, Role, User};
use crate::packet::{BodyEncoding, Packet, PacketSpec};
use crate::request::{ContentType, Method};

/// Prebuilt specs for the built-in operations.
#[derive(Debug, Clone)]
pub struct PacketCatalog {
    conversation: Arc<PacketSpec>,
    user_profile: Arc<PacketSpec>,
    kick: Arc<PacketSpec>,
    set_topic: Arc<PacketSpec>,
    set_role: Arc<PacketSpec>,
    join_url: Arc<PacketSpec>,
    profile_picture: Arc<PacketSpec>,
    guest_thread: Arc<PacketSpec>,
    join_base_domain: String,
}

impl PacketCatalog {
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidRequest`] if an endpoint template is missing.
    pub fn from_config(config: &ClientConfig) -> Result<Self, ClientError> {
        let spec = |name: &str, method: Method| PacketSpec::from_endpoint(name, method, config);
        let json_body = |s: PacketSpec| s.encoding(BodyEncoding::Raw).content_type(ContentType::Json);

        Ok(Self {
            conversation: Arc::new(spec(endpoint::CONVERSATION, Method::Get)?),
            user_profile: Arc::new(spec(endpoint::USER_PROFILE, Method::Get)?),
            kick: Arc::new(spec(endpoint::KICK, Method::Delete)?),
            set_topic: Arc::new(json_body(spec(endpoint::SET_TOPIC, Method::Put)?)),
            set_role: Arc::new(json_body(spec(endpoint::SET_ROLE, Method::Put)?)),
            join_url: Arc::new(json_body(spec(endpoint::JOIN_URL, Method::Post)?)),
            profile_picture: Arc::new(
                spec(endpoint::PROFILE_PICTURE, Method::Put)?
                    .encoding(BodyEncoding::Raw)
                    .content_type(ContentType::Image),
            ),
            guest_thread: Arc::new(
                spec(endpoint::GUEST_THREAD, Method::Get)?
                    .unauthenticated()
                    .user_visible(false),
            ),
            join_base_domain: config.join_base_domain.clone(),
        })
    }

    #[must_use]
    pub fn conversation(&self, conversation_id: &str) -> Packet<Conversation> {
        Packet::json(Arc::clone(&self.conversation))
            .param("conversation", conversation_id)
            .map(|value| Conversation::from_json(&value))
    }

    #[must_use]
    pub fn user_profile(&self, username: &str) -> Packet<User> {
        Packet::json(Arc::clone(&self.user_profile))
            .param("user", username)
            .map(|value| User::from_json(&value))
    }

    #[must_use]
    pub fn kick(&self, conversation_id: &str, username: &str) -> Packet<()> {
        Packet::discard(Arc::clone(&self.kick))
            .param("conversation", conversation_id)
            .param("user", username)
    }

    #[must_use]
    pub fn set_topic(&self, conversation_id: &str, topic: &str) -> Packet<()> {
        Packet::discard(Arc::clone(&self.set_topic))
            .param("conversation", conversation_id)
            .body(json!({ "topic": topic }).to_string())
    }

    #[must_use]
    pub fn set_role(&self, conversation_id: &str, username: &str, role: Role) -> Packet<()> {
        Packet::discard(Arc::clone(&self.set_role))
            .param("conversation", conversation_id)
            .param("user", username)
            .body(json!({ "role": role.as_str() }).to_string())
    }

    /// Resolves to the public join link of a group conversation.
    #[must_use]
    pub fn join_url(&self, conversation_id: &str) -> Packet<String> {
        Packet::json(Arc::clone(&self.join_url))
            .body(json!({ "baseDomain": self.join_base_domain, "threadId": conversation_id }).to_string())
            .map(|value| required_text(&value, "JoinUrl"))
    }

    #[must_use]
    pub fn set_profile_picture(&self, username: &str, image: Vec<u8>) -> Packet<Value> {
        Packet::json(Arc::clone(&self.profile_picture))
            .param("user", username)
            .body(image)
    }

    /// Thread id behind a guest join space. Needs no session.
    #[must_use]
    pub fn guest_thread_id(&self, space_id: &str) -> Packet<String> {
        Packet::json(Arc::clone(&self.guest_thread))
            .param("space", space_id)
            .map(|value| required_text(&value, "ThreadId"))
    }
}

fn required_text(value: &Value, key: &str) -> Result<String, ClientError> {
    value[key]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| ClientError::MalformedResponse(format!("response has no '{key}'")))
}

#[cfg(test)]
#[path = "endpoints_test.rs"]
mod tests;
