use serde_json::json;

use super::*;

fn thread_json() -> Value {
    json!({
        "id": "19:team@thread.skype",
        "properties": {
            "topic": "Team",
            "historydisclosed": "true",
            "joiningenabled": true,
            "creator": "8:alice",
            "capabilities": ["AddMember", "ChangeTopic"]
        },
        "members": [
            {"id": "8:alice", "role": "Admin"},
            {"id": "8:bob", "role": "User"},
            {"role": "User"}
        ]
    })
}

#[test]
fn group_conversation_parses_members_and_properties() {
    let conversation = Conversation::from_json(&thread_json()).unwrap();

    assert_eq!(conversation.id, "19:team@thread.skype");
    assert_eq!(conversation.topic, "Team");
    assert!(conversation.history_enabled);
    assert_eq!(conversation.participants(), ["alice".to_string(), "bob".to_string()]);
    let ConversationKind::Group(info) = &conversation.kind else {
        panic!("expected group");
    };
    assert_eq!(info.creator.as_deref(), Some("alice"));
    assert_eq!(info.admins, vec!["alice".to_string()]);
    assert!(info.join_enabled);
    assert_eq!(info.permissions, vec!["AddMember".to_string(), "ChangeTopic".to_string()]);
}

#[test]
fn personal_id_parses_as_one_to_one() {
    let conversation = Conversation::from_json(&json!({"id": "8:bob"})).unwrap();

    assert_eq!(conversation.kind, ConversationKind::OneToOne { participant: "bob".into() });
    assert!(!conversation.can_kick());
    assert!(!conversation.can_set_topic());
    assert_eq!(conversation.role_of("bob"), Some(Role::User));
}

#[test]
fn conversation_without_id_is_malformed() {
    assert!(matches!(Conversation::from_json(&json!({})), Err(ClientError::MalformedResponse(_))));
}

#[test]
fn roles_follow_admin_list() {
    let mut conversation = Conversation::from_json(&thread_json()).unwrap();

    assert!(conversation.can_kick());
    assert_eq!(conversation.role_of("alice"), Some(Role::Admin));
    assert_eq!(conversation.role_of("bob"), Some(Role::User));
    assert_eq!(conversation.role_of("mallory"), None);

    assert!(conversation.set_role("bob", Role::Admin));
    assert!(conversation.is_admin("bob"));
    assert!(conversation.set_role("alice", Role::User));
    assert!(!conversation.is_admin("alice"));
}

#[test]
fn removing_participant_drops_admin_rights() {
    let mut conversation = Conversation::from_json(&thread_json()).unwrap();

    assert!(conversation.remove_participant("alice"));
    assert!(!conversation.remove_participant("alice"));
    assert!(!conversation.is_admin("alice"));
    assert!(conversation.add_participant("carol"));
    assert!(!conversation.add_participant("carol"));
}

#[test]
fn one_to_one_ignores_role_changes() {
    let mut conversation = Conversation::one_to_one("bob");
    assert!(!conversation.set_role("bob", Role::Admin));
    assert!(!conversation.is_admin("bob"));
}

#[test]
fn user_profile_parses_display_name_from_parts() {
    let user = User::from_json(&json!({
        "username": "bob",
        "firstname": "Bob",
        "lastname": "Builder",
        "mood": "busy",
        "avatarUrl": "https://avatar.test/bob"
    }))
    .unwrap();

    assert_eq!(user.username, "bob");
    assert_eq!(user.display_name.as_deref(), Some("Bob Builder"));
    assert_eq!(user.mood.as_deref(), Some("busy"));
    assert_eq!(user.avatar_url.as_deref(), Some("https://avatar.test/bob"));
}

#[test]
fn user_profile_without_username_is_malformed() {
    assert!(matches!(User::from_json(&json!({"firstname": "x"})), Err(ClientError::MalformedResponse(_))));
}

#[test]
fn role_parse_is_case_insensitive() {
    assert_eq!(Role::parse("ADMIN"), Some(Role::Admin));
    assert_eq!(Role::parse("user"), Some(Role::User));
    assert_eq!(Role::parse("owner"), None);
}
