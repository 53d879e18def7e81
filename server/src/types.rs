//! Wire protocol and shared types.
//!
//! Every frame is a JSON text message of the form
//! `{"event": "<name>", "data": <value>}`. Payloads handed to the gateway by
//! producers are opaque `serde_json::Value`s; the only fields the gateway
//! ever looks at are `type` and `priority`, to pick the event name.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::registry::ConnectionId;

// ═══════════════════════════════════════════════════════════════
// Channels
// ═══════════════════════════════════════════════════════════════

/// A logical fan-out group. Rendered as `user:<id>` / `workspace:<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    User(String),
    Workspace(String),
}

impl Channel {
    pub fn user(id: impl Into<String>) -> Self {
        Self::User(id.into())
    }

    pub fn workspace(id: impl Into<String>) -> Self {
        Self::Workspace(id.into())
    }

    pub fn id(&self) -> &str {
        match self {
            Self::User(id) | Self::Workspace(id) => id,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(id) => write!(f, "user:{id}"),
            Self::Workspace(id) => write!(f, "workspace:{id}"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════
// Client → Server messages
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Join `user:<id>`.
    JoinNotificationRoom(String),
    /// Join `workspace:<id>`, leaving any previous workspace.
    JoinWorkspaceChat(String),
    LeaveWorkspaceChat(String),
    TypingChat(TypingMsg),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingMsg {
    pub workspace_id: String,
    pub user_name: String,
}

// ═══════════════════════════════════════════════════════════════
// Server → Client messages
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerMessage {
    Notification(JsonValue),
    /// Same payload shape as `Notification`, used when `type == "invitation"`.
    WorkspaceInvitation(JsonValue),
    UrgentNotification(JsonValue),
    ChatMessage(JsonValue),
    UserTyping(UserTypingMsg),
    TestNotification(JsonValue),
    Error(ServerErrorMsg),
}

impl ServerMessage {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Notification(_) => "notification",
            Self::WorkspaceInvitation(_) => "workspace-invitation",
            Self::UrgentNotification(_) => "urgent-notification",
            Self::ChatMessage(_) => "chat-message",
            Self::UserTyping(_) => "user-typing",
            Self::TestNotification(_) => "test-notification",
            Self::Error(_) => "error",
        }
    }

    /// Pick `notification` or its invitation alias for a producer payload.
    pub fn for_user(payload: JsonValue) -> Self {
        if payload_str(&payload, "type") == Some("invitation") {
            Self::WorkspaceInvitation(payload)
        } else {
            Self::Notification(payload)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserTypingMsg {
    /// Bound identity of the typist; `null` for anonymous connections.
    pub user_id: Option<String>,
    pub user_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerErrorMsg {
    pub message: String,
}

// ═══════════════════════════════════════════════════════════════
// Notification payload (defined by producers, opaque to the gateway)
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub read: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_workspace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_project: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_invitation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_link: Option<String>,
}

impl Notification {
    pub fn to_payload(&self) -> Result<JsonValue, serde_json::Error> {
        serde_json::to_value(self)
    }
}

/// High-priority and deadline notifications also go out as `urgent-notification`.
pub fn is_urgent(payload: &JsonValue) -> bool {
    payload_str(payload, "priority") == Some("high") || payload_str(payload, "type") == Some("deadline")
}

fn payload_str<'a>(payload: &'a JsonValue, field: &str) -> Option<&'a str> {
    payload.get(field).and_then(JsonValue::as_str)
}

// ═══════════════════════════════════════════════════════════════
// Internal event bus types
// ═══════════════════════════════════════════════════════════════

/// Connection lifecycle events published on the gateway's internal bus.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    Authenticated {
        connection_id: ConnectionId,
        user_id: String,
    },
    /// Credential missing, expired or invalid; the connection continues anonymously.
    AuthDegraded {
        connection_id: ConnectionId,
        reason: String,
    },
    Disconnected {
        connection_id: ConnectionId,
        user_id: Option<String>,
    },
    /// Heartbeat bound exceeded.
    Evicted { connection_id: ConnectionId },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn channel_display() {
        assert_eq!(Channel::user("u1").to_string(), "user:u1");
        assert_eq!(Channel::workspace("w-9").to_string(), "workspace:w-9");
        assert_eq!(Channel::workspace("w-9").id(), "w-9");
    }

    #[test]
    fn client_message_wire_form() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"event":"join-notification-room","data":"u1"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::JoinNotificationRoom(ref id) if id == "u1"));

        let msg: ClientMessage = serde_json::from_str(
            r#"{"event":"typing-chat","data":{"workspaceId":"w1","userName":"Alice"}}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::TypingChat(t) => {
                assert_eq!(t.workspace_id, "w1");
                assert_eq!(t.user_name, "Alice");
            }
            other => panic!("unexpected {other:?}"),
        }

        assert!(serde_json::from_str::<ClientMessage>(r#"{"event":"join-room","data":"x"}"#).is_err());
    }

    #[test]
    fn server_message_wire_form() {
        let msg = ServerMessage::UserTyping(UserTypingMsg {
            user_id: None,
            user_name: "Bob".into(),
        });
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            v,
            json!({"event": "user-typing", "data": {"userId": null, "userName": "Bob"}})
        );
        assert_eq!(msg.event_name(), "user-typing");
    }

    #[test]
    fn invitation_payload_uses_alias() {
        let msg = ServerMessage::for_user(json!({"type": "invitation", "message": "join us"}));
        assert_eq!(msg.event_name(), "workspace-invitation");
        let msg = ServerMessage::for_user(json!({"type": "task", "message": "assigned"}));
        assert_eq!(msg.event_name(), "notification");
    }

    #[test]
    fn urgency_rules() {
        assert!(is_urgent(&json!({"priority": "high"})));
        assert!(is_urgent(&json!({"type": "deadline"})));
        assert!(!is_urgent(&json!({"type": "task", "priority": "medium"})));
        assert!(!is_urgent(&json!("plain string")));
    }

    #[test]
    fn notification_payload_shape() {
        let n = Notification {
            id: "n1".into(),
            kind: "deadline".into(),
            message: "Project deadline approaching in 3 days!".into(),
            read: false,
            created_at: "2026-01-01T00:00:00Z".parse().unwrap(),
            priority: Some(Priority::High),
            related_workspace: None,
            related_project: Some("p1".into()),
            related_task: None,
            related_invitation: None,
            action_link: Some("/workspace/w1/projects/p1".into()),
        };
        let v = n.to_payload().unwrap();
        assert_eq!(v["type"], "deadline");
        assert_eq!(v["priority"], "high");
        assert_eq!(v["relatedProject"], "p1");
        assert_eq!(v["actionLink"], "/workspace/w1/projects/p1");
        assert!(v.get("relatedTask").is_none());
        assert!(is_urgent(&v));
    }
}
