use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    channels::ChannelName,
    domain::{ConversationId, MessageId, User, UserSummary},
};

/// Message object as it travels on per-conversation channels. A message may
/// carry a body, an image reference, or both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub id: MessageId,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    pub sender: UserSummary,
    pub created_at: DateTime<Utc>,
    /// Users who have seen this message. Grows monotonically.
    #[serde(default)]
    pub seen: Vec<UserSummary>,
    /// Client-supplied correlation id for optimistic-send reconciliation.
    /// Never canonical: deduplication always keys on `id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

impl MessagePayload {
    /// Copy used for per-user previews; the correlation id is
    /// connection-local and is not forwarded to other members.
    pub fn without_client_id(&self) -> Self {
        Self {
            client_id: None,
            ..self.clone()
        }
    }
}

/// Full conversation object as broadcast on per-user channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    #[serde(default)]
    pub name: Option<String>,
    pub is_group: bool,
    /// Recency sort key for the sidebar.
    pub last_message_at: DateTime<Utc>,
    pub users: Vec<User>,
    #[serde(default)]
    pub messages: Vec<MessagePayload>,
}

/// Partial conversation update. Receivers merge only the fields that are
/// present and leave everything else (including sidebar position) untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationDelta {
    pub id: ConversationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<MessagePayload>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub users: Option<Vec<User>>,
}

/// Last-message summary delivered to every member's personal channel when a
/// message lands in one of their conversations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationActivity {
    pub id: ConversationId,
    pub last_message: MessagePayload,
}

/// Presence-channel membership entry, keyed by the user's email handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceMember {
    pub id: String,
}

/// Every event that can arrive on a subscribed channel, tagged with its wire
/// name. Malformed payloads fail at the boundary instead of downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ChannelEvent {
    #[serde(rename = "conversation:new")]
    ConversationNew(Conversation),
    #[serde(rename = "conversation:update")]
    ConversationUpdate(ConversationDelta),
    #[serde(rename = "conversation:remove")]
    ConversationRemove(Conversation),
    #[serde(rename = "conversation:user")]
    ConversationUser(ConversationActivity),
    #[serde(rename = "messages:new")]
    MessageNew(MessagePayload),
    // Both spellings exist on the wire; publishers emit `message:update`.
    #[serde(rename = "message:update", alias = "messages:update")]
    MessageUpdate(MessagePayload),
    #[serde(rename = "subscription_succeeded")]
    SubscriptionSucceeded(Vec<PresenceMember>),
    #[serde(rename = "member_added")]
    MemberAdded(PresenceMember),
    #[serde(rename = "member_removed")]
    MemberRemoved(PresenceMember),
}

impl ChannelEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ChannelEvent::ConversationNew(_) => "conversation:new",
            ChannelEvent::ConversationUpdate(_) => "conversation:update",
            ChannelEvent::ConversationRemove(_) => "conversation:remove",
            ChannelEvent::ConversationUser(_) => "conversation:user",
            ChannelEvent::MessageNew(_) => "messages:new",
            ChannelEvent::MessageUpdate(_) => "message:update",
            ChannelEvent::SubscriptionSucceeded(_) => "subscription_succeeded",
            ChannelEvent::MemberAdded(_) => "member_added",
            ChannelEvent::MemberRemoved(_) => "member_removed",
        }
    }
}

/// A channel event together with the channel it was published on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub channel: ChannelName,
    #[serde(flatten)]
    pub event: ChannelEvent,
}

/// Commands a client sends over the websocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientCommand {
    Subscribe {
        channel: ChannelName,
        /// Signed grant from the channel-authorization endpoint; required
        /// for the presence channel.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auth: Option<String>,
    },
    Unsubscribe {
        channel: ChannelName,
    },
}

/// Frames the server sends over the websocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// First frame on every connection; the socket id is what the
    /// channel-authorization endpoint signs over.
    Connected { socket_id: String },
    Event(Envelope),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::UserId;

    fn sender() -> UserSummary {
        UserSummary {
            id: UserId::from("u1"),
            name: Some("Ada".to_owned()),
            email: "ada@mail.io".to_owned(),
        }
    }

    fn message(id: &str) -> MessagePayload {
        MessagePayload {
            id: MessageId::from(id),
            body: Some("hi".to_owned()),
            image: None,
            sender: sender(),
            created_at: Utc::now(),
            seen: vec![sender()],
            client_id: Some("tmp-1".to_owned()),
        }
    }

    #[test]
    fn events_carry_their_wire_names() {
        let event = ChannelEvent::MessageNew(message("m1"));
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["event"], "messages:new");
        assert_eq!(value["data"]["id"], "m1");
        assert_eq!(value["data"]["clientId"], "tmp-1");
        assert_eq!(value["data"]["sender"]["email"], "ada@mail.io");
    }

    #[test]
    fn message_update_accepts_both_wire_spellings() {
        let data = serde_json::to_value(message("m2")).expect("payload");
        for name in ["message:update", "messages:update"] {
            let raw = serde_json::json!({ "event": name, "data": data });
            let event: ChannelEvent = serde_json::from_value(raw).expect("deserialize");
            assert!(matches!(event, ChannelEvent::MessageUpdate(_)));
        }
        let reserialized =
            serde_json::to_value(ChannelEvent::MessageUpdate(message("m2"))).expect("serialize");
        assert_eq!(reserialized["event"], "message:update");
    }

    #[test]
    fn preview_copy_drops_the_correlation_id() {
        let preview = message("m3").without_client_id();
        assert_eq!(preview.client_id, None);
        let value = serde_json::to_value(&preview).expect("serialize");
        assert!(value.get("clientId").is_none());
    }

    #[test]
    fn envelope_round_trips_through_server_frame() {
        let frame = ServerFrame::Event(Envelope {
            channel: ChannelName::presence(),
            event: ChannelEvent::MemberAdded(PresenceMember {
                id: "ada@mail.io".to_owned(),
            }),
        });
        let text = serde_json::to_string(&frame).expect("serialize");
        let parsed: ServerFrame = serde_json::from_str(&text).expect("deserialize");
        match parsed {
            ServerFrame::Event(envelope) => {
                assert!(envelope.channel.is_presence());
                assert_eq!(envelope.event.name(), "member_added");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn conversation_delta_serializes_camel_case_and_skips_absent_fields() {
        let delta = ConversationDelta {
            id: ConversationId::from("c1"),
            messages: Some(vec![message("m1")]),
            users: None,
        };
        let value = serde_json::to_value(&delta).expect("serialize");
        assert_eq!(value["id"], "c1");
        assert!(value.get("users").is_none());
        assert!(value["messages"][0]["createdAt"].is_string());
    }
}
