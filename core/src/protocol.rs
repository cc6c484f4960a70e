/// Wire events exchanged with the chat server over the live transport
///
/// Every event is a JSON object tagged by its event name, one per line on the
/// stream: `{"event":"receiveMessage","data":{...}}`.
use crate::types::{Conversation, ConversationKey, Message, MessageId, StatusPatch, UserId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Events pushed by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum InboundEvent {
    /// Direct message delivered to us
    ReceiveMessage(Message),

    /// Group message delivered to a group we belong to
    ReceiveGroupMessage(Message),

    /// Direct-chat typing indicator
    #[serde(rename_all = "camelCase")]
    Typing { sender_id: UserId, is_typing: bool },

    /// Group typing indicator
    #[serde(rename_all = "camelCase")]
    GroupTyping {
        group_id: String,
        sender_id: UserId,
        sender_name: String,
        is_typing: bool,
    },

    /// Receipt update; applies even to our own messages
    MessageStatusUpdate(StatusPatch),

    /// Presence list: every user currently online
    OnlineUsers(Vec<UserId>),

    /// A new user registered
    NewUser(Conversation),

    /// We were added to a new group
    NewGroup(Conversation),

    GroupUpdated(Conversation),

    RemovedFromGroup(String),

    /// Notification hint for a message that also arrives as
    /// `receiveMessage` / `receiveGroupMessage`
    NewMessageNotification(serde_json::Value),
}

const INBOUND_EVENT_NAMES: &[&str] = &[
    "receiveMessage",
    "receiveGroupMessage",
    "typing",
    "groupTyping",
    "messageStatusUpdate",
    "onlineUsers",
    "newUser",
    "newGroup",
    "groupUpdated",
    "removedFromGroup",
    "newMessageNotification",
];

#[derive(Deserialize)]
struct Envelope {
    event: String,
}

/// Name of a well-formed event we do not handle, or `None` if the line is
/// not an event envelope or names a known event.
pub fn unhandled_event_name(data: &[u8]) -> Option<String> {
    let envelope: Envelope = serde_json::from_slice(data).ok()?;
    (!INBOUND_EVENT_NAMES.contains(&envelope.event.as_str())).then_some(envelope.event)
}

impl InboundEvent {
    /// Deserialize event from one JSON line
    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Get event name as sent on the wire
    pub fn event_name(&self) -> &'static str {
        match self {
            InboundEvent::ReceiveMessage(_) => "receiveMessage",
            InboundEvent::ReceiveGroupMessage(_) => "receiveGroupMessage",
            InboundEvent::Typing { .. } => "typing",
            InboundEvent::GroupTyping { .. } => "groupTyping",
            InboundEvent::MessageStatusUpdate(_) => "messageStatusUpdate",
            InboundEvent::OnlineUsers(_) => "onlineUsers",
            InboundEvent::NewUser(_) => "newUser",
            InboundEvent::NewGroup(_) => "newGroup",
            InboundEvent::GroupUpdated(_) => "groupUpdated",
            InboundEvent::RemovedFromGroup(_) => "removedFromGroup",
            InboundEvent::NewMessageNotification(_) => "newMessageNotification",
        }
    }
}

impl fmt::Display for InboundEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InboundEvent({})", self.event_name())
    }
}

/// Events we emit to the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum OutboundEvent {
    /// Announce identity; sent on every (re)connect
    Join(UserId),

    #[serde(rename_all = "camelCase")]
    MessageDelivered { message_id: MessageId, user_id: UserId },

    #[serde(rename_all = "camelCase")]
    MessageRead { message_id: MessageId, user_id: UserId },

    #[serde(rename_all = "camelCase")]
    Typing {
        receiver_id: UserId,
        sender_id: UserId,
        is_typing: bool,
    },

    #[serde(rename_all = "camelCase")]
    GroupTyping {
        group_id: String,
        sender_id: UserId,
        sender_name: String,
        is_typing: bool,
    },

    #[serde(rename_all = "camelCase")]
    ChatOpened { chat_id: String, is_group: bool },

    ChatClosed,
}

impl OutboundEvent {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    pub fn chat_opened(key: &ConversationKey) -> Self {
        OutboundEvent::ChatOpened {
            chat_id: key.id.clone(),
            is_group: key.is_group(),
        }
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            OutboundEvent::Join(_) => "join",
            OutboundEvent::MessageDelivered { .. } => "messageDelivered",
            OutboundEvent::MessageRead { .. } => "messageRead",
            OutboundEvent::Typing { .. } => "typing",
            OutboundEvent::GroupTyping { .. } => "groupTyping",
            OutboundEvent::ChatOpened { .. } => "chatOpened",
            OutboundEvent::ChatClosed => "chatClosed",
        }
    }
}

impl fmt::Display for OutboundEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OutboundEvent({})", self.event_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbound_wire_format() {
        let raw = br#"{"event":"typing","data":{"senderId":"u1","isTyping":true}}"#;
        let event = InboundEvent::from_bytes(raw).unwrap();
        assert_eq!(
            event,
            InboundEvent::Typing {
                sender_id: UserId::new("u1"),
                is_typing: true
            }
        );
        assert_eq!(event.event_name(), "typing");
    }

    #[test]
    fn test_status_update_wire_format() {
        let raw = br#"{"event":"messageStatusUpdate","data":{"messageId":"m9","status":"read","readBy":["u2"]}}"#;
        match InboundEvent::from_bytes(raw).unwrap() {
            InboundEvent::MessageStatusUpdate(patch) => {
                assert_eq!(patch.message_id, MessageId::new("m9"));
                assert_eq!(patch.read_by, Some(vec![UserId::new("u2")]));
                assert_eq!(patch.delivered_to, None);
            }
            other => panic!("unexpected event {}", other),
        }
    }

    #[test]
    fn test_outbound_wire_format() {
        let join = OutboundEvent::Join(UserId::new("me")).to_bytes().unwrap();
        assert_eq!(join, br#"{"event":"join","data":"me"}"#.to_vec());

        let closed = OutboundEvent::ChatClosed.to_bytes().unwrap();
        assert_eq!(closed, br#"{"event":"chatClosed"}"#.to_vec());

        let opened = OutboundEvent::chat_opened(&ConversationKey::group("g1"));
        let value: serde_json::Value = serde_json::from_slice(&opened.to_bytes().unwrap()).unwrap();
        assert_eq!(value["data"]["chatId"], "g1");
        assert_eq!(value["data"]["isGroup"], true);
    }

    #[test]
    fn test_unknown_event_rejected() {
        assert!(InboundEvent::from_bytes(br#"{"event":"explode","data":{}}"#).is_err());
    }

    #[test]
    fn test_unhandled_event_name() {
        assert_eq!(
            unhandled_event_name(br#"{"event":"explode","data":{}}"#),
            Some("explode".to_string())
        );
        // Known name with a bad payload is malformed, not unhandled
        assert_eq!(unhandled_event_name(br#"{"event":"typing","data":7}"#), None);
        assert_eq!(unhandled_event_name(b"not json"), None);
    }

    #[test]
    fn test_new_message_notification_parses() {
        let raw = br#"{"event":"newMessageNotification","data":{"type":"group","chatId":"g1","senderName":"Bob","groupName":"Team"}}"#;
        let event = InboundEvent::from_bytes(raw).unwrap();
        assert_eq!(event.event_name(), "newMessageNotification");
        match event {
            InboundEvent::NewMessageNotification(data) => assert_eq!(data["chatId"], "g1"),
            other => panic!("unexpected event {}", other),
        }
    }
}
