/// Shared types for the synchronizer: conversations, messages, pages
use crate::error::{Result, SyncError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Prefix used for client-assigned message ids
pub const TEMP_ID_PREFIX: &str = "temp-";

/// Server-side user identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Message identifier, either server-assigned or a temporary local one
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Temporary id for an optimistic send
    pub fn temporary(counter: u64) -> Self {
        Self(format!("{}{}", TEMP_ID_PREFIX, counter))
    }

    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMP_ID_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Direct,
    Group,
}

impl ConversationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationKind::Direct => "direct",
            ConversationKind::Group => "group",
        }
    }
}

/// Identifies one conversation: the peer's user id for direct chats, the
/// group id for group chats. Renders as `direct_<id>` / `group_<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationKey {
    pub kind: ConversationKind,
    pub id: String,
}

impl ConversationKey {
    pub fn direct(peer: impl Into<String>) -> Self {
        Self {
            kind: ConversationKind::Direct,
            id: peer.into(),
        }
    }

    pub fn group(group_id: impl Into<String>) -> Self {
        Self {
            kind: ConversationKind::Group,
            id: group_id.into(),
        }
    }

    pub fn is_group(&self) -> bool {
        self.kind == ConversationKind::Group
    }

    /// Build a key from a chat id and an optional `"direct"`/`"group"` type
    /// string. A missing type means direct.
    pub fn from_parts(chat_id: &str, kind: Option<&str>) -> Result<Self> {
        if chat_id.is_empty() {
            return Err(SyncError::InvalidKey("empty chat id".to_string()));
        }
        match kind.unwrap_or("direct") {
            "direct" => Ok(Self::direct(chat_id)),
            "group" => Ok(Self::group(chat_id)),
            other => Err(SyncError::InvalidKey(format!(
                "unknown conversation type '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.kind.as_str(), self.id)
    }
}

impl FromStr for ConversationKey {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        let (kind, id) = s
            .split_once('_')
            .ok_or_else(|| SyncError::InvalidKey(s.to_string()))?;
        Self::from_parts(id, Some(kind))
    }
}

/// Directory entry for a peer or group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub key: ConversationKey,
    pub display_name: String,
    /// Group members; empty for direct chats
    #[serde(default)]
    pub members: Vec<UserId>,
}

/// Delivery progress of a message. Ordered: a status never moves backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Read,
}

impl Default for DeliveryStatus {
    fn default() -> Self {
        DeliveryStatus::Sent
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub conversation: ConversationKey,
    pub sender: UserId,
    /// Receiving user for direct messages
    #[serde(default)]
    pub receiver: Option<UserId>,
    pub body: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub status: DeliveryStatus,
    #[serde(default)]
    pub delivered_to: Vec<UserId>,
    #[serde(default)]
    pub read_by: Vec<UserId>,
}

impl Message {
    /// Conversation key as seen by `local`. Direct messages are stored under
    /// the sender/receiver pair; the local user files them under the other
    /// party.
    pub fn conversation_for(&self, local: &UserId) -> ConversationKey {
        match self.conversation.kind {
            ConversationKind::Group => self.conversation.clone(),
            ConversationKind::Direct => {
                if &self.sender == local {
                    match &self.receiver {
                        Some(receiver) => ConversationKey::direct(receiver.as_str()),
                        None => self.conversation.clone(),
                    }
                } else {
                    ConversationKey::direct(self.sender.as_str())
                }
            }
        }
    }

    pub fn apply_patch(&mut self, patch: &StatusPatch) {
        if patch.status > self.status {
            self.status = patch.status;
        }
        if let Some(delivered) = &patch.delivered_to {
            self.delivered_to = delivered.clone();
        }
        if let Some(read) = &patch.read_by {
            self.read_by = read.clone();
        }
    }
}

/// Receipt update pushed by the server for a single message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusPatch {
    pub message_id: MessageId,
    pub status: DeliveryStatus,
    #[serde(default)]
    pub delivered_to: Option<Vec<UserId>>,
    #[serde(default)]
    pub read_by: Option<Vec<UserId>>,
}

/// One page of conversation history
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    pub messages: Vec<Message>,
    pub has_more: bool,
    pub total_pages: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_round_trips_through_display() {
        let key = ConversationKey::group("64ab");
        assert_eq!(key.to_string(), "group_64ab");
        assert_eq!("group_64ab".parse::<ConversationKey>().unwrap(), key);
        assert_eq!(
            "direct_u_1".parse::<ConversationKey>().unwrap(),
            ConversationKey::direct("u_1")
        );
    }

    #[test]
    fn test_key_rejects_unknown_kind() {
        assert!("channel_1".parse::<ConversationKey>().is_err());
        assert!("nokind".parse::<ConversationKey>().is_err());
        assert!(ConversationKey::from_parts("", None).is_err());
        assert_eq!(
            ConversationKey::from_parts("abc", None).unwrap(),
            ConversationKey::direct("abc")
        );
    }

    #[test]
    fn test_direct_message_files_under_other_party() {
        let me = UserId::new("me");
        let msg = Message {
            id: MessageId::new("m1"),
            conversation: ConversationKey::direct("bob"),
            sender: UserId::new("bob"),
            receiver: Some(me.clone()),
            body: "hi".to_string(),
            created_at: Utc::now(),
            status: DeliveryStatus::Sent,
            delivered_to: vec![],
            read_by: vec![],
        };
        assert_eq!(msg.conversation_for(&me), ConversationKey::direct("bob"));

        let mine = Message {
            sender: me.clone(),
            receiver: Some(UserId::new("carol")),
            ..msg
        };
        assert_eq!(mine.conversation_for(&me), ConversationKey::direct("carol"));
    }

    #[test]
    fn test_status_never_regresses() {
        let mut msg = Message {
            id: MessageId::new("m1"),
            conversation: ConversationKey::group("g"),
            sender: UserId::new("a"),
            receiver: None,
            body: String::new(),
            created_at: Utc::now(),
            status: DeliveryStatus::Read,
            delivered_to: vec![],
            read_by: vec![],
        };
        msg.apply_patch(&StatusPatch {
            message_id: MessageId::new("m1"),
            status: DeliveryStatus::Delivered,
            delivered_to: Some(vec![UserId::new("b")]),
            read_by: None,
        });
        assert_eq!(msg.status, DeliveryStatus::Read);
        assert_eq!(msg.delivered_to, vec![UserId::new("b")]);
    }

    #[test]
    fn test_temporary_ids() {
        assert!(MessageId::temporary(3).is_temporary());
        assert_eq!(MessageId::temporary(3).as_str(), "temp-3");
        assert!(!MessageId::new("65f0c1").is_temporary());
    }
}
