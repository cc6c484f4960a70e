/// Notification bridge messages
///
/// The push worker posts `{"action":"openChat","chatId":"...","type":"group"}`
/// into the running client when a notification is clicked. An `openChat`
/// request is handled exactly like the user opening that conversation.
use crate::error::{Result, SyncError};
use crate::types::ConversationKey;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeMessage {
    pub action: String,
    #[serde(default)]
    pub chat_id: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

/// What the client should do with a bridge message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeAction {
    OpenChat(ConversationKey),
    /// Action this client does not handle
    Unsupported(String),
}

impl BridgeMessage {
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(SyncError::Serialization)
    }

    pub fn open_chat(key: &ConversationKey) -> Self {
        Self {
            action: "openChat".to_string(),
            chat_id: Some(key.id.clone()),
            kind: Some(key.kind.as_str().to_string()),
        }
    }

    pub fn action(&self) -> Result<BridgeAction> {
        match self.action.as_str() {
            "openChat" => {
                let chat_id = self
                    .chat_id
                    .as_deref()
                    .ok_or_else(|| SyncError::InvalidKey("openChat without chatId".to_string()))?;
                let key = ConversationKey::from_parts(chat_id, self.kind.as_deref())?;
                Ok(BridgeAction::OpenChat(key))
            }
            other => Ok(BridgeAction::Unsupported(other.to_string())),
        }
    }
}
