/// History store: paginated conversation history
///
/// `HistoryStore` is the seam to whatever owns persisted history (normally the
/// chat server). `SledHistoryStore` keeps history in a local sled DB, one tree
/// per conversation, keyed by creation time so pages come out in order.
use crate::error::{Result, SyncError};
use crate::types::{ConversationKey, DeliveryStatus, Message, MessageId, MessagePage, UserId};
use async_trait::async_trait;
use chrono::Utc;
use std::path::Path;
use tracing::debug;
use uuid::Uuid;

#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Fetch one page. Page 1 holds the newest `page_size` messages; higher
    /// pages are older. Messages within a page are ascending by time.
    async fn get_messages(
        &self,
        conversation: &ConversationKey,
        page: u32,
        page_size: u32,
    ) -> Result<MessagePage>;

    /// Persist a new message from the local user and return the stored copy
    async fn create_message(&self, conversation: &ConversationKey, body: &str) -> Result<Message>;
}

pub struct SledHistoryStore {
    db: sled::Db,
    local_user: UserId,
}

impl SledHistoryStore {
    /// Create message store
    pub fn new(data_dir: &Path, local_user: UserId) -> Result<Self> {
        let db_path = data_dir.join("history.db");
        let db = sled::open(&db_path)
            .map_err(|e| SyncError::Storage(format!("Failed to open history DB: {}", e)))?;

        Ok(Self { db, local_user })
    }

    fn tree(&self, conversation: &ConversationKey) -> Result<sled::Tree> {
        self.db
            .open_tree(conversation.to_string())
            .map_err(|e| SyncError::Storage(format!("Failed to open tree {}: {}", conversation, e)))
    }

    fn entry_key(msg: &Message) -> String {
        format!("{:020}:{}", msg.created_at.timestamp_micros(), msg.id)
    }

    /// Save a message under the conversation it belongs to for the local user
    pub fn save(&self, msg: &Message) -> Result<()> {
        let conversation = msg.conversation_for(&self.local_user);
        let value = serde_json::to_vec(msg).map_err(SyncError::Serialization)?;

        self.tree(&conversation)?
            .insert(Self::entry_key(msg).as_bytes(), value)
            .map_err(|e| SyncError::Storage(format!("Failed to save message: {}", e)))?;

        Ok(())
    }

    /// Get message count for a conversation
    pub fn count(&self, conversation: &ConversationKey) -> Result<usize> {
        Ok(self.tree(conversation)?.len())
    }
}

#[async_trait]
impl HistoryStore for SledHistoryStore {
    async fn get_messages(
        &self,
        conversation: &ConversationKey,
        page: u32,
        page_size: u32,
    ) -> Result<MessagePage> {
        if page == 0 || page_size == 0 {
            return Err(SyncError::Fetch {
                conversation: conversation.to_string(),
                page,
                reason: "page and page size start at 1".to_string(),
            });
        }

        let tree = self.tree(conversation)?;
        let total = tree.len();
        let size = page_size as usize;
        let total_pages = total.div_ceil(size) as u32;
        let skip = (page as usize - 1) * size;

        let mut messages = Vec::with_capacity(size);
        for entry in tree.iter().rev().skip(skip).take(size) {
            let (_, value) = entry
                .map_err(|e| SyncError::Storage(format!("Failed to read history: {}", e)))?;
            messages.push(serde_json::from_slice::<Message>(&value)?);
        }
        messages.reverse();

        debug!(
            "History {} page {}/{}: {} messages",
            conversation,
            page,
            total_pages,
            messages.len()
        );

        Ok(MessagePage {
            messages,
            has_more: page < total_pages,
            total_pages,
        })
    }

    async fn create_message(&self, conversation: &ConversationKey, body: &str) -> Result<Message> {
        let msg = Message {
            id: MessageId::new(Uuid::new_v4().simple().to_string()),
            conversation: conversation.clone(),
            sender: self.local_user.clone(),
            receiver: (!conversation.is_group()).then(|| UserId::new(conversation.id.as_str())),
            body: body.to_string(),
            created_at: Utc::now(),
            status: DeliveryStatus::Sent,
            delivered_to: Vec::new(),
            read_by: Vec::new(),
        };
        self.save(&msg)?;
        Ok(msg)
    }
}

impl Clone for SledHistoryStore {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            local_user: self.local_user.clone(),
        }
    }
}
