/// chatsync - Conversation synchronizer for a real-time chat client
///
/// Merges live events, paginated history and optimistic sends into one
/// consistent, deduplicated and ordered message list per conversation.

pub mod error;
pub mod config;
pub mod types;
pub mod merge;
pub mod pending;
pub mod reconciler;
pub mod protocol;
pub mod ingest;
pub mod directory;
pub mod message_store;
pub mod http_store;
pub mod transport;
pub mod bridge;
pub mod session;
pub mod synchronizer;

pub use error::{Result, SyncError};
pub use config::Config;
pub use session::{LocalUser, Session};
pub use synchronizer::{ActiveView, Synchronizer, TypingIndicator};
pub use types::{ConversationKey, Message, MessageId, MessagePage, UserId};
