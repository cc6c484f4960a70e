/// History store backed by the chat server's REST API
///
/// Endpoints, relative to the API base (e.g. `http://localhost:5000/api`):
///   GET  /chat/:peer_id            ?page=N&limit=N
///   GET  /group/:group_id/messages ?page=N&limit=N
///   POST /chat                     body: {"receiverId":"...","message":"..."}
///   POST /group/message            body: {"groupId":"...","message":"..."}
///
/// Pages come back as `{"messages":[...],"pagination":{"hasMore":..,"totalPages":..}}`
/// with server message documents (`_id`, `message`, `senderId`, ...). They are
/// mapped onto `Message` here; nothing else in the crate sees the REST shape.
use crate::error::{Result, SyncError};
use crate::message_store::HistoryStore;
use crate::types::{ConversationKey, ConversationKind, DeliveryStatus, Message, MessageId, MessagePage, UserId};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::Deserialize;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

// ─── Wire shapes ─────────────────────────────────────────────────────────────

/// A user reference: either a bare id or a populated user document
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum UserRef {
    Id(String),
    Populated {
        #[serde(rename = "_id")]
        id: String,
    },
}

impl UserRef {
    fn into_user(self) -> UserId {
        match self {
            UserRef::Id(id) | UserRef::Populated { id } => UserId::new(id),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    #[serde(rename = "_id")]
    id: String,
    message: String,
    sender_id: UserRef,
    #[serde(default)]
    receiver_id: Option<UserRef>,
    created_at: DateTime<Utc>,
    #[serde(default)]
    status: DeliveryStatus,
    #[serde(default)]
    delivered_to: Vec<UserRef>,
    #[serde(default)]
    read_by: Vec<UserRef>,
}

impl WireMessage {
    fn into_message(self, conversation: &ConversationKey) -> Message {
        Message {
            id: MessageId::new(self.id),
            conversation: conversation.clone(),
            sender: self.sender_id.into_user(),
            receiver: self.receiver_id.map(UserRef::into_user),
            body: self.message,
            created_at: self.created_at,
            status: self.status,
            delivered_to: self.delivered_to.into_iter().map(UserRef::into_user).collect(),
            read_by: self.read_by.into_iter().map(UserRef::into_user).collect(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePagination {
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    total_pages: u32,
}

#[derive(Debug, Deserialize)]
struct WirePage {
    #[serde(default)]
    messages: Vec<WireMessage>,
    #[serde(default)]
    pagination: WirePagination,
}

fn page_from_bytes(data: &[u8], conversation: &ConversationKey) -> Result<MessagePage> {
    let wire: WirePage = serde_json::from_slice(data)?;
    let mut messages: Vec<Message> = wire
        .messages
        .into_iter()
        .map(|m| m.into_message(conversation))
        .collect();
    messages.sort_by_key(|m| m.created_at);
    Ok(MessagePage {
        messages,
        has_more: wire.pagination.has_more,
        total_pages: wire.pagination.total_pages,
    })
}

fn message_from_bytes(data: &[u8], conversation: &ConversationKey) -> Result<Message> {
    let wire: WireMessage = serde_json::from_slice(data)?;
    Ok(wire.into_message(conversation))
}

// ─── Store ───────────────────────────────────────────────────────────────────

pub struct HttpHistoryStore {
    /// API base without trailing slash
    base: String,
    token: Option<String>,
    client: Client<HttpConnector, Full<Bytes>>,
    request_timeout: Duration,
}

impl HttpHistoryStore {
    pub fn new(base: impl Into<String>, token: Option<String>, request_timeout: Duration) -> Result<Self> {
        let base = base.into().trim_end_matches('/').to_string();
        if !base.starts_with("http://") {
            return Err(SyncError::Config(format!(
                "API url must start with http:// (got '{}')",
                base
            )));
        }
        let client = Client::builder(TokioExecutor::new()).build_http();

        Ok(Self {
            base,
            token,
            client,
            request_timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    fn history_path(conversation: &ConversationKey, page: u32, limit: u32) -> String {
        let id = urlencoding::encode(&conversation.id);
        match conversation.kind {
            ConversationKind::Direct => format!("/chat/{}?page={}&limit={}", id, page, limit),
            ConversationKind::Group => format!("/group/{}/messages?page={}&limit={}", id, page, limit),
        }
    }

    async fn request(&self, method: Method, path: &str, body: Option<serde_json::Value>) -> Result<Bytes> {
        let uri: Uri = format!("{}{}", self.base, path)
            .parse()
            .map_err(|e| SyncError::Config(format!("Invalid request url: {}", e)))?;

        let mut builder = Request::builder()
            .method(method.clone())
            .uri(uri)
            .header(ACCEPT, "application/json");
        if let Some(token) = &self.token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        let payload = match body {
            Some(value) => {
                builder = builder.header(CONTENT_TYPE, "application/json");
                Bytes::from(serde_json::to_vec(&value)?)
            }
            None => Bytes::new(),
        };
        let request = builder
            .body(Full::new(payload))
            .map_err(|e| SyncError::Transport(e.to_string()))?;

        debug!("{} {}", method, path);
        let response = timeout(self.request_timeout, self.client.request(request))
            .await
            .map_err(|_| SyncError::Transport(format!("{} {} timed out", method, path)))?
            .map_err(|e| SyncError::Transport(format!("{} {}: {}", method, path, e)))?;

        let status = response.status();
        let data = response
            .into_body()
            .collect()
            .await
            .map(|c| c.to_bytes())
            .map_err(|e| SyncError::Transport(e.to_string()))?;

        if !status.is_success() {
            let detail = String::from_utf8_lossy(&data);
            warn!("{} {} returned {}", method, path, status);
            return Err(SyncError::Transport(format!(
                "{} {} returned {}: {}",
                method, path, status, detail
            )));
        }
        Ok(data)
    }
}

#[async_trait]
impl HistoryStore for HttpHistoryStore {
    async fn get_messages(
        &self,
        conversation: &ConversationKey,
        page: u32,
        page_size: u32,
    ) -> Result<MessagePage> {
        let path = Self::history_path(conversation, page, page_size);
        let data = self.request(Method::GET, &path, None).await?;
        page_from_bytes(&data, conversation)
    }

    async fn create_message(&self, conversation: &ConversationKey, body: &str) -> Result<Message> {
        let (path, payload) = match conversation.kind {
            ConversationKind::Direct => (
                "/chat",
                serde_json::json!({ "receiverId": conversation.id, "message": body }),
            ),
            ConversationKind::Group => (
                "/group/message",
                serde_json::json!({ "groupId": conversation.id, "message": body }),
            ),
        };
        let data = self.request(Method::POST, path, Some(payload)).await?;
        message_from_bytes(&data, conversation)
    }
}
