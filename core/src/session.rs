/// Logged-in session
///
/// Binds the local identity to its transport and history store. Everything a
/// synchronizer needs comes from the session, so a second login never shares
/// state with the first.
use crate::config::Config;
use crate::message_store::HistoryStore;
use crate::synchronizer::Synchronizer;
use crate::transport::Transport;
use crate::types::UserId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// The user this client is logged in as
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalUser {
    pub id: UserId,
    /// Shown to group members in typing indicators
    pub name: String,
}

impl LocalUser {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let id = UserId::new(id);
        let name = name.into();
        let name = if name.is_empty() { id.0.clone() } else { name };
        Self { id, name }
    }
}

pub struct Session {
    user: LocalUser,
    config: Config,
    transport: Arc<dyn Transport>,
    history: Arc<dyn HistoryStore>,
}

impl Session {
    pub fn login(
        user: LocalUser,
        config: Config,
        transport: Arc<dyn Transport>,
        history: Arc<dyn HistoryStore>,
    ) -> Self {
        info!("Logged in as {} ({})", user.id, user.name);
        Self {
            user,
            config,
            transport,
            history,
        }
    }

    pub fn user(&self) -> &LocalUser {
        &self.user
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport)
    }

    pub fn history(&self) -> Arc<dyn HistoryStore> {
        Arc::clone(&self.history)
    }

    /// Synchronizer bound to this session
    pub fn synchronizer(&self) -> Synchronizer {
        Synchronizer::new(self)
    }

    /// Close the open conversation and shut the transport down
    pub async fn logout(self, synchronizer: &Synchronizer) {
        synchronizer.close_conversation().await;
        self.transport.close();
        info!("Logged out {}", self.user.id);
    }
}
