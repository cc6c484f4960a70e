/// Live event ingest: decides where each inbound event goes
///
/// Routing is a pure function of the event, the local user and the active
/// conversation. The synchronizer applies the resulting `Route` under its
/// state lock, so the active conversation cannot change in between.
use crate::protocol::{InboundEvent, OutboundEvent};
use crate::types::{Conversation, ConversationKey, ConversationKind, Message, StatusPatch, UserId};

/// Change to the conversation directory
#[derive(Debug, Clone, PartialEq)]
pub enum DirectoryChange {
    NewUser(Conversation),
    NewGroup(Conversation),
    GroupUpdated(Conversation),
    RemovedFromGroup(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    /// Message for the open conversation
    Foreground {
        conversation: ConversationKey,
        message: Message,
    },
    /// Message for a conversation that is not open
    Background {
        conversation: ConversationKey,
        message: Message,
    },
    Status(StatusPatch),
    /// Typing indicator for the open conversation. `who` is the peer id for
    /// direct chats and the sender's display name for groups.
    Typing {
        conversation: ConversationKey,
        who: String,
        is_typing: bool,
    },
    Presence(Vec<UserId>),
    Directory(DirectoryChange),
    Ignore(&'static str),
}

pub fn route(event: InboundEvent, local: &UserId, active: Option<&ConversationKey>) -> Route {
    match event {
        InboundEvent::ReceiveMessage(message) | InboundEvent::ReceiveGroupMessage(message) => {
            route_message(message, local, active)
        }
        InboundEvent::MessageStatusUpdate(patch) => Route::Status(patch),
        InboundEvent::Typing {
            sender_id,
            is_typing,
        } => {
            if &sender_id == local {
                return Route::Ignore("own typing");
            }
            let conversation = ConversationKey::direct(sender_id.as_str());
            if active != Some(&conversation) {
                return Route::Ignore("typing for inactive conversation");
            }
            Route::Typing {
                conversation,
                who: sender_id.0,
                is_typing,
            }
        }
        InboundEvent::GroupTyping {
            group_id,
            sender_id,
            sender_name,
            is_typing,
        } => {
            if &sender_id == local {
                return Route::Ignore("own typing");
            }
            let conversation = ConversationKey::group(group_id);
            if active != Some(&conversation) {
                return Route::Ignore("typing for inactive conversation");
            }
            Route::Typing {
                conversation,
                who: sender_name,
                is_typing,
            }
        }
        InboundEvent::OnlineUsers(users) => Route::Presence(users),
        InboundEvent::NewUser(user) => Route::Directory(DirectoryChange::NewUser(user)),
        InboundEvent::NewGroup(group) => Route::Directory(DirectoryChange::NewGroup(group)),
        InboundEvent::GroupUpdated(group) => Route::Directory(DirectoryChange::GroupUpdated(group)),
        InboundEvent::RemovedFromGroup(group_id) => {
            Route::Directory(DirectoryChange::RemovedFromGroup(group_id))
        }
        // The message itself arrives on its own event and is counted there
        InboundEvent::NewMessageNotification(_) => Route::Ignore("notification hint"),
    }
}

fn route_message(message: Message, local: &UserId, active: Option<&ConversationKey>) -> Route {
    // Our own sends are already in the view through the optimistic path
    if &message.sender == local {
        return Route::Ignore("own message");
    }

    let conversation = message.conversation_for(local);
    if active == Some(&conversation) {
        Route::Foreground {
            conversation,
            message,
        }
    } else {
        Route::Background {
            conversation,
            message,
        }
    }
}

/// Delivery receipt owed for an accepted message: always for group messages,
/// for direct messages only when we are the addressee.
pub fn delivery_ack(message: &Message, local: &UserId) -> Option<OutboundEvent> {
    let addressed = match message.conversation.kind {
        ConversationKind::Group => true,
        ConversationKind::Direct => message.receiver.as_ref() == Some(local),
    };
    addressed.then(|| OutboundEvent::MessageDelivered {
        message_id: message.id.clone(),
        user_id: local.clone(),
    })
}
