/// Pending queue: messages received for conversations that are not open
///
/// Entries are keyed by conversation and drained when that conversation is
/// opened. Each entry is bounded in length, and entries nobody opened for
/// `max_age` are discarded.
use crate::types::{ConversationKey, Message, StatusPatch};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct PendingEntry {
    messages: Vec<Message>,
    last_queued: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PendingQueue {
    entries: HashMap<ConversationKey, PendingEntry>,
    max_per_conversation: usize,
    max_age: Duration,
}

impl PendingQueue {
    pub fn new(max_per_conversation: usize, max_age: std::time::Duration) -> Self {
        Self {
            entries: HashMap::new(),
            max_per_conversation: max_per_conversation.max(1),
            max_age: Duration::from_std(max_age).unwrap_or_else(|_| Duration::weeks(5200)),
        }
    }

    /// Queue a message. Returns false if its id is already queued.
    pub fn enqueue(&mut self, key: ConversationKey, message: Message) -> bool {
        self.enqueue_at(key, message, Utc::now())
    }

    pub fn enqueue_at(&mut self, key: ConversationKey, message: Message, now: DateTime<Utc>) -> bool {
        self.prune(now);

        let entry = self.entries.entry(key.clone()).or_insert_with(|| PendingEntry {
            messages: Vec::new(),
            last_queued: now,
        });

        if entry.messages.iter().any(|m| m.id == message.id) {
            return false;
        }

        entry.messages.push(message);
        entry.last_queued = now;

        if entry.messages.len() > self.max_per_conversation {
            let excess = entry.messages.len() - self.max_per_conversation;
            entry.messages.drain(..excess);
            warn!("Pending queue for {} full, dropped {} oldest", key, excess);
        }

        debug!("Queued message for {} ({} pending)", key, entry.messages.len());
        true
    }

    /// Remove and return everything queued for `key`
    pub fn drain(&mut self, key: &ConversationKey) -> Vec<Message> {
        self.entries
            .remove(key)
            .map(|e| e.messages)
            .unwrap_or_default()
    }

    /// Apply a receipt update to queued copies
    pub fn patch_status(&mut self, patch: &StatusPatch) -> bool {
        for entry in self.entries.values_mut() {
            if crate::merge::patch_status(&mut entry.messages, patch) {
                return true;
            }
        }
        false
    }

    /// Discard entries whose newest message is older than `max_age`.
    /// Returns the number of messages dropped.
    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        let max_age = self.max_age;
        let mut dropped = 0;
        self.entries.retain(|key, entry| {
            let keep = now.signed_duration_since(entry.last_queued) <= max_age;
            if !keep {
                warn!(
                    "Discarding {} stale pending messages for {}",
                    entry.messages.len(),
                    key
                );
                dropped += entry.messages.len();
            }
            keep
        });
        dropped
    }

    pub fn len(&self, key: &ConversationKey) -> usize {
        self.entries.get(key).map(|e| e.messages.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Conversations with queued messages and their counts (unread badges)
    pub fn counts(&self) -> Vec<(ConversationKey, usize)> {
        self.entries
            .iter()
            .map(|(k, e)| (k.clone(), e.messages.len()))
            .collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DeliveryStatus, MessageId, UserId};

    fn msg(id: &str) -> Message {
        Message {
            id: MessageId::new(id),
            conversation: ConversationKey::direct("bob"),
            sender: UserId::new("bob"),
            receiver: Some(UserId::new("me")),
            body: id.to_string(),
            created_at: Utc::now(),
            status: DeliveryStatus::Sent,
            delivered_to: vec![],
            read_by: vec![],
        }
    }

    fn queue() -> PendingQueue {
        PendingQueue::new(100, std::time::Duration::from_secs(3600))
    }

    #[test]
    fn test_enqueue_dedups_by_id() {
        let mut q = queue();
        let key = ConversationKey::direct("bob");
        assert!(q.enqueue(key.clone(), msg("a")));
        assert!(!q.enqueue(key.clone(), msg("a")));
        assert!(q.enqueue(key.clone(), msg("b")));
        assert_eq!(q.len(&key), 2);
    }

    #[test]
    fn test_drain_clears_entry() {
        let mut q = queue();
        let key = ConversationKey::group("g1");
        q.enqueue(key.clone(), msg("a"));
        q.enqueue(key.clone(), msg("b"));

        let drained = q.drain(&key);
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].id.as_str(), "a");
        assert!(q.drain(&key).is_empty());
        assert!(q.is_empty());
    }

    #[test]
    fn test_drain_unknown_key_is_empty() {
        let mut q = queue();
        assert!(q.drain(&ConversationKey::direct("nobody")).is_empty());
    }

    #[test]
    fn test_entry_bounded_drops_oldest() {
        let mut q = PendingQueue::new(2, std::time::Duration::from_secs(3600));
        let key = ConversationKey::direct("bob");
        for id in ["a", "b", "c"] {
            q.enqueue(key.clone(), msg(id));
        }
        let drained = q.drain(&key);
        let ids: Vec<_> = drained.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[test]
    fn test_prune_discards_stale_entries() {
        let mut q = PendingQueue::new(10, std::time::Duration::from_secs(60));
        let old = Utc::now() - Duration::seconds(600);
        q.enqueue_at(ConversationKey::direct("old"), msg("a"), old);
        q.enqueue(ConversationKey::direct("fresh"), msg("b"));

        assert_eq!(q.len(&ConversationKey::direct("old")), 0);
        assert_eq!(q.len(&ConversationKey::direct("fresh")), 1);
    }

    #[test]
    fn test_patch_reaches_queued_copy() {
        let mut q = queue();
        let key = ConversationKey::direct("bob");
        q.enqueue(key.clone(), msg("a"));
        assert!(q.patch_status(&StatusPatch {
            message_id: MessageId::new("a"),
            status: DeliveryStatus::Delivered,
            delivered_to: None,
            read_by: None,
        }));
        assert_eq!(q.drain(&key)[0].status, DeliveryStatus::Delivered);
    }
}
