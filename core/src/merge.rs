/// Ordered, deduplicated message lists
///
/// Every list the synchronizer exposes is sorted ascending by `created_at`
/// (ties broken by id) and holds each message id at most once. All merges go
/// through `merge_into`, which is idempotent and order-independent.
use crate::types::{Message, MessageId, StatusPatch};
use std::cmp::Ordering;
use std::collections::HashSet;

fn chronological(a: &Message, b: &Message) -> Ordering {
    a.created_at
        .cmp(&b.created_at)
        .then_with(|| a.id.cmp(&b.id))
}

/// Merge `incoming` into `list`. Messages whose id is already present are
/// skipped; the first copy wins. Returns the number of messages added.
pub fn merge_into(list: &mut Vec<Message>, incoming: Vec<Message>) -> usize {
    let mut seen: HashSet<MessageId> = list.iter().map(|m| m.id.clone()).collect();
    let before = list.len();

    for msg in incoming {
        if seen.insert(msg.id.clone()) {
            list.push(msg);
        }
    }

    let added = list.len() - before;
    if added > 0 {
        list.sort_by(chronological);
    }
    added
}

/// Insert a single message. Returns false if its id is already present.
pub fn insert(list: &mut Vec<Message>, msg: Message) -> bool {
    merge_into(list, vec![msg]) == 1
}

/// Prepend an older history page. Unlike `merge_into`, a page copy replaces a
/// local copy with the same id. Returns the number of new ids.
pub fn prepend_page(list: &mut Vec<Message>, older: Vec<Message>) -> usize {
    let before = list.len();
    let mut merged = older;
    merged.append(list);
    *list = dedup(merged);
    list.sort_by(chronological);
    list.len() - before
}

/// Drop repeated ids, keeping the first occurrence. Order is preserved.
pub fn dedup(messages: Vec<Message>) -> Vec<Message> {
    let mut seen = HashSet::with_capacity(messages.len());
    messages
        .into_iter()
        .filter(|m| seen.insert(m.id.clone()))
        .collect()
}

/// Apply a receipt update. Returns true if a message matched.
pub fn patch_status(list: &mut [Message], patch: &StatusPatch) -> bool {
    match list.iter_mut().find(|m| m.id == patch.message_id) {
        Some(msg) => {
            msg.apply_patch(patch);
            true
        }
        None => false,
    }
}

/// Replace the message carrying `temp_id` with the acknowledged server copy.
///
/// The server copy takes the temporary message's slot and is re-sorted only if
/// the server timestamp moves it. If the server id is already in the list (it
/// arrived through history first) the temporary copy is simply removed.
/// Returns false when `temp_id` is no longer present.
pub fn replace_temporary(list: &mut Vec<Message>, temp_id: &MessageId, confirmed: Message) -> bool {
    let Some(pos) = list.iter().position(|m| &m.id == temp_id) else {
        return false;
    };

    if list.iter().any(|m| m.id == confirmed.id) {
        list.remove(pos);
    } else {
        list[pos] = confirmed;
        list.sort_by(chronological);
    }
    true
}

/// Remove a message by id. Returns the removed message.
pub fn remove(list: &mut Vec<Message>, id: &MessageId) -> Option<Message> {
    let pos = list.iter().position(|m| &m.id == id)?;
    Some(list.remove(pos))
}

/// True if `list` is sorted and free of repeated ids.
pub fn is_consistent(list: &[Message]) -> bool {
    let mut seen = HashSet::with_capacity(list.len());
    list.iter().all(|m| seen.insert(&m.id))
        && list
            .windows(2)
            .all(|w| chronological(&w[0], &w[1]) != Ordering::Greater)
}
