/// Conversation directory: known users and groups
///
/// Kept in the order the sidebar shows them, newest first. Groups we are
/// removed from are hidden, never reported as errors.
use crate::types::{Conversation, ConversationKey};

#[derive(Debug, Clone, Default)]
pub struct Directory {
    users: Vec<Conversation>,
    groups: Vec<Conversation>,
}

impl Directory {
    /// Replace contents with an initial listing
    pub fn load(&mut self, users: Vec<Conversation>, groups: Vec<Conversation>) {
        self.users = unique(users);
        self.groups = unique(groups);
    }

    /// Add a newly registered user. Returns false if already known.
    pub fn add_user(&mut self, user: Conversation) -> bool {
        insert_front(&mut self.users, user)
    }

    /// Add a group we joined. Returns false if already known.
    pub fn add_group(&mut self, group: Conversation) -> bool {
        insert_front(&mut self.groups, group)
    }

    /// Replace a group's metadata in place. Unknown groups are ignored.
    pub fn update_group(&mut self, group: Conversation) -> bool {
        match self.groups.iter_mut().find(|g| g.key == group.key) {
            Some(existing) => {
                *existing = group;
                true
            }
            None => false,
        }
    }

    pub fn remove_group(&mut self, group_id: &str) -> bool {
        let before = self.groups.len();
        self.groups.retain(|g| g.key.id != group_id);
        self.groups.len() != before
    }

    pub fn get(&self, key: &ConversationKey) -> Option<&Conversation> {
        let list = if key.is_group() { &self.groups } else { &self.users };
        list.iter().find(|c| &c.key == key)
    }

    pub fn users(&self) -> &[Conversation] {
        &self.users
    }

    pub fn groups(&self) -> &[Conversation] {
        &self.groups
    }
}

fn insert_front(list: &mut Vec<Conversation>, entry: Conversation) -> bool {
    if list.iter().any(|c| c.key == entry.key) {
        return false;
    }
    list.insert(0, entry);
    true
}

fn unique(list: Vec<Conversation>) -> Vec<Conversation> {
    let mut out: Vec<Conversation> = Vec::with_capacity(list.len());
    for c in list {
        if !out.iter().any(|o| o.key == c.key) {
            out.push(c);
        }
    }
    out
}
