/// Page reconciler state machine
///
/// Tracks which history page of the open conversation is loaded, whether a
/// request is in flight and whether older pages remain:
///
///   Idle -> Loading(1) -> Ready -> LoadingMore(n) -> Ready | Failed
///
/// The reconciler only tracks page bookkeeping. Message lists are merged by
/// the synchronizer through `crate::merge`.
use crate::types::{ConversationKey, MessagePage};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PageState {
    Idle,
    Loading { page: u32 },
    Ready,
    LoadingMore { page: u32 },
    Failed { page: u32, reason: String },
}

impl PageState {
    pub fn is_loading(&self) -> bool {
        matches!(self, PageState::Loading { .. } | PageState::LoadingMore { .. })
    }
}

/// Tag attached to every history request. A response is applied only if its
/// ticket still matches the reconciler that issued it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTicket {
    pub conversation: ConversationKey,
    pub generation: u64,
    pub page: u32,
}

#[derive(Debug, Clone)]
pub struct PageReconciler {
    conversation: ConversationKey,
    generation: u64,
    state: PageState,
    /// Highest page merged so far
    loaded_page: u32,
    has_more: bool,
    total_pages: u32,
}

impl PageReconciler {
    pub fn new(conversation: ConversationKey, generation: u64) -> Self {
        Self {
            conversation,
            generation,
            state: PageState::Idle,
            loaded_page: 0,
            has_more: false,
            total_pages: 0,
        }
    }

    /// New reconciler with the page-1 load already started
    pub fn opening(conversation: ConversationKey, generation: u64) -> (Self, FetchTicket) {
        let mut reconciler = Self::new(conversation, generation);
        reconciler.state = PageState::Loading { page: 1 };
        let ticket = reconciler.ticket(1);
        (reconciler, ticket)
    }

    pub fn conversation(&self) -> &ConversationKey {
        &self.conversation
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> &PageState {
        &self.state
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn total_pages(&self) -> u32 {
        self.total_pages
    }

    pub fn loaded_page(&self) -> u32 {
        self.loaded_page
    }

    /// Start the initial page-1 load. Allowed from `Idle` or after a failed
    /// first load.
    pub fn begin_open(&mut self) -> Option<FetchTicket> {
        match self.state {
            PageState::Idle => {}
            PageState::Failed { page: 1, .. } if self.loaded_page == 0 => {}
            _ => return None,
        }
        self.state = PageState::Loading { page: 1 };
        Some(self.ticket(1))
    }

    /// Start loading the next older page. `None` while a request is in
    /// flight, before the first page landed, or when no pages remain.
    pub fn begin_next(&mut self) -> Option<FetchTicket> {
        match self.state {
            PageState::Ready => {}
            PageState::Failed { .. } if self.loaded_page > 0 => {}
            _ => return None,
        }
        if !self.has_more {
            return None;
        }
        let page = self.loaded_page + 1;
        self.state = PageState::LoadingMore { page };
        Some(self.ticket(page))
    }

    /// Whether a response carrying `ticket` belongs to this reconciler's
    /// outstanding request.
    pub fn accepts(&self, ticket: &FetchTicket) -> bool {
        ticket.conversation == self.conversation
            && ticket.generation == self.generation
            && match self.state {
                PageState::Loading { page } | PageState::LoadingMore { page } => page == ticket.page,
                _ => false,
            }
    }

    /// Record a successful fetch. The caller merges `page.messages`.
    pub fn complete(&mut self, ticket: &FetchTicket, page: &MessagePage) -> bool {
        if !self.accepts(ticket) {
            return false;
        }
        self.loaded_page = ticket.page;
        // total_pages of 0 means the store did not report a count
        self.has_more =
            page.has_more && (page.total_pages == 0 || ticket.page < page.total_pages);
        self.total_pages = page.total_pages.max(ticket.page);
        self.state = PageState::Ready;
        true
    }

    /// Record a failed fetch. Already merged pages stay loaded.
    pub fn fail(&mut self, ticket: &FetchTicket, reason: impl Into<String>) -> bool {
        if !self.accepts(ticket) {
            return false;
        }
        self.state = PageState::Failed {
            page: ticket.page,
            reason: reason.into(),
        };
        true
    }

    fn ticket(&self, page: u32) -> FetchTicket {
        FetchTicket {
            conversation: self.conversation.clone(),
            generation: self.generation,
            page,
        }
    }
}
