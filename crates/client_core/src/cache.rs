//! Per-conversation paginated message history.
//!
//! Every conversation keeps a list of pages. Concatenated oldest page first,
//! they form one timeline that is strictly ascending by message id with no
//! duplicates. All mutation goes through the merge operations below, which
//! never reject input: targets that are absent are skipped.

use std::collections::{HashMap, HashSet, VecDeque};

use shared::{
    domain::{ConversationId, MessageId},
    protocol::Message,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Applied,
    /// The id was already present.
    Duplicate,
    /// The target was absent or previously removed.
    Ignored,
}

impl MergeOutcome {
    pub fn changed(self) -> bool {
        matches!(self, MergeOutcome::Applied)
    }
}

/// Which slice of history a fetched page answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageCursor {
    /// Newest messages, no cursor.
    Latest,
    /// Messages strictly older than the id.
    Before(MessageId),
    /// Messages strictly newer than the id.
    After(MessageId),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageMerge {
    pub received: usize,
    pub inserted: usize,
    pub reached_end: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ConversationHistory {
    pages: VecDeque<Vec<Message>>,
    present: HashSet<MessageId>,
    removed: HashSet<MessageId>,
    fully_loaded: bool,
}

impl ConversationHistory {
    pub fn timeline(&self) -> Vec<Message> {
        self.pages.iter().flatten().cloned().collect()
    }

    pub fn ids(&self) -> Vec<MessageId> {
        self.pages.iter().flatten().map(|m| m.id).collect()
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn len(&self) -> usize {
        self.present.len()
    }

    pub fn is_empty(&self) -> bool {
        self.present.is_empty()
    }

    pub fn oldest_id(&self) -> Option<MessageId> {
        self.pages.front().and_then(|page| page.first()).map(|m| m.id)
    }

    pub fn newest_id(&self) -> Option<MessageId> {
        self.pages.back().and_then(|page| page.last()).map(|m| m.id)
    }

    pub fn is_fully_loaded(&self) -> bool {
        self.fully_loaded
    }

    pub fn is_removed(&self, id: MessageId) -> bool {
        self.removed.contains(&id)
    }

    pub fn get(&self, id: MessageId) -> Option<&Message> {
        let (page, slot) = self.locate(id)?;
        self.pages.get(page).and_then(|p| p.get(slot))
    }

    /// New message. Idempotent against duplicate delivery.
    pub fn append(&mut self, message: Message) -> MergeOutcome {
        if message.deleted {
            return self.remove(message.id);
        }
        if self.removed.contains(&message.id) {
            return MergeOutcome::Ignored;
        }
        if self.present.contains(&message.id) {
            return MergeOutcome::Duplicate;
        }
        self.insert_sorted(message);
        MergeOutcome::Applied
    }

    /// Edited message. Replaces the server-supplied fields in place.
    pub fn patch(&mut self, message: Message) -> MergeOutcome {
        if self.removed.contains(&message.id) {
            return MergeOutcome::Ignored;
        }
        if message.deleted {
            return self.remove(message.id);
        }
        let Some((page, slot)) = self.locate(message.id) else {
            return MergeOutcome::Ignored;
        };
        if let Some(existing) = self.pages.get_mut(page).and_then(|p| p.get_mut(slot)) {
            *existing = message;
        }
        MergeOutcome::Applied
    }

    /// Terminal per id: once removed, later appends and patches are ignored.
    pub fn remove(&mut self, id: MessageId) -> MergeOutcome {
        self.removed.insert(id);
        let Some((page, slot)) = self.locate(id) else {
            return MergeOutcome::Ignored;
        };
        if let Some(p) = self.pages.get_mut(page) {
            p.remove(slot);
            if p.is_empty() {
                self.pages.remove(page);
            }
        }
        self.present.remove(&id);
        MergeOutcome::Applied
    }

    /// Merges a fetched page. An empty `Latest`/`Before` page marks the
    /// conversation fully loaded.
    pub fn merge_page(&mut self, cursor: PageCursor, page: Vec<Message>) -> PageMerge {
        let received = page.len();
        if page.is_empty() {
            let reached_end = matches!(cursor, PageCursor::Latest | PageCursor::Before(_));
            if reached_end {
                self.fully_loaded = true;
            }
            return PageMerge {
                received,
                inserted: 0,
                reached_end,
            };
        }

        let mut incoming: Vec<Message> = page
            .into_iter()
            .filter(|m| match cursor {
                PageCursor::Before(bound) => m.id < bound,
                PageCursor::After(bound) => m.id > bound,
                PageCursor::Latest => true,
            })
            .filter(|m| !m.deleted && !self.removed.contains(&m.id))
            .filter(|m| !self.present.contains(&m.id))
            .collect();
        incoming.sort_by_key(|m| m.id);
        incoming.dedup_by_key(|m| m.id);

        let inserted = incoming.len();
        match self.oldest_id() {
            None if !incoming.is_empty() => {
                for message in &incoming {
                    self.present.insert(message.id);
                }
                self.pages.push_back(incoming);
            }
            Some(oldest) if matches!(cursor, PageCursor::Before(_)) => {
                let split = incoming.partition_point(|m| m.id < oldest);
                let stragglers = incoming.split_off(split);
                if !incoming.is_empty() {
                    for message in &incoming {
                        self.present.insert(message.id);
                    }
                    self.pages.push_front(incoming);
                }
                for message in stragglers {
                    self.insert_sorted(message);
                }
            }
            _ => {
                for message in incoming {
                    self.insert_sorted(message);
                }
            }
        }

        PageMerge {
            received,
            inserted,
            reached_end: false,
        }
    }

    fn locate(&self, id: MessageId) -> Option<(usize, usize)> {
        if !self.present.contains(&id) {
            return None;
        }
        let page = self
            .pages
            .iter()
            .position(|p| p.last().is_some_and(|last| last.id >= id))?;
        let slot = self.pages[page].binary_search_by_key(&id, |m| m.id).ok()?;
        Some((page, slot))
    }

    fn insert_sorted(&mut self, message: Message) {
        self.present.insert(message.id);
        let id = message.id;
        let target = self
            .pages
            .iter()
            .position(|p| p.last().is_some_and(|last| last.id > id));
        match target {
            Some(page) => {
                let p = &mut self.pages[page];
                let slot = p.partition_point(|m| m.id < id);
                p.insert(slot, message);
            }
            None => match self.pages.back_mut() {
                Some(newest) => newest.push(message),
                None => self.pages.push_back(vec![message]),
            },
        }
    }
}

/// Histories for every conversation seen this session.
#[derive(Debug, Default)]
pub struct HistoryCache {
    conversations: HashMap<ConversationId, ConversationHistory>,
}

impl HistoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, conversation_id: ConversationId) -> Option<&ConversationHistory> {
        self.conversations.get(&conversation_id)
    }

    pub fn entry(&mut self, conversation_id: ConversationId) -> &mut ConversationHistory {
        self.conversations.entry(conversation_id).or_default()
    }

    pub fn evict(&mut self, conversation_id: ConversationId) -> bool {
        self.conversations.remove(&conversation_id).is_some()
    }

    pub fn clear(&mut self) {
        self.conversations.clear();
    }

    pub fn conversation_count(&self) -> usize {
        self.conversations.len()
    }
}

#[cfg(test)]
#[path = "tests/cache_tests.rs"]
mod tests;
