//! Single entry point for every HistoryCache mutation: live frames, REST
//! mutation results, and page fetches all merge through here.

use shared::{
    domain::{ConversationId, MessageId},
    protocol::{BulkDeleteResult, Message, ServerFrame},
};
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use crate::{
    cache::{ConversationHistory, HistoryCache, MergeOutcome, PageCursor, PageMerge},
    ClientEvent,
};

pub struct SyncEngine {
    cache: RwLock<HistoryCache>,
    events: broadcast::Sender<ClientEvent>,
}

impl SyncEngine {
    pub fn new(events: broadcast::Sender<ClientEvent>) -> Self {
        Self {
            cache: RwLock::new(HistoryCache::new()),
            events,
        }
    }

    pub async fn apply_frame(&self, conversation_id: ConversationId, frame: ServerFrame) -> bool {
        match frame {
            ServerFrame::MessageNew { message } => {
                self.append(conversation_id, message).await.changed()
            }
            ServerFrame::MessageEdited { message } => {
                self.patch(conversation_id, message).await.changed()
            }
            ServerFrame::MessageDeleted { message_ids } => {
                self.remove(conversation_id, &message_ids).await > 0
            }
            ServerFrame::Connected { .. } | ServerFrame::Unknown => false,
        }
    }

    pub async fn append(&self, conversation_id: ConversationId, message: Message) -> MergeOutcome {
        let id = message.id;
        let outcome = self.cache.write().await.entry(conversation_id).append(message);
        debug!(
            conversation_id = conversation_id.0,
            message_id = id.0,
            ?outcome,
            "sync: append"
        );
        self.notify(conversation_id, outcome.changed());
        outcome
    }

    pub async fn patch(&self, conversation_id: ConversationId, message: Message) -> MergeOutcome {
        let id = message.id;
        let outcome = self.cache.write().await.entry(conversation_id).patch(message);
        debug!(
            conversation_id = conversation_id.0,
            message_id = id.0,
            ?outcome,
            "sync: patch"
        );
        self.notify(conversation_id, outcome.changed());
        outcome
    }

    /// Returns how many of `ids` were present and dropped.
    pub async fn remove(&self, conversation_id: ConversationId, ids: &[MessageId]) -> usize {
        let removed = {
            let mut cache = self.cache.write().await;
            let history = cache.entry(conversation_id);
            ids.iter()
                .filter(|id| history.remove(**id).changed())
                .count()
        };
        debug!(
            conversation_id = conversation_id.0,
            requested = ids.len(),
            removed,
            "sync: remove"
        );
        self.notify(conversation_id, removed > 0);
        removed
    }

    /// Applies only the `deleted` subset of a bulk delete outcome.
    pub async fn apply_bulk_delete(
        &self,
        conversation_id: ConversationId,
        result: &BulkDeleteResult,
    ) -> usize {
        self.remove(conversation_id, &result.deleted).await
    }

    pub async fn merge_page(
        &self,
        conversation_id: ConversationId,
        cursor: PageCursor,
        page: Vec<Message>,
    ) -> PageMerge {
        let merge = self
            .cache
            .write()
            .await
            .entry(conversation_id)
            .merge_page(cursor, page);
        debug!(
            conversation_id = conversation_id.0,
            ?cursor,
            received = merge.received,
            inserted = merge.inserted,
            reached_end = merge.reached_end,
            "sync: page merged"
        );
        self.notify(conversation_id, merge.inserted > 0 || merge.reached_end);
        merge
    }

    pub async fn timeline(&self, conversation_id: ConversationId) -> Vec<Message> {
        self.read(conversation_id, ConversationHistory::timeline)
            .await
            .unwrap_or_default()
    }

    pub async fn has_history(&self, conversation_id: ConversationId) -> bool {
        self.read(conversation_id, |h| !h.is_empty() || h.is_fully_loaded())
            .await
            .unwrap_or(false)
    }

    pub async fn oldest_id(&self, conversation_id: ConversationId) -> Option<MessageId> {
        self.read(conversation_id, ConversationHistory::oldest_id)
            .await
            .flatten()
    }

    pub async fn newest_id(&self, conversation_id: ConversationId) -> Option<MessageId> {
        self.read(conversation_id, ConversationHistory::newest_id)
            .await
            .flatten()
    }

    pub async fn is_fully_loaded(&self, conversation_id: ConversationId) -> bool {
        self.read(conversation_id, ConversationHistory::is_fully_loaded)
            .await
            .unwrap_or(false)
    }

    /// Drops every cached conversation. Used on logout.
    pub async fn clear_all(&self) {
        self.cache.write().await.clear();
    }

    async fn read<T>(
        &self,
        conversation_id: ConversationId,
        f: impl FnOnce(&ConversationHistory) -> T,
    ) -> Option<T> {
        self.cache.read().await.get(conversation_id).map(f)
    }

    fn notify(&self, conversation_id: ConversationId, changed: bool) {
        if changed {
            let _ = self
                .events
                .send(ClientEvent::HistoryChanged { conversation_id });
        }
    }
}

#[cfg(test)]
#[path = "tests/sync_tests.rs"]
mod tests;
