use std::{collections::HashMap, sync::Arc};

use shared::{
    domain::{ConversationId, UserId},
    protocol::DirectMessage,
};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info};

use crate::{ChatBackend, ChatError, ClientEvent, Session};

#[derive(Default)]
struct UnreadState {
    counts: HashMap<ConversationId, u32>,
    open: Option<ConversationId>,
}

impl UnreadState {
    fn visible(&self, conversation_id: ConversationId) -> u32 {
        if self.open == Some(conversation_id) {
            return 0;
        }
        self.counts.get(&conversation_id).copied().unwrap_or(0)
    }
}

/// Per-conversation unread badges, seeded from the backend aggregate and kept
/// current by realtime pushes.
pub struct UnreadCounter {
    backend: Arc<dyn ChatBackend>,
    session: Session,
    state: Mutex<UnreadState>,
    events: broadcast::Sender<ClientEvent>,
}

impl UnreadCounter {
    pub(crate) fn new(
        backend: Arc<dyn ChatBackend>,
        session: Session,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        Self {
            backend,
            session,
            state: Mutex::new(UnreadState::default()),
            events,
        }
    }

    /// Replaces local counts with the backend aggregate.
    ///
    /// With a subset, only those conversations are touched and any of them
    /// missing from the aggregate reads as zero. Without one, the whole map is
    /// replaced.
    pub async fn refresh(
        &self,
        subset: Option<&[ConversationId]>,
    ) -> Result<HashMap<ConversationId, u32>, ChatError> {
        let user_id = self.session.current_user().await?;
        let rows = self.backend.unread_counts(user_id, subset).await?;

        let mut fresh: HashMap<ConversationId, u32> = subset
            .unwrap_or_default()
            .iter()
            .map(|id| (*id, 0))
            .collect();
        for row in rows {
            fresh.insert(row.conversation_id, row.unread);
        }

        let mut guard = self.state.lock().await;
        if subset.is_none() {
            guard.counts.clear();
        }
        for (conversation_id, unread) in &fresh {
            guard.counts.insert(*conversation_id, *unread);
        }
        if let Some(open) = guard.open {
            guard.counts.insert(open, 0);
        }
        for conversation_id in fresh.keys() {
            let _ = self.events.send(ClientEvent::UnreadChanged {
                conversation_id: *conversation_id,
                unread: guard.visible(*conversation_id),
            });
        }
        debug!(
            user_id = user_id.0,
            conversations = guard.counts.len(),
            "unread: refreshed"
        );
        Ok(guard.counts.clone())
    }

    /// Zeroes the local count, then records the read marker in the backend.
    pub async fn mark_read(&self, conversation_id: ConversationId) -> Result<(), ChatError> {
        let user_id = self.session.current_user().await?;
        self.zero(conversation_id).await;
        self.backend.mark_read(conversation_id, user_id).await?;
        debug!(
            conversation_id = conversation_id.0,
            user_id = user_id.0,
            "unread: marked read"
        );
        Ok(())
    }

    pub async fn set_open(&self, conversation_id: Option<ConversationId>) {
        {
            let mut guard = self.state.lock().await;
            guard.open = conversation_id;
        }
        if let Some(conversation_id) = conversation_id {
            self.zero(conversation_id).await;
        }
    }

    pub async fn open_conversation(&self) -> Option<ConversationId> {
        self.state.lock().await.open
    }

    /// Counts a pushed message unless it belongs to the open conversation or
    /// was sent by `me`. Returns `true` when the conversation was not tracked
    /// before.
    pub async fn increment_on_push(&self, message: &DirectMessage, me: UserId) -> bool {
        if message.sender_id == me {
            return false;
        }
        let mut guard = self.state.lock().await;
        if guard.open == Some(message.conversation_id) {
            return false;
        }
        let newly_tracked = !guard.counts.contains_key(&message.conversation_id);
        let count = guard.counts.entry(message.conversation_id).or_insert(0);
        *count = count.saturating_add(1);
        let unread = *count;
        let _ = self.events.send(ClientEvent::UnreadChanged {
            conversation_id: message.conversation_id,
            unread,
        });
        newly_tracked
    }

    pub async fn count(&self, conversation_id: ConversationId) -> u32 {
        self.state.lock().await.visible(conversation_id)
    }

    pub async fn total(&self) -> u32 {
        let guard = self.state.lock().await;
        guard
            .counts
            .keys()
            .map(|id| guard.visible(*id))
            .fold(0u32, u32::saturating_add)
    }

    pub async fn snapshot(&self) -> HashMap<ConversationId, u32> {
        let guard = self.state.lock().await;
        guard
            .counts
            .keys()
            .map(|id| (*id, guard.visible(*id)))
            .collect()
    }

    pub async fn forget(&self, conversation_id: ConversationId) {
        let mut guard = self.state.lock().await;
        guard.counts.remove(&conversation_id);
        if guard.open == Some(conversation_id) {
            guard.open = None;
        }
        let _ = self.events.send(ClientEvent::UnreadChanged {
            conversation_id,
            unread: 0,
        });
    }

    pub(crate) async fn reset_all(&self) {
        *self.state.lock().await = UnreadState::default();
        info!("unread: cleared");
    }

    async fn zero(&self, conversation_id: ConversationId) {
        let mut guard = self.state.lock().await;
        let previous = guard.counts.insert(conversation_id, 0);
        if previous != Some(0) {
            let _ = self.events.send(ClientEvent::UnreadChanged {
                conversation_id,
                unread: 0,
            });
        }
    }
}

#[cfg(test)]
#[path = "tests/unread_tests.rs"]
mod tests;
