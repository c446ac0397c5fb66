use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{
    domain::{BroadcastTopic, ConversationId, GroupId, LikeTarget, UserId},
    protocol::{
        BroadcastRequest, Conversation, DirectMessage, LikeBroadcast, LikeState, Participant,
        RealtimeEvent, UnreadCount,
    },
};
use storage::Storage;
use tokio::sync::broadcast;
use tracing::debug;

use crate::{BackendError, BroadcastChannel, ChatBackend, LikeBackend};

const PUSH_CAPACITY: usize = 256;

/// In-process backend of record over SQLite. Every participant write is
/// pushed with its before and after image, mirroring a row-change feed.
pub struct EmbeddedBackend {
    storage: Storage,
    changes: broadcast::Sender<RealtimeEvent>,
    broadcasts: broadcast::Sender<BroadcastRequest>,
}

impl EmbeddedBackend {
    pub async fn open(database_url: &str) -> Result<Arc<Self>> {
        Ok(Self::from_storage(Storage::new(database_url).await?))
    }

    pub fn from_storage(storage: Storage) -> Arc<Self> {
        let (changes, _) = broadcast::channel(PUSH_CAPACITY);
        let (broadcasts, _) = broadcast::channel(PUSH_CAPACITY);
        Arc::new(Self {
            storage,
            changes,
            broadcasts,
        })
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    fn push(&self, event: RealtimeEvent) {
        // no subscribers is fine
        let _ = self.changes.send(event);
    }

    fn participant_changed(&self, old: Option<Participant>, new: Participant) {
        self.push(RealtimeEvent::ParticipantChanged { old, new });
    }

    async fn existing_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Participant, BackendError> {
        self.storage
            .load_participant(conversation_id, user_id)
            .await?
            .ok_or_else(|| {
                BackendError::NotFound(format!(
                    "participant {user_id} of conversation {conversation_id}"
                ))
            })
    }
}

#[async_trait]
impl ChatBackend for EmbeddedBackend {
    async fn find_conversation(
        &self,
        group_id: GroupId,
        user_a: UserId,
        user_b: UserId,
    ) -> Result<Option<Conversation>, BackendError> {
        Ok(self.storage.find_direct_chat(group_id, user_a, user_b).await?)
    }

    async fn create_conversation(
        &self,
        group_id: GroupId,
        host_id: UserId,
        member_id: UserId,
    ) -> Result<Conversation, BackendError> {
        let Some(conversation) = self
            .storage
            .insert_direct_chat(group_id, host_id, member_id, Utc::now())
            .await?
        else {
            return Err(BackendError::Conflict(format!(
                "conversation between {host_id} and {member_id} in group {group_id}"
            )));
        };
        for user_id in [host_id, member_id] {
            if let Some(participant) = self
                .storage
                .load_participant(conversation.id, user_id)
                .await?
            {
                self.participant_changed(None, participant);
            }
        }
        debug!(
            conversation_id = conversation.id.0,
            "embedded: conversation inserted"
        );
        Ok(conversation)
    }

    async fn load_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<Conversation>, BackendError> {
        Ok(self.storage.load_direct_chat(conversation_id).await?)
    }

    async fn list_conversations(&self, user_id: UserId) -> Result<Vec<Conversation>, BackendError> {
        Ok(self.storage.list_direct_chats_for_user(user_id).await?)
    }

    async fn delete_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<(), BackendError> {
        if !self.storage.delete_direct_chat(conversation_id).await? {
            return Err(BackendError::NotFound(format!(
                "conversation {conversation_id}"
            )));
        }
        self.push(RealtimeEvent::ConversationDeleted { conversation_id });
        Ok(())
    }

    async fn load_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Option<Participant>, BackendError> {
        Ok(self.storage.load_participant(conversation_id, user_id).await?)
    }

    async fn create_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Participant, BackendError> {
        let Some(participant) = self
            .storage
            .insert_participant(conversation_id, user_id, Utc::now())
            .await?
        else {
            return Err(BackendError::Conflict(format!(
                "participant {user_id} of conversation {conversation_id}"
            )));
        };
        self.participant_changed(None, participant.clone());
        Ok(participant)
    }

    async fn rejoin_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Participant, BackendError> {
        let old = self.existing_participant(conversation_id, user_id).await?;
        let new = self
            .storage
            .reactivate_participant(conversation_id, user_id, Utc::now())
            .await?
            .ok_or_else(|| {
                BackendError::NotFound(format!(
                    "participant {user_id} of conversation {conversation_id}"
                ))
            })?;
        self.participant_changed(Some(old), new.clone());
        Ok(new)
    }

    async fn leave_conversation(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Participant, BackendError> {
        let old = self.existing_participant(conversation_id, user_id).await?;
        let new = self
            .storage
            .mark_participant_left(conversation_id, user_id, Utc::now())
            .await?
            .ok_or_else(|| {
                BackendError::NotFound(format!(
                    "participant {user_id} of conversation {conversation_id}"
                ))
            })?;
        self.participant_changed(Some(old), new.clone());
        Ok(new)
    }

    async fn mark_read(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<(), BackendError> {
        let old = self.existing_participant(conversation_id, user_id).await?;
        if let Some(new) = self
            .storage
            .mark_read(conversation_id, user_id, Utc::now())
            .await?
        {
            self.participant_changed(Some(old), new);
        }
        Ok(())
    }

    async fn insert_message(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        content: &str,
    ) -> Result<DirectMessage, BackendError> {
        let message = self
            .storage
            .insert_message(conversation_id, sender_id, content, Utc::now())
            .await?;
        self.push(RealtimeEvent::MessageInserted {
            message: message.clone(),
        });
        Ok(message)
    }

    async fn list_messages(
        &self,
        conversation_id: ConversationId,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<DirectMessage>, BackendError> {
        Ok(self.storage.list_messages(conversation_id, since).await?)
    }

    async fn unread_counts(
        &self,
        user_id: UserId,
        conversation_ids: Option<&[ConversationId]>,
    ) -> Result<Vec<UnreadCount>, BackendError> {
        let mut counts = self.storage.unread_counts(user_id).await?;
        if let Some(subset) = conversation_ids {
            counts.retain(|row| subset.contains(&row.conversation_id));
        }
        Ok(counts)
    }

    fn subscribe_changes(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.changes.subscribe()
    }
}

#[async_trait]
impl LikeBackend for EmbeddedBackend {
    async fn like_state(
        &self,
        target: LikeTarget,
        user_id: UserId,
    ) -> Result<LikeState, BackendError> {
        Ok(self.storage.like_state(target, user_id).await?)
    }

    async fn add_like(&self, target: LikeTarget, user_id: UserId) -> Result<(), BackendError> {
        self.storage.insert_like(target, user_id).await?;
        Ok(())
    }

    async fn remove_like(&self, target: LikeTarget, user_id: UserId) -> Result<(), BackendError> {
        self.storage.delete_like(target, user_id).await?;
        Ok(())
    }
}

#[async_trait]
impl BroadcastChannel for EmbeddedBackend {
    async fn publish(
        &self,
        topic: BroadcastTopic,
        payload: LikeBroadcast,
    ) -> Result<(), BackendError> {
        let _ = self.broadcasts.send(BroadcastRequest { topic, payload });
        Ok(())
    }

    fn subscribe_broadcasts(&self) -> broadcast::Receiver<BroadcastRequest> {
        self.broadcasts.subscribe()
    }
}

#[cfg(test)]
#[path = "tests/embedded_backend_tests.rs"]
mod tests;
