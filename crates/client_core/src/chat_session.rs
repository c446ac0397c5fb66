use std::sync::Arc;

use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, GroupId, UserId},
    protocol::{Conversation, DirectMessage, Participant},
};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

use crate::{
    realtime::{classify_message, ConversationView, MessageDisposition},
    BackendError, ChatBackend, ChatError, ClientEvent, CloseReason, Session, UnreadCounter,
};

struct OpenConversation {
    conversation: Conversation,
    cutoff: DateTime<Utc>,
    messages: Vec<DirectMessage>,
}

impl OpenConversation {
    fn view(&self) -> ConversationView<'_> {
        ConversationView {
            conversation_id: self.conversation.id,
            cutoff: self.cutoff,
            messages: &self.messages,
        }
    }

    /// Adds messages not seen yet and keeps the list ordered.
    fn merge(&mut self, incoming: impl IntoIterator<Item = DirectMessage>) -> Vec<DirectMessage> {
        let mut added = Vec::new();
        for message in incoming {
            if message.created_at < self.cutoff
                || self.messages.iter().any(|known| known.id == message.id)
            {
                continue;
            }
            added.push(message.clone());
            self.messages.push(message);
        }
        self.messages
            .sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        added
    }
}

#[derive(Default)]
struct ChatState {
    current: Option<OpenConversation>,
    conversations: Vec<Conversation>,
}

/// Owns the open direct chat of one signed-in user.
pub struct ChatSessionManager {
    backend: Arc<dyn ChatBackend>,
    session: Session,
    unread: Arc<UnreadCounter>,
    state: Mutex<ChatState>,
    events: broadcast::Sender<ClientEvent>,
}

impl ChatSessionManager {
    pub(crate) fn new(
        backend: Arc<dyn ChatBackend>,
        session: Session,
        unread: Arc<UnreadCounter>,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        Self {
            backend,
            session,
            unread,
            state: Mutex::new(ChatState::default()),
            events,
        }
    }

    /// Selects a conversation, rejoining it if needed, and loads every
    /// message from the caller's join cutoff onwards.
    pub async fn open_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<DirectMessage>, ChatError> {
        let me = self.session.current_user().await?;
        let result = self.open_inner(me, conversation_id).await;
        self.surface(result, "open conversation")
    }

    async fn open_inner(
        &self,
        me: UserId,
        conversation_id: ConversationId,
    ) -> Result<Vec<DirectMessage>, ChatError> {
        let conversation = self
            .backend
            .load_conversation(conversation_id)
            .await?
            .ok_or_else(|| BackendError::NotFound(format!("conversation {conversation_id}")))?;
        if !conversation.involves(me) {
            return Err(ChatError::NotParticipant {
                conversation_id: conversation_id.0,
                user_id: me.0,
            });
        }

        let existing = self.backend.load_participant(conversation_id, me).await?;
        {
            let mut guard = self.state.lock().await;
            if existing.as_ref().is_some_and(|p| !p.is_active()) {
                debug!(
                    conversation_id = conversation_id.0,
                    "chat: dropping messages from before departure"
                );
            }
            guard.current = None;
        }
        self.unread.set_open(None).await;

        let participant = self.ensure_loaded(existing, conversation_id, me).await?;

        // select before loading so pushes racing the load land in the view
        {
            let mut guard = self.state.lock().await;
            guard.current = Some(OpenConversation {
                conversation,
                cutoff: participant.joined_at,
                messages: Vec::new(),
            });
        }
        self.unread.set_open(Some(conversation_id)).await;

        let loaded = match self
            .backend
            .list_messages(conversation_id, Some(participant.joined_at))
            .await
        {
            Ok(loaded) => loaded,
            Err(err) => {
                self.deselect(conversation_id).await;
                return Err(err.into());
            }
        };

        let messages = {
            let mut guard = self.state.lock().await;
            match guard.current.as_mut() {
                Some(open) if open.conversation.id == conversation_id => {
                    open.merge(loaded);
                    open.messages.clone()
                }
                _ => loaded,
            }
        };

        if let Err(err) = self.unread.mark_read(conversation_id).await {
            warn!(
                conversation_id = conversation_id.0,
                "chat: failed to store read marker: {err}"
            );
        }
        let _ = self.events.send(ClientEvent::ConversationOpened {
            conversation_id,
            messages: messages.len(),
        });
        info!(
            conversation_id = conversation_id.0,
            user_id = me.0,
            messages = messages.len(),
            cutoff = %participant.joined_at,
            "chat: opened conversation"
        );
        Ok(messages)
    }

    async fn deselect(&self, conversation_id: ConversationId) {
        {
            let mut guard = self.state.lock().await;
            if guard
                .current
                .as_ref()
                .is_some_and(|open| open.conversation.id == conversation_id)
            {
                guard.current = None;
            }
        }
        if self.unread.open_conversation().await == Some(conversation_id) {
            self.unread.set_open(None).await;
        }
    }

    /// Makes `user_id` an active participant. Performs no write when the row
    /// is already active.
    pub async fn ensure_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Participant, ChatError> {
        let existing = self.backend.load_participant(conversation_id, user_id).await?;
        Ok(self.ensure_loaded(existing, conversation_id, user_id).await?)
    }

    async fn ensure_loaded(
        &self,
        existing: Option<Participant>,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Participant, BackendError> {
        match existing {
            Some(participant) if participant.is_active() => Ok(participant),
            Some(_) => self.rejoin(conversation_id, user_id).await,
            None => match self.backend.create_participant(conversation_id, user_id).await {
                Ok(participant) => {
                    debug!(
                        conversation_id = conversation_id.0,
                        user_id = user_id.0,
                        "chat: participant created"
                    );
                    Ok(participant)
                }
                Err(err) if err.is_conflict() => {
                    let participant = self
                        .backend
                        .load_participant(conversation_id, user_id)
                        .await?
                        .ok_or_else(|| {
                            BackendError::NotFound(format!(
                                "participant {user_id} of conversation {conversation_id}"
                            ))
                        })?;
                    if participant.is_active() {
                        Ok(participant)
                    } else {
                        self.rejoin(conversation_id, user_id).await
                    }
                }
                Err(err) => Err(err),
            },
        }
    }

    async fn rejoin(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Participant, BackendError> {
        let participant = self
            .backend
            .rejoin_participant(conversation_id, user_id)
            .await?;
        info!(
            conversation_id = conversation_id.0,
            user_id = user_id.0,
            joined_at = %participant.joined_at,
            "chat: participant rejoined"
        );
        Ok(participant)
    }

    /// Sends into the open conversation. The counterpart is reactivated before
    /// the insert so the message lands after their new cutoff.
    pub async fn send_message(&self, content: &str) -> Result<DirectMessage, ChatError> {
        let me = self.session.current_user().await?;
        let result = self.send_inner(me, content).await;
        self.surface(result, "send message")
    }

    async fn send_inner(&self, me: UserId, content: &str) -> Result<DirectMessage, ChatError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        let conversation = self
            .current_conversation()
            .await
            .ok_or(ChatError::NoConversationSelected)?;
        let counterpart = conversation
            .counterpart(me)
            .ok_or(ChatError::NotParticipant {
                conversation_id: conversation.id.0,
                user_id: me.0,
            })?;

        self.ensure_participant(conversation.id, counterpart).await?;
        let mine = self.ensure_participant(conversation.id, me).await?;
        {
            let mut guard = self.state.lock().await;
            if let Some(open) = guard
                .current
                .as_mut()
                .filter(|open| open.conversation.id == conversation.id)
            {
                if mine.joined_at > open.cutoff {
                    open.cutoff = mine.joined_at;
                    let cutoff = open.cutoff;
                    open.messages.retain(|m| m.created_at >= cutoff);
                }
            }
        }

        let message = self
            .backend
            .insert_message(conversation.id, me, content)
            .await?;

        let rendered = {
            let mut guard = self.state.lock().await;
            match guard
                .current
                .as_mut()
                .filter(|open| open.conversation.id == conversation.id)
            {
                Some(open) => !open.merge([message.clone()]).is_empty(),
                None => false,
            }
        };
        if rendered {
            let _ = self.events.send(ClientEvent::MessageRendered {
                message: message.clone(),
            });
        }
        info!(
            conversation_id = conversation.id.0,
            message_id = message.id.0,
            "chat: message sent"
        );
        Ok(message)
    }

    /// Returns the group's conversation for the pair, creating it when absent.
    /// A lost creation race resolves to the winner's row.
    pub async fn find_or_create_conversation(
        &self,
        group_id: GroupId,
        host_id: UserId,
        member_id: UserId,
    ) -> Result<Conversation, ChatError> {
        self.session.current_user().await?;
        let result = self.find_or_create_inner(group_id, host_id, member_id).await;
        self.surface(result, "find or create conversation")
    }

    async fn find_or_create_inner(
        &self,
        group_id: GroupId,
        host_id: UserId,
        member_id: UserId,
    ) -> Result<Conversation, ChatError> {
        if let Some(existing) = self
            .backend
            .find_conversation(group_id, host_id, member_id)
            .await?
        {
            return Ok(existing);
        }

        match self
            .backend
            .create_conversation(group_id, host_id, member_id)
            .await
        {
            Ok(created) => {
                info!(
                    conversation_id = created.id.0,
                    group_id = group_id.0,
                    "chat: conversation created"
                );
                Ok(created)
            }
            Err(err) if err.is_conflict() => {
                debug!(group_id = group_id.0, "chat: lost creation race, re-querying");
                let winner = self
                    .backend
                    .find_conversation(group_id, host_id, member_id)
                    .await?
                    .ok_or_else(|| {
                        BackendError::NotFound(format!(
                            "conversation between {host_id} and {member_id} in group {group_id}"
                        ))
                    })?;
                Ok(winner)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn leave_conversation(&self, conversation_id: ConversationId) -> Result<(), ChatError> {
        let me = self.session.current_user().await?;
        let result = self
            .backend
            .leave_conversation(conversation_id, me)
            .await
            .map_err(ChatError::from);
        let participant = self.surface(result, "leave conversation")?;
        info!(
            conversation_id = conversation_id.0,
            left_at = ?participant.left_at,
            "chat: left conversation"
        );

        self.clear_conversation(conversation_id, CloseReason::Left)
            .await;
        if let Err(err) = self.refresh_conversations().await {
            warn!("chat: conversation refresh after leave failed: {err}");
        }
        Ok(())
    }

    /// Drops local state for the conversation. Returns `true` if it was open.
    /// Safe to call repeatedly for the same change.
    pub async fn clear_conversation(
        &self,
        conversation_id: ConversationId,
        reason: CloseReason,
    ) -> bool {
        let was_open = {
            let mut guard = self.state.lock().await;
            guard.conversations.retain(|c| c.id != conversation_id);
            let was_open = guard
                .current
                .as_ref()
                .is_some_and(|open| open.conversation.id == conversation_id);
            if was_open {
                guard.current = None;
            }
            was_open
        };
        self.unread.forget(conversation_id).await;
        if was_open {
            let _ = self.events.send(ClientEvent::ConversationClosed {
                conversation_id,
                reason,
            });
        }
        was_open
    }

    pub async fn refresh_conversations(&self) -> Result<Vec<Conversation>, ChatError> {
        let me = self.session.current_user().await?;
        let conversations = self.backend.list_conversations(me).await?;
        {
            let mut guard = self.state.lock().await;
            guard.conversations = conversations.clone();
        }
        self.unread.refresh(None).await?;
        let _ = self.events.send(ClientEvent::ConversationsRefreshed {
            conversations: conversations.clone(),
        });
        debug!(
            user_id = me.0,
            conversations = conversations.len(),
            "chat: conversations refreshed"
        );
        Ok(conversations)
    }

    /// Classifies a pushed message against the open view and renders it when
    /// it belongs there.
    pub async fn accept_pushed_message(
        &self,
        me: UserId,
        message: &DirectMessage,
    ) -> MessageDisposition {
        let mut guard = self.state.lock().await;
        let disposition = classify_message(me, guard.current.as_ref().map(|o| o.view()), message);
        if disposition == MessageDisposition::Render {
            if let Some(open) = guard.current.as_mut() {
                open.merge([message.clone()]);
            }
            let _ = self.events.send(ClientEvent::MessageRendered {
                message: message.clone(),
            });
        }
        disposition
    }

    /// Whether `user_id` is an active member of the conversation, answered
    /// from the cached list first.
    pub(crate) async fn is_member(&self, conversation_id: ConversationId, user_id: UserId) -> bool {
        {
            let guard = self.state.lock().await;
            if guard.conversations.iter().any(|c| c.id == conversation_id)
                || guard
                    .current
                    .as_ref()
                    .is_some_and(|open| open.conversation.id == conversation_id)
            {
                return true;
            }
        }
        match self.backend.load_participant(conversation_id, user_id).await {
            Ok(participant) => participant.is_some_and(|p| p.is_active()),
            Err(err) => {
                warn!(
                    conversation_id = conversation_id.0,
                    "chat: membership lookup failed: {err}"
                );
                false
            }
        }
    }

    pub async fn current_conversation(&self) -> Option<Conversation> {
        self.state
            .lock()
            .await
            .current
            .as_ref()
            .map(|open| open.conversation.clone())
    }

    pub async fn current_cutoff(&self) -> Option<DateTime<Utc>> {
        self.state.lock().await.current.as_ref().map(|open| open.cutoff)
    }

    pub async fn current_messages(&self) -> Vec<DirectMessage> {
        self.state
            .lock()
            .await
            .current
            .as_ref()
            .map(|open| open.messages.clone())
            .unwrap_or_default()
    }

    pub async fn conversations(&self) -> Vec<Conversation> {
        self.state.lock().await.conversations.clone()
    }

    pub(crate) async fn reset(&self) {
        *self.state.lock().await = ChatState::default();
    }

    fn surface<T>(&self, result: Result<T, ChatError>, action: &str) -> Result<T, ChatError> {
        if let Err(err) = &result {
            error!("chat: failed to {action}: {err}");
            let _ = self
                .events
                .send(ClientEvent::Error(format!("failed to {action}: {err}")));
        }
        result
    }
}

#[cfg(test)]
#[path = "tests/chat_session_tests.rs"]
mod tests;
