use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use shared::{
    domain::{ConversationId, UserId},
    protocol::{Conversation, DirectMessage, Participant, RealtimeEvent},
};
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{debug, info, warn};

use crate::{ChatSessionManager, CloseReason, Session, UnreadCounter};

/// What the client does with a pushed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDisposition {
    Render,
    CountOnly,
    Ignore,
}

/// What a pushed participant change means for the signed-in user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantTransition {
    SelfLeftCurrent,
    CounterpartLeftCurrent,
    StructuralChange,
    Incidental,
}

/// The open conversation as seen by the classifier.
#[derive(Debug, Clone, Copy)]
pub struct ConversationView<'a> {
    pub conversation_id: ConversationId,
    pub cutoff: DateTime<Utc>,
    pub messages: &'a [DirectMessage],
}

pub fn classify_message(
    me: UserId,
    current: Option<ConversationView<'_>>,
    message: &DirectMessage,
) -> MessageDisposition {
    if message.sender_id == me {
        return MessageDisposition::Ignore;
    }
    match current {
        Some(view) if view.conversation_id == message.conversation_id => {
            if message.created_at < view.cutoff
                || view.messages.iter().any(|known| known.id == message.id)
            {
                MessageDisposition::Ignore
            } else {
                MessageDisposition::Render
            }
        }
        _ => MessageDisposition::CountOnly,
    }
}

pub fn classify_participant_change(
    me: UserId,
    current: Option<&Conversation>,
    old: Option<&Participant>,
    new: &Participant,
) -> ParticipantTransition {
    // a missing old image is an insert
    let structural = old.map_or(true, |old| old.is_active() != new.is_active());
    if !structural {
        return ParticipantTransition::Incidental;
    }

    if let Some(current) = current.filter(|c| c.id == new.conversation_id) {
        if !new.is_active() {
            if new.user_id == me {
                return ParticipantTransition::SelfLeftCurrent;
            }
            if current.counterpart(me) == Some(new.user_id) {
                return ParticipantTransition::CounterpartLeftCurrent;
            }
        }
    }

    if new.user_id == me {
        ParticipantTransition::StructuralChange
    } else {
        ParticipantTransition::Incidental
    }
}

/// Applies backend pushes to the chat and unread state of one client.
pub struct RealtimeBridge {
    chat: Arc<ChatSessionManager>,
    unread: Arc<UnreadCounter>,
    session: Session,
}

impl RealtimeBridge {
    pub fn new(chat: Arc<ChatSessionManager>, unread: Arc<UnreadCounter>, session: Session) -> Self {
        Self {
            chat,
            unread,
            session,
        }
    }

    pub async fn handle_event(&self, event: RealtimeEvent) {
        let Ok(me) = self.session.current_user().await else {
            debug!("realtime: dropping push while signed out");
            return;
        };

        match event {
            RealtimeEvent::MessageInserted { message } => self.on_message(me, message).await,
            RealtimeEvent::ParticipantChanged { old, new } => {
                let current = self.chat.current_conversation().await;
                let transition =
                    classify_participant_change(me, current.as_ref(), old.as_ref(), &new);
                debug!(
                    conversation_id = new.conversation_id.0,
                    user_id = new.user_id.0,
                    ?transition,
                    "realtime: participant changed"
                );
                match transition {
                    ParticipantTransition::SelfLeftCurrent => {
                        self.chat
                            .clear_conversation(new.conversation_id, CloseReason::Left)
                            .await;
                        self.refresh_list().await;
                    }
                    ParticipantTransition::CounterpartLeftCurrent
                    | ParticipantTransition::StructuralChange => self.refresh_list().await,
                    ParticipantTransition::Incidental => {}
                }
            }
            RealtimeEvent::ConversationDeleted { conversation_id } => {
                info!(
                    conversation_id = conversation_id.0,
                    "realtime: conversation deleted"
                );
                self.chat
                    .clear_conversation(conversation_id, CloseReason::Deleted)
                    .await;
                self.refresh_list().await;
            }
            RealtimeEvent::Resync { skipped } => {
                warn!(skipped, "realtime: backend dropped pushes, resyncing");
                self.refresh_list().await;
            }
        }
    }

    async fn on_message(&self, me: UserId, message: DirectMessage) {
        let conversation_id = message.conversation_id;
        match self.chat.accept_pushed_message(me, &message).await {
            MessageDisposition::Render => {
                if let Err(err) = self.unread.mark_read(conversation_id).await {
                    warn!(
                        conversation_id = conversation_id.0,
                        "realtime: failed to advance read marker: {err}"
                    );
                }
            }
            MessageDisposition::CountOnly => {
                if !self.chat.is_member(conversation_id, me).await {
                    return;
                }
                if self.unread.increment_on_push(&message, me).await {
                    self.refresh_list().await;
                }
            }
            MessageDisposition::Ignore => {}
        }
    }

    async fn refresh_list(&self) {
        if let Err(err) = self.chat.refresh_conversations().await {
            warn!("realtime: conversation refresh failed: {err}");
        }
    }

    /// Consumes `changes` until the sender side closes.
    pub fn spawn(self: Arc<Self>, changes: broadcast::Receiver<RealtimeEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut stream = BroadcastStream::new(changes);
            while let Some(item) = stream.next().await {
                match item {
                    Ok(event) => self.handle_event(event).await,
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        warn!(skipped, "realtime: push stream lagged, resyncing");
                        self.refresh_list().await;
                    }
                }
            }
            info!("realtime: push stream closed");
        })
    }
}

#[cfg(test)]
#[path = "tests/realtime_tests.rs"]
mod tests;
