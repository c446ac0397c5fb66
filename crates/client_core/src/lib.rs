use std::{sync::Arc, time::Duration};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{
    domain::{BroadcastTopic, ConversationId, GroupId, LikeTarget, UserId},
    protocol::{
        BroadcastRequest, Conversation, DirectMessage, LikeBroadcast, LikeState, Participant,
        RealtimeEvent, UnreadCount,
    },
};
use tokio::{
    sync::{broadcast, Mutex, RwLock},
    task::JoinHandle,
};
use tracing::info;

mod chat_session;
pub mod embedded_backend;
pub mod error;
pub mod http_backend;
mod likes;
mod realtime;
mod unread;

pub use chat_session::ChatSessionManager;
pub use embedded_backend::EmbeddedBackend;
pub use error::{BackendError, ChatError};
pub use http_backend::HttpBackend;
pub use likes::{InboundLike, LikeBroadcaster};
pub use realtime::{
    classify_message, classify_participant_change, ConversationView, MessageDisposition,
    ParticipantTransition, RealtimeBridge,
};
pub use unread::UnreadCounter;

/// Default suppression window for like broadcasts that carry no origin tag.
pub const DEFAULT_LIKE_ECHO_WINDOW: Duration = Duration::from_millis(900);
const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Table-level operations on direct chats, plus the row-change push feed.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn find_conversation(
        &self,
        group_id: GroupId,
        user_a: UserId,
        user_b: UserId,
    ) -> Result<Option<Conversation>, BackendError>;
    /// Fails with [`BackendError::Conflict`] when the pair already has a conversation.
    async fn create_conversation(
        &self,
        group_id: GroupId,
        host_id: UserId,
        member_id: UserId,
    ) -> Result<Conversation, BackendError>;
    async fn load_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<Conversation>, BackendError>;
    async fn list_conversations(&self, user_id: UserId) -> Result<Vec<Conversation>, BackendError>;
    async fn delete_conversation(&self, conversation_id: ConversationId)
        -> Result<(), BackendError>;
    async fn load_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Option<Participant>, BackendError>;
    /// Fails with [`BackendError::Conflict`] when the row already exists.
    async fn create_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Participant, BackendError>;
    async fn rejoin_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Participant, BackendError>;
    async fn leave_conversation(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Participant, BackendError>;
    async fn mark_read(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<(), BackendError>;
    async fn insert_message(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        content: &str,
    ) -> Result<DirectMessage, BackendError>;
    async fn list_messages(
        &self,
        conversation_id: ConversationId,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<DirectMessage>, BackendError>;
    /// `None` asks for every active conversation of the user.
    async fn unread_counts(
        &self,
        user_id: UserId,
        conversation_ids: Option<&[ConversationId]>,
    ) -> Result<Vec<UnreadCount>, BackendError>;
    fn subscribe_changes(&self) -> broadcast::Receiver<RealtimeEvent>;
}

#[async_trait]
pub trait LikeBackend: Send + Sync {
    async fn like_state(&self, target: LikeTarget, user_id: UserId)
        -> Result<LikeState, BackendError>;
    async fn add_like(&self, target: LikeTarget, user_id: UserId) -> Result<(), BackendError>;
    async fn remove_like(&self, target: LikeTarget, user_id: UserId) -> Result<(), BackendError>;
}

/// Fire-and-forget fan-out between sessions; nothing is persisted.
#[async_trait]
pub trait BroadcastChannel: Send + Sync {
    async fn publish(
        &self,
        topic: BroadcastTopic,
        payload: LikeBroadcast,
    ) -> Result<(), BackendError>;
    fn subscribe_broadcasts(&self) -> broadcast::Receiver<BroadcastRequest>;
}

pub struct MissingBroadcastChannel;

#[async_trait]
impl BroadcastChannel for MissingBroadcastChannel {
    async fn publish(
        &self,
        topic: BroadcastTopic,
        _payload: LikeBroadcast,
    ) -> Result<(), BackendError> {
        Err(anyhow!("broadcast channel is unavailable for topic {topic}").into())
    }

    fn subscribe_broadcasts(&self) -> broadcast::Receiver<BroadcastRequest> {
        let (_, rx) = broadcast::channel(1);
        rx
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub like_echo_window: Duration,
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            like_echo_window: DEFAULT_LIKE_ECHO_WINDOW,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Left,
    Deleted,
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    ConversationOpened {
        conversation_id: ConversationId,
        messages: usize,
    },
    MessageRendered {
        message: DirectMessage,
    },
    ConversationClosed {
        conversation_id: ConversationId,
        reason: CloseReason,
    },
    ConversationsRefreshed {
        conversations: Vec<Conversation>,
    },
    UnreadChanged {
        conversation_id: ConversationId,
        unread: u32,
    },
    LikeChanged {
        state: LikeState,
    },
    Error(String),
}

/// Who is signed in. Shared by every manager of one client.
#[derive(Clone, Default)]
pub struct Session {
    user_id: Arc<RwLock<Option<UserId>>>,
}

impl Session {
    pub async fn current_user(&self) -> Result<UserId, ChatError> {
        self.user_id.read().await.ok_or(ChatError::NotSignedIn)
    }

    pub async fn is_signed_in(&self) -> bool {
        self.user_id.read().await.is_some()
    }

    async fn set(&self, user_id: Option<UserId>) {
        *self.user_id.write().await = user_id;
    }
}

/// Composition root wiring the chat, unread and like managers to one set of
/// backends and one event stream.
pub struct MoriClient {
    session: Session,
    chat: Arc<ChatSessionManager>,
    unread: Arc<UnreadCounter>,
    likes: Arc<LikeBroadcaster>,
    chat_backend: Arc<dyn ChatBackend>,
    broadcasts: Arc<dyn BroadcastChannel>,
    events: broadcast::Sender<ClientEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MoriClient {
    pub fn new(
        chat_backend: Arc<dyn ChatBackend>,
        like_backend: Arc<dyn LikeBackend>,
        broadcasts: Arc<dyn BroadcastChannel>,
        config: ClientConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let session = Session::default();
        let unread = Arc::new(UnreadCounter::new(
            Arc::clone(&chat_backend),
            session.clone(),
            events.clone(),
        ));
        let chat = Arc::new(ChatSessionManager::new(
            Arc::clone(&chat_backend),
            session.clone(),
            Arc::clone(&unread),
            events.clone(),
        ));
        let likes = Arc::new(LikeBroadcaster::new(
            like_backend,
            Arc::clone(&broadcasts),
            session.clone(),
            config.like_echo_window,
            events.clone(),
        ));
        Arc::new(Self {
            session,
            chat,
            unread,
            likes,
            chat_backend,
            broadcasts,
            events,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn without_broadcasts(
        chat_backend: Arc<dyn ChatBackend>,
        like_backend: Arc<dyn LikeBackend>,
        config: ClientConfig,
    ) -> Arc<Self> {
        Self::new(
            chat_backend,
            like_backend,
            Arc::new(MissingBroadcastChannel),
            config,
        )
    }

    pub fn embedded(backend: Arc<EmbeddedBackend>, config: ClientConfig) -> Arc<Self> {
        Self::new(backend.clone(), backend.clone(), backend, config)
    }

    pub async fn sign_in(&self, user_id: UserId) {
        self.session.set(Some(user_id)).await;
        info!(user_id = user_id.0, "session: signed in");
    }

    pub async fn sign_out(&self) {
        self.session.set(None).await;
        self.chat.reset().await;
        self.unread.reset_all().await;
        info!("session: signed out");
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn chat(&self) -> &Arc<ChatSessionManager> {
        &self.chat
    }

    pub fn unread(&self) -> &Arc<UnreadCounter> {
        &self.unread
    }

    pub fn likes(&self) -> &Arc<LikeBroadcaster> {
        &self.likes
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Starts consuming backend pushes and like broadcasts. Calling it again
    /// restarts both consumers.
    pub async fn start_realtime(&self) {
        let bridge = Arc::new(RealtimeBridge::new(
            Arc::clone(&self.chat),
            Arc::clone(&self.unread),
            self.session.clone(),
        ));
        let bridge_task = bridge.spawn(self.chat_backend.subscribe_changes());
        let likes_task = Arc::clone(&self.likes).spawn_listener(self.broadcasts.subscribe_broadcasts());

        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
        tasks.push(bridge_task);
        tasks.push(likes_task);
        info!("realtime: consumers started");
    }

    pub async fn stop_realtime(&self) {
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
