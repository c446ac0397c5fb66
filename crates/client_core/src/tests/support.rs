use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, GroupId, LikeTarget, UserId},
    protocol::{Conversation, DirectMessage, LikeState, Participant, RealtimeEvent, UnreadCount},
};
use tokio::sync::{broadcast, oneshot, Mutex};

use crate::{
    BackendError, ChatBackend, ClientConfig, EmbeddedBackend, LikeBackend, MoriClient,
};

pub struct Fixture {
    pub backend: Arc<EmbeddedBackend>,
    pub alice: UserId,
    pub bob: UserId,
    pub carol: UserId,
    pub group: GroupId,
}

pub async fn fixture() -> Fixture {
    fixture_at("sqlite::memory:").await
}

pub async fn fixture_at(database_url: &str) -> Fixture {
    let backend = EmbeddedBackend::open(database_url).await.expect("backend");
    let storage = backend.storage();
    let alice = storage.create_user("alice").await.expect("alice");
    let bob = storage.create_user("bob").await.expect("bob");
    let carol = storage.create_user("carol").await.expect("carol");
    let group = storage.create_group("hiking", alice).await.expect("group");
    Fixture {
        backend,
        alice,
        bob,
        carol,
        group,
    }
}

impl Fixture {
    pub async fn conversation(&self) -> Conversation {
        self.backend
            .storage()
            .insert_direct_chat(self.group, self.alice, self.bob, Utc::now())
            .await
            .expect("insert")
            .expect("created")
    }

    pub async fn client(&self, user_id: UserId) -> Arc<MoriClient> {
        self.client_with(user_id, ClientConfig::default()).await
    }

    pub async fn client_with(&self, user_id: UserId, config: ClientConfig) -> Arc<MoriClient> {
        let client = MoriClient::embedded(Arc::clone(&self.backend), config);
        client.sign_in(user_id).await;
        client
    }
}

/// Polls `check` until it returns true or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Delegates to an embedded backend while recording calls and injecting
/// failures.
pub struct ScriptedBackend {
    inner: Arc<EmbeddedBackend>,
    calls: std::sync::Mutex<Vec<String>>,
    pub stale_finds: AtomicUsize,
    pub fail_inserts: AtomicBool,
    pub fail_like_writes: AtomicBool,
    pub fail_lists: AtomicBool,
    pub fail_mark_reads: AtomicBool,
    mark_read_gate: Mutex<Option<oneshot::Receiver<()>>>,
}

impl ScriptedBackend {
    pub fn new(inner: Arc<EmbeddedBackend>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            calls: std::sync::Mutex::new(Vec::new()),
            stale_finds: AtomicUsize::new(0),
            fail_inserts: AtomicBool::new(false),
            fail_like_writes: AtomicBool::new(false),
            fail_lists: AtomicBool::new(false),
            fail_mark_reads: AtomicBool::new(false),
            mark_read_gate: Mutex::new(None),
        })
    }

    pub fn client(self: &Arc<Self>) -> Arc<MoriClient> {
        MoriClient::new(
            self.clone(),
            self.clone(),
            self.inner.clone(),
            ClientConfig::default(),
        )
    }

    /// Holds the next `mark_read` until the returned sender fires.
    pub async fn gate_mark_read(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.mark_read_gate.lock().await = Some(rx);
        tx
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls").clone()
    }

    pub fn writes(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| {
                !call.starts_with("find")
                    && !call.starts_with("load")
                    && !call.starts_with("list")
                    && !call.starts_with("unread")
                    && !call.starts_with("like_state")
            })
            .collect()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().expect("calls").clear();
    }

    fn record(&self, call: String) {
        self.calls.lock().expect("calls").push(call);
    }
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    async fn find_conversation(
        &self,
        group_id: GroupId,
        user_a: UserId,
        user_b: UserId,
    ) -> Result<Option<Conversation>, BackendError> {
        self.record(format!("find_conversation:{group_id}"));
        let stale = self
            .stale_finds
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if stale {
            return Ok(None);
        }
        self.inner.find_conversation(group_id, user_a, user_b).await
    }

    async fn create_conversation(
        &self,
        group_id: GroupId,
        host_id: UserId,
        member_id: UserId,
    ) -> Result<Conversation, BackendError> {
        self.record(format!("create_conversation:{group_id}"));
        self.inner
            .create_conversation(group_id, host_id, member_id)
            .await
    }

    async fn load_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<Conversation>, BackendError> {
        self.record(format!("load_conversation:{conversation_id}"));
        self.inner.load_conversation(conversation_id).await
    }

    async fn list_conversations(&self, user_id: UserId) -> Result<Vec<Conversation>, BackendError> {
        self.record(format!("list_conversations:{user_id}"));
        self.inner.list_conversations(user_id).await
    }

    async fn delete_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<(), BackendError> {
        self.record(format!("delete_conversation:{conversation_id}"));
        self.inner.delete_conversation(conversation_id).await
    }

    async fn load_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Option<Participant>, BackendError> {
        self.record(format!("load_participant:{conversation_id}:{user_id}"));
        self.inner.load_participant(conversation_id, user_id).await
    }

    async fn create_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Participant, BackendError> {
        self.record(format!("create_participant:{conversation_id}:{user_id}"));
        self.inner.create_participant(conversation_id, user_id).await
    }

    async fn rejoin_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Participant, BackendError> {
        self.record(format!("rejoin_participant:{conversation_id}:{user_id}"));
        self.inner.rejoin_participant(conversation_id, user_id).await
    }

    async fn leave_conversation(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Participant, BackendError> {
        self.record(format!("leave_conversation:{conversation_id}:{user_id}"));
        self.inner.leave_conversation(conversation_id, user_id).await
    }

    async fn mark_read(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<(), BackendError> {
        self.record(format!("mark_read:{conversation_id}:{user_id}"));
        let gate = self.mark_read_gate.lock().await.take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        if self.fail_mark_reads.load(Ordering::SeqCst) {
            return Err(anyhow!("read marker refused").into());
        }
        self.inner.mark_read(conversation_id, user_id).await
    }

    async fn insert_message(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        content: &str,
    ) -> Result<DirectMessage, BackendError> {
        self.record(format!("insert_message:{conversation_id}:{sender_id}"));
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(anyhow!("insert refused").into());
        }
        self.inner
            .insert_message(conversation_id, sender_id, content)
            .await
    }

    async fn list_messages(
        &self,
        conversation_id: ConversationId,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<DirectMessage>, BackendError> {
        self.record(format!("list_messages:{conversation_id}"));
        if self.fail_lists.load(Ordering::SeqCst) {
            return Err(anyhow!("history unavailable").into());
        }
        self.inner.list_messages(conversation_id, since).await
    }

    async fn unread_counts(
        &self,
        user_id: UserId,
        conversation_ids: Option<&[ConversationId]>,
    ) -> Result<Vec<UnreadCount>, BackendError> {
        self.record(format!("unread_counts:{user_id}"));
        self.inner.unread_counts(user_id, conversation_ids).await
    }

    fn subscribe_changes(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.inner.subscribe_changes()
    }
}

#[async_trait]
impl LikeBackend for ScriptedBackend {
    async fn like_state(
        &self,
        target: LikeTarget,
        user_id: UserId,
    ) -> Result<LikeState, BackendError> {
        self.inner.like_state(target, user_id).await
    }

    async fn add_like(&self, target: LikeTarget, user_id: UserId) -> Result<(), BackendError> {
        self.record(format!("add_like:{target}:{user_id}"));
        if self.fail_like_writes.load(Ordering::SeqCst) {
            return Err(anyhow!("like write refused").into());
        }
        self.inner.add_like(target, user_id).await
    }

    async fn remove_like(&self, target: LikeTarget, user_id: UserId) -> Result<(), BackendError> {
        self.record(format!("remove_like:{target}:{user_id}"));
        if self.fail_like_writes.load(Ordering::SeqCst) {
            return Err(anyhow!("like write refused").into());
        }
        self.inner.remove_like(target, user_id).await
    }
}
