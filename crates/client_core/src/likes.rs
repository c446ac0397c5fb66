use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use futures::StreamExt;
use shared::{
    domain::{BroadcastTopic, GroupId, LikeTarget, UserId},
    protocol::{BroadcastRequest, LikeAction, LikeBroadcast, LikeState},
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{BroadcastChannel, ChatError, ClientEvent, LikeBackend, Session};

const SEEN_CAPACITY: usize = 4096;
/// How long an untagged action is remembered so its copy on a second topic
/// is not counted again.
const UNTAGGED_REPEAT_WINDOW: Duration = Duration::from_secs(5);

/// Result of applying one inbound like broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundLike {
    Applied(LikeState),
    OwnEcho,
    Duplicate,
    WithinEchoWindow,
    Untracked,
}

struct LikeEntry {
    state: LikeState,
    fresh_at: Option<Instant>,
}

#[derive(Default)]
struct LikeLedger {
    entries: HashMap<LikeTarget, LikeEntry>,
    watched: HashSet<BroadcastTopic>,
    seen: HashSet<(Uuid, u64)>,
    seen_order: VecDeque<(Uuid, u64)>,
    recent_untagged: HashMap<(LikeTarget, UserId, LikeAction), Instant>,
}

impl LikeLedger {
    /// Returns `false` when the pair was already recorded.
    fn remember(&mut self, origin: Uuid, seq: u64) -> bool {
        if !self.seen.insert((origin, seq)) {
            return false;
        }
        self.seen_order.push_back((origin, seq));
        while self.seen_order.len() > SEEN_CAPACITY {
            if let Some(evicted) = self.seen_order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }

    /// Returns `false` when the same user made the same change on this
    /// target moments ago.
    fn remember_untagged(&mut self, payload: &LikeBroadcast) -> bool {
        self.recent_untagged
            .retain(|_, at| at.elapsed() < UNTAGGED_REPEAT_WINDOW);
        let key = (payload.target, payload.user_id, payload.action);
        if self.recent_untagged.contains_key(&key) {
            return false;
        }
        let opposite = match payload.action {
            LikeAction::Added => LikeAction::Removed,
            LikeAction::Removed => LikeAction::Added,
        };
        self.recent_untagged
            .remove(&(payload.target, payload.user_id, opposite));
        self.recent_untagged.insert(key, Instant::now());
        true
    }
}

/// Optimistic like toggles with cross-session fan-out.
pub struct LikeBroadcaster {
    backend: Arc<dyn LikeBackend>,
    broadcasts: Arc<dyn BroadcastChannel>,
    session: Session,
    echo_window: Duration,
    origin: Uuid,
    seq: AtomicU64,
    ledger: Mutex<LikeLedger>,
    events: broadcast::Sender<ClientEvent>,
}

impl LikeBroadcaster {
    pub(crate) fn new(
        backend: Arc<dyn LikeBackend>,
        broadcasts: Arc<dyn BroadcastChannel>,
        session: Session,
        echo_window: Duration,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        Self {
            backend,
            broadcasts,
            session,
            echo_window,
            origin: Uuid::new_v4(),
            seq: AtomicU64::new(0),
            ledger: Mutex::new(LikeLedger::default()),
            events,
        }
    }

    /// Tag attached to every broadcast sent by this client.
    pub fn origin(&self) -> Uuid {
        self.origin
    }

    /// Fetches the authoritative state and starts tracking the target.
    pub async fn load(&self, target: LikeTarget) -> Result<LikeState, ChatError> {
        let user_id = self.session.current_user().await?;
        let state = self.backend.like_state(target, user_id).await?;
        {
            let mut ledger = self.ledger.lock().await;
            ledger.entries.insert(
                target,
                LikeEntry {
                    state,
                    fresh_at: None,
                },
            );
            ledger.watched.insert(BroadcastTopic::Target { target });
        }
        let _ = self.events.send(ClientEvent::LikeChanged { state });
        Ok(state)
    }

    pub async fn view(&self, target: LikeTarget) -> Option<LikeState> {
        self.ledger
            .lock()
            .await
            .entries
            .get(&target)
            .map(|entry| entry.state)
    }

    /// Accepts inbound broadcasts on these topics as well.
    pub async fn listen(&self, topics: impl IntoIterator<Item = BroadcastTopic>) {
        let mut ledger = self.ledger.lock().await;
        ledger.watched.extend(topics);
    }

    /// Flips the caller's like on `target` before the backend confirms it.
    /// A failed write restores the previous state and is reported.
    pub async fn toggle(
        &self,
        target: LikeTarget,
        group_id: GroupId,
    ) -> Result<LikeState, ChatError> {
        let user_id = self.session.current_user().await?;
        if self.view(target).await.is_none() {
            self.load(target).await?;
        }

        let optimistic = {
            let mut ledger = self.ledger.lock().await;
            let entry = ledger.entries.entry(target).or_insert(LikeEntry {
                state: LikeState {
                    target,
                    liked: false,
                    count: 0,
                },
                fresh_at: None,
            });
            entry.state.liked = !entry.state.liked;
            entry.state.count = if entry.state.liked {
                entry.state.count.saturating_add(1)
            } else {
                entry.state.count.saturating_sub(1)
            };
            entry.fresh_at = Some(Instant::now());
            entry.state
        };
        let _ = self.events.send(ClientEvent::LikeChanged { state: optimistic });

        let action = if optimistic.liked {
            LikeAction::Added
        } else {
            LikeAction::Removed
        };
        let written = match action {
            LikeAction::Added => self.backend.add_like(target, user_id).await,
            LikeAction::Removed => self.backend.remove_like(target, user_id).await,
        };

        if let Err(err) = written {
            let restored = self.roll_back(target, action).await;
            error!(%target, user_id = user_id.0, "likes: toggle failed: {err}");
            let _ = self
                .events
                .send(ClientEvent::Error(format!("failed to update like on {target}: {err}")));
            if let Some(state) = restored {
                let _ = self.events.send(ClientEvent::LikeChanged { state });
            }
            return Err(err.into());
        }

        let payload = LikeBroadcast {
            target,
            group_id,
            user_id,
            action,
            origin: Some(self.origin),
            seq: Some(self.seq.fetch_add(1, Ordering::Relaxed)),
        };
        for topic in [
            BroadcastTopic::Target { target },
            BroadcastTopic::Group { group_id },
        ] {
            if let Err(err) = self.broadcasts.publish(topic, payload).await {
                warn!(%topic, "likes: broadcast failed: {err}");
            }
        }
        info!(%target, liked = optimistic.liked, count = optimistic.count, "likes: toggled");
        Ok(optimistic)
    }

    async fn roll_back(&self, target: LikeTarget, action: LikeAction) -> Option<LikeState> {
        let mut ledger = self.ledger.lock().await;
        let entry = ledger.entries.get_mut(&target)?;
        match action {
            LikeAction::Added => {
                entry.state.liked = false;
                entry.state.count = entry.state.count.saturating_sub(1);
            }
            LikeAction::Removed => {
                entry.state.liked = true;
                entry.state.count = entry.state.count.saturating_add(1);
            }
        }
        Some(entry.state)
    }

    /// Applies a like made elsewhere. Echoes of this client's own toggles are
    /// dropped by origin, repeats of one toggle by sequence number, and
    /// untagged events by the freshness window. A target first seen on a
    /// watched topic is loaded from the backend.
    pub async fn apply_broadcast(&self, request: BroadcastRequest) -> InboundLike {
        let me = self.session.current_user().await.ok();
        let payload = request.payload;

        let mut ledger = self.ledger.lock().await;
        if !ledger.watched.contains(&request.topic) {
            return InboundLike::Untracked;
        }
        match (payload.origin, payload.seq) {
            (Some(origin), _) if origin == self.origin => return InboundLike::OwnEcho,
            (Some(origin), Some(seq)) => {
                if !ledger.remember(origin, seq) {
                    return InboundLike::Duplicate;
                }
            }
            _ => {
                let fresh = ledger
                    .entries
                    .get(&payload.target)
                    .and_then(|entry| entry.fresh_at)
                    .is_some_and(|at| at.elapsed() < self.echo_window);
                if fresh {
                    return InboundLike::WithinEchoWindow;
                }
                if !ledger.remember_untagged(&payload) {
                    return InboundLike::Duplicate;
                }
            }
        }

        let Some(entry) = ledger.entries.get_mut(&payload.target) else {
            drop(ledger);
            let target = payload.target;
            // the loaded state already includes this change
            return match self.load(target).await {
                Ok(state) => InboundLike::Applied(state),
                Err(err) => {
                    warn!(%target, "likes: failed to load broadcast target: {err}");
                    InboundLike::Untracked
                }
            };
        };
        let liked = payload.action == LikeAction::Added;
        let own_user = me == Some(payload.user_id);
        if own_user && entry.state.liked == liked {
            // same user on another device, already reflected here
            return InboundLike::Applied(entry.state);
        }
        if own_user {
            entry.state.liked = liked;
        }
        entry.state.count = if liked {
            entry.state.count.saturating_add(1)
        } else {
            entry.state.count.saturating_sub(1)
        };
        let state = entry.state;
        drop(ledger);

        let _ = self.events.send(ClientEvent::LikeChanged { state });
        InboundLike::Applied(state)
    }

    /// Consumes inbound broadcasts until the channel closes.
    pub fn spawn_listener(
        self: Arc<Self>,
        broadcasts: broadcast::Receiver<BroadcastRequest>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut stream = BroadcastStream::new(broadcasts);
            while let Some(item) = stream.next().await {
                match item {
                    Ok(request) => {
                        let topic = request.topic;
                        let outcome = self.apply_broadcast(request).await;
                        debug!(%topic, ?outcome, "likes: inbound broadcast");
                    }
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        warn!(skipped, "likes: broadcast stream lagged");
                        self.reload_tracked().await;
                    }
                }
            }
            info!("likes: broadcast stream closed");
        })
    }

    async fn reload_tracked(&self) {
        let targets: Vec<LikeTarget> = self.ledger.lock().await.entries.keys().copied().collect();
        for target in targets {
            if let Err(err) = self.load(target).await {
                warn!(%target, "likes: reload failed: {err}");
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/likes_tests.rs"]
mod tests;
