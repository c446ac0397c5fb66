use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{
    BroadcastTopic, ConversationId, GroupId, LikeTarget, MessageId, PostId, ReviewId, UserId,
};

/// A 1:1 channel between a host and a member, scoped to a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub group_id: GroupId,
    pub host_id: UserId,
    pub member_id: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn involves(&self, user_id: UserId) -> bool {
        self.host_id == user_id || self.member_id == user_id
    }

    /// The other side of the conversation, or `None` when `user_id` is not in it.
    pub fn counterpart(&self, user_id: UserId) -> Option<UserId> {
        if self.host_id == user_id {
            Some(self.member_id)
        } else if self.member_id == user_id {
            Some(self.host_id)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub joined_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_read_at: Option<DateTime<Utc>>,
}

impl Participant {
    pub fn is_active(&self) -> bool {
        self.left_at.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectMessage {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadCount {
    pub conversation_id: ConversationId,
    pub unread: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LikeState {
    pub target: LikeTarget,
    pub liked: bool,
    pub count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LikeAction {
    Added,
    Removed,
}

/// Payload fanned out to other viewers after a like toggle is stored.
///
/// `origin` and `seq` identify the sending client so it can drop its own
/// echo. Older senders omit both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LikeBroadcast {
    pub target: LikeTarget,
    pub group_id: GroupId,
    pub user_id: UserId,
    pub action: LikeAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

/// Row-level change notifications pushed by the backend of record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum RealtimeEvent {
    MessageInserted {
        message: DirectMessage,
    },
    ParticipantChanged {
        #[serde(default)]
        old: Option<Participant>,
        new: Participant,
    },
    ConversationDeleted {
        conversation_id: ConversationId,
    },
    /// The sender dropped `skipped` changes; cached views must be reloaded.
    Resync {
        skipped: u64,
    },
}

/// Everything the push socket carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "channel", content = "event", rename_all = "snake_case")]
pub enum PushEnvelope {
    Change(RealtimeEvent),
    Broadcast(BroadcastRequest),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastRequest {
    pub topic: BroadcastTopic,
    pub payload: LikeBroadcast,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateUserRequest {
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateUserResponse {
    pub user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateGroupRequest {
    pub name: String,
    pub owner_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateGroupResponse {
    pub group_id: GroupId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePostRequest {
    pub author_id: UserId,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePostResponse {
    pub post_id: PostId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateReviewRequest {
    pub author_id: UserId,
    pub rating: u8,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateReviewResponse {
    pub review_id: ReviewId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationLookupQuery {
    pub group_id: i64,
    pub user_a: i64,
    pub user_b: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateConversationRequest {
    pub group_id: GroupId,
    pub host_id: UserId,
    pub member_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub sender_id: UserId,
    pub content: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListMessagesQuery {
    /// Inclusive lower bound on `created_at`, in microseconds since the epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since_micros: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnreadQuery {
    /// Comma separated conversation ids; absent means every conversation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_ids: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserQuery {
    pub user_id: i64,
}
