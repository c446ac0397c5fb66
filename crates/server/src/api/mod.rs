use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, GroupId, LikeKind, LikeTarget, PostId, ReviewId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        Conversation, CreateConversationRequest, CreateGroupRequest, CreatePostRequest,
        CreateReviewRequest, DirectMessage, LikeState, Participant, RealtimeEvent,
        SendMessageRequest, UnreadCount,
    },
};
use storage::Storage;

const MAX_MESSAGE_CHARS: usize = 4000;
const MAX_USERNAME_CHARS: usize = 64;

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
}

/// A successful write together with the row changes it caused.
#[derive(Debug)]
pub struct Applied<T> {
    pub value: T,
    pub changes: Vec<RealtimeEvent>,
}

impl<T> Applied<T> {
    fn new(value: T, changes: Vec<RealtimeEvent>) -> Self {
        Self { value, changes }
    }
}

pub async fn create_user(ctx: &ApiContext, username: &str) -> Result<UserId, ApiError> {
    let username = username.trim();
    if username.is_empty() || username.chars().count() > MAX_USERNAME_CHARS {
        return Err(ApiError::new(
            ErrorCode::Validation,
            format!("username must be 1-{MAX_USERNAME_CHARS} characters"),
        ));
    }
    ctx.storage.create_user(username).await.map_err(internal)
}

pub async fn create_group(ctx: &ApiContext, req: &CreateGroupRequest) -> Result<GroupId, ApiError> {
    let name = req.name.trim();
    if name.is_empty() {
        return Err(ApiError::new(ErrorCode::Validation, "group name is required"));
    }
    ensure_user_exists(ctx, req.owner_id).await?;
    ctx.storage
        .create_group(name, req.owner_id)
        .await
        .map_err(internal)
}

pub async fn create_post(
    ctx: &ApiContext,
    group_id: GroupId,
    req: &CreatePostRequest,
) -> Result<PostId, ApiError> {
    let content = req.content.trim();
    if content.is_empty() {
        return Err(ApiError::new(ErrorCode::Validation, "post content is required"));
    }
    ensure_user_exists(ctx, req.author_id).await?;
    ctx.storage
        .create_group_post(group_id, req.author_id, content)
        .await
        .map_err(|e| foreign_key_or_internal(e, "group not found"))
}

pub async fn create_review(
    ctx: &ApiContext,
    group_id: GroupId,
    req: &CreateReviewRequest,
) -> Result<ReviewId, ApiError> {
    if !(1..=5).contains(&req.rating) {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "rating must be between 1 and 5",
        ));
    }
    ensure_user_exists(ctx, req.author_id).await?;
    ctx.storage
        .create_review(group_id, req.author_id, req.rating, req.content.trim())
        .await
        .map_err(|e| foreign_key_or_internal(e, "group not found"))
}

pub async fn find_conversation(
    ctx: &ApiContext,
    group_id: GroupId,
    user_a: UserId,
    user_b: UserId,
) -> Result<Conversation, ApiError> {
    ctx.storage
        .find_direct_chat(group_id, user_a, user_b)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "conversation not found"))
}

pub async fn create_conversation(
    ctx: &ApiContext,
    req: &CreateConversationRequest,
) -> Result<Applied<Conversation>, ApiError> {
    if req.host_id == req.member_id {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "a conversation needs two distinct users",
        ));
    }
    let conversation = ctx
        .storage
        .insert_direct_chat(req.group_id, req.host_id, req.member_id, Utc::now())
        .await
        .map_err(|e| foreign_key_or_internal(e, "group or user not found"))?
        .ok_or_else(|| {
            ApiError::new(
                ErrorCode::Conflict,
                "this pair already has a conversation in the group",
            )
        })?;

    let mut changes = Vec::new();
    for user_id in [req.host_id, req.member_id] {
        if let Some(participant) = ctx
            .storage
            .load_participant(conversation.id, user_id)
            .await
            .map_err(internal)?
        {
            changes.push(RealtimeEvent::ParticipantChanged {
                old: None,
                new: participant,
            });
        }
    }
    Ok(Applied::new(conversation, changes))
}

pub async fn load_conversation(
    ctx: &ApiContext,
    conversation_id: ConversationId,
) -> Result<Conversation, ApiError> {
    ctx.storage
        .load_direct_chat(conversation_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "conversation not found"))
}

pub async fn list_conversations(
    ctx: &ApiContext,
    user_id: UserId,
) -> Result<Vec<Conversation>, ApiError> {
    ctx.storage
        .list_direct_chats_for_user(user_id)
        .await
        .map_err(internal)
}

pub async fn delete_conversation(
    ctx: &ApiContext,
    conversation_id: ConversationId,
) -> Result<Applied<()>, ApiError> {
    if !ctx
        .storage
        .delete_direct_chat(conversation_id)
        .await
        .map_err(internal)?
    {
        return Err(ApiError::new(ErrorCode::NotFound, "conversation not found"));
    }
    Ok(Applied::new(
        (),
        vec![RealtimeEvent::ConversationDeleted { conversation_id }],
    ))
}

pub async fn load_participant(
    ctx: &ApiContext,
    conversation_id: ConversationId,
    user_id: UserId,
) -> Result<Participant, ApiError> {
    ctx.storage
        .load_participant(conversation_id, user_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "participant not found"))
}

pub async fn create_participant(
    ctx: &ApiContext,
    conversation_id: ConversationId,
    user_id: UserId,
) -> Result<Applied<Participant>, ApiError> {
    let conversation = load_conversation(ctx, conversation_id).await?;
    if !conversation.involves(user_id) {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "only the host and the member can join this conversation",
        ));
    }
    let participant = ctx
        .storage
        .insert_participant(conversation_id, user_id, Utc::now())
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::Conflict, "participant already exists"))?;
    Ok(Applied::new(
        participant.clone(),
        vec![RealtimeEvent::ParticipantChanged {
            old: None,
            new: participant,
        }],
    ))
}

pub async fn rejoin_participant(
    ctx: &ApiContext,
    conversation_id: ConversationId,
    user_id: UserId,
) -> Result<Applied<Participant>, ApiError> {
    let old = load_participant(ctx, conversation_id, user_id).await?;
    let new = ctx
        .storage
        .reactivate_participant(conversation_id, user_id, Utc::now())
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "participant not found"))?;
    Ok(participant_change(old, new))
}

pub async fn leave_conversation(
    ctx: &ApiContext,
    conversation_id: ConversationId,
    user_id: UserId,
) -> Result<Applied<Participant>, ApiError> {
    let old = load_participant(ctx, conversation_id, user_id).await?;
    let new = ctx
        .storage
        .mark_participant_left(conversation_id, user_id, Utc::now())
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "participant not found"))?;
    Ok(participant_change(old, new))
}

pub async fn mark_read(
    ctx: &ApiContext,
    conversation_id: ConversationId,
    user_id: UserId,
) -> Result<Applied<Participant>, ApiError> {
    let old = load_participant(ctx, conversation_id, user_id).await?;
    let new = ctx
        .storage
        .mark_read(conversation_id, user_id, Utc::now())
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "participant not found"))?;
    Ok(participant_change(old, new))
}

fn participant_change(old: Participant, new: Participant) -> Applied<Participant> {
    Applied::new(
        new.clone(),
        vec![RealtimeEvent::ParticipantChanged {
            old: Some(old),
            new,
        }],
    )
}

pub async fn send_message(
    ctx: &ApiContext,
    conversation_id: ConversationId,
    req: &SendMessageRequest,
) -> Result<Applied<DirectMessage>, ApiError> {
    let content = req.content.trim();
    if content.is_empty() {
        return Err(ApiError::new(ErrorCode::Validation, "message must not be empty"));
    }
    if content.chars().count() > MAX_MESSAGE_CHARS {
        return Err(ApiError::new(
            ErrorCode::Validation,
            format!("message exceeds {MAX_MESSAGE_CHARS} characters"),
        ));
    }
    let sender = load_participant(ctx, conversation_id, req.sender_id)
        .await
        .map_err(|_| ApiError::new(ErrorCode::Forbidden, "sender is not a participant"))?;
    if !sender.is_active() {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "sender has left this conversation",
        ));
    }

    let message = ctx
        .storage
        .insert_message(conversation_id, req.sender_id, content, Utc::now())
        .await
        .map_err(internal)?;
    Ok(Applied::new(
        message.clone(),
        vec![RealtimeEvent::MessageInserted { message }],
    ))
}

pub async fn list_messages(
    ctx: &ApiContext,
    conversation_id: ConversationId,
    since_micros: Option<i64>,
) -> Result<Vec<DirectMessage>, ApiError> {
    let since = since_micros
        .map(|micros| {
            DateTime::<Utc>::from_timestamp_micros(micros)
                .ok_or_else(|| ApiError::new(ErrorCode::Validation, "since_micros out of range"))
        })
        .transpose()?;
    ctx.storage
        .list_messages(conversation_id, since)
        .await
        .map_err(internal)
}

pub async fn unread_counts(
    ctx: &ApiContext,
    user_id: UserId,
    conversation_ids: Option<&str>,
) -> Result<Vec<UnreadCount>, ApiError> {
    let subset = parse_conversation_ids(conversation_ids)?;
    let mut counts = ctx.storage.unread_counts(user_id).await.map_err(internal)?;
    if let Some(subset) = subset {
        counts.retain(|row| subset.contains(&row.conversation_id));
    }
    Ok(counts)
}

pub fn parse_conversation_ids(raw: Option<&str>) -> Result<Option<Vec<ConversationId>>, ApiError> {
    let Some(raw) = raw.map(str::trim).filter(|raw| !raw.is_empty()) else {
        return Ok(None);
    };
    raw.split(',')
        .map(|part| {
            part.trim()
                .parse::<i64>()
                .map(ConversationId)
                .map_err(|_| {
                    ApiError::new(
                        ErrorCode::Validation,
                        format!("invalid conversation id '{part}'"),
                    )
                })
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

pub fn parse_like_target(kind: &str, target_id: i64) -> Result<LikeTarget, ApiError> {
    let kind = LikeKind::parse(kind).ok_or_else(|| {
        ApiError::new(
            ErrorCode::Validation,
            format!("unknown like target kind '{kind}'"),
        )
    })?;
    Ok(LikeTarget::new(kind, target_id))
}

pub async fn like_state(
    ctx: &ApiContext,
    target: LikeTarget,
    user_id: UserId,
) -> Result<LikeState, ApiError> {
    ensure_like_target_exists(ctx, target).await?;
    ctx.storage
        .like_state(target, user_id)
        .await
        .map_err(internal)
}

pub async fn add_like(ctx: &ApiContext, target: LikeTarget, user_id: UserId) -> Result<bool, ApiError> {
    ensure_like_target_exists(ctx, target).await?;
    ensure_user_exists(ctx, user_id).await?;
    ctx.storage
        .insert_like(target, user_id)
        .await
        .map_err(internal)
}

pub async fn remove_like(
    ctx: &ApiContext,
    target: LikeTarget,
    user_id: UserId,
) -> Result<bool, ApiError> {
    ensure_like_target_exists(ctx, target).await?;
    ctx.storage
        .delete_like(target, user_id)
        .await
        .map_err(internal)
}

async fn ensure_like_target_exists(ctx: &ApiContext, target: LikeTarget) -> Result<GroupId, ApiError> {
    ctx.storage
        .group_for_like_target(target)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, format!("{target} not found")))
}

async fn ensure_user_exists(ctx: &ApiContext, user_id: UserId) -> Result<(), ApiError> {
    ctx.storage
        .username_for_user(user_id)
        .await
        .map_err(internal)?
        .map(|_| ())
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, format!("user {user_id} not found")))
}

fn foreign_key_or_internal(err: anyhow::Error, not_found: &str) -> ApiError {
    let text = format!("{err:#}");
    if text.contains("FOREIGN KEY") {
        ApiError::new(ErrorCode::NotFound, not_found)
    } else {
        ApiError::new(ErrorCode::Internal, text)
    }
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, err.to_string())
}

#[cfg(test)]
#[path = "tests/mod_tests.rs"]
mod tests;
