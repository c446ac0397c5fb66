use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::{
    domain::{ConversationId, GroupId, LikeTarget, MessageId, PostId, ReviewId, UserId},
    protocol::{Conversation, DirectMessage, LikeState, Participant, UnreadCount},
};

const CONVERSATION_COLUMNS: &str = "id, group_id, host_id, member_id, created_at, updated_at";
const PARTICIPANT_COLUMNS: &str = "conversation_id, user_id, joined_at, left_at, last_read_at";
const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, content, created_at";

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn create_user(&self, username: &str) -> Result<UserId> {
        let rec = sqlx::query(
            "INSERT INTO users (username, created_at) VALUES (?, ?)
             ON CONFLICT(username) DO UPDATE SET username=excluded.username
             RETURNING id",
        )
        .bind(username)
        .bind(to_micros(Utc::now()))
        .fetch_one(&self.pool)
        .await?;
        Ok(UserId(rec.get::<i64, _>(0)))
    }

    pub async fn username_for_user(&self, user_id: UserId) -> Result<Option<String>> {
        let row = sqlx::query("SELECT username FROM users WHERE id = ?")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    pub async fn create_group(&self, name: &str, owner_user_id: UserId) -> Result<GroupId> {
        let rec = sqlx::query(
            "INSERT INTO community_groups (name, owner_user_id, created_at) VALUES (?, ?, ?) RETURNING id",
        )
        .bind(name)
        .bind(owner_user_id.0)
        .bind(to_micros(Utc::now()))
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("failed to create group '{name}'"))?;
        Ok(GroupId(rec.get::<i64, _>(0)))
    }

    pub async fn create_group_post(
        &self,
        group_id: GroupId,
        author_id: UserId,
        content: &str,
    ) -> Result<PostId> {
        let rec = sqlx::query(
            "INSERT INTO group_posts (group_id, author_user_id, content, created_at)
             VALUES (?, ?, ?, ?) RETURNING id",
        )
        .bind(group_id.0)
        .bind(author_id.0)
        .bind(content)
        .bind(to_micros(Utc::now()))
        .fetch_one(&self.pool)
        .await?;
        Ok(PostId(rec.get::<i64, _>(0)))
    }

    pub async fn create_review(
        &self,
        group_id: GroupId,
        author_id: UserId,
        rating: u8,
        content: &str,
    ) -> Result<ReviewId> {
        let rec = sqlx::query(
            "INSERT INTO reviews (group_id, author_user_id, rating, content, created_at)
             VALUES (?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(group_id.0)
        .bind(author_id.0)
        .bind(i64::from(rating))
        .bind(content)
        .bind(to_micros(Utc::now()))
        .fetch_one(&self.pool)
        .await?;
        Ok(ReviewId(rec.get::<i64, _>(0)))
    }

    /// The group a likeable post or review belongs to.
    pub async fn group_for_like_target(&self, target: LikeTarget) -> Result<Option<GroupId>> {
        let sql = match target {
            LikeTarget::GroupPost(_) => "SELECT group_id FROM group_posts WHERE id = ?",
            LikeTarget::Review(_) => "SELECT group_id FROM reviews WHERE id = ?",
        };
        let row = sqlx::query(sql)
            .bind(target.raw_id())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| GroupId(r.get::<i64, _>(0))))
    }

    pub async fn find_direct_chat(
        &self,
        group_id: GroupId,
        user_a: UserId,
        user_b: UserId,
    ) -> Result<Option<Conversation>> {
        let (low, high) = ordered_pair(user_a, user_b);
        let row = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM direct_chats
             WHERE group_id = ? AND user_low = ? AND user_high = ?"
        ))
        .bind(group_id.0)
        .bind(low.0)
        .bind(high.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(conversation_from_row).transpose()
    }

    /// Creates the conversation and an active participant row for both sides.
    ///
    /// Returns `None` when the pair already has a conversation in this group.
    pub async fn insert_direct_chat(
        &self,
        group_id: GroupId,
        host_id: UserId,
        member_id: UserId,
        at: DateTime<Utc>,
    ) -> Result<Option<Conversation>> {
        if host_id == member_id {
            return Err(anyhow!(
                "direct chat needs two distinct users, got {} twice",
                host_id.0
            ));
        }
        let (low, high) = ordered_pair(host_id, member_id);
        let at = to_micros(at);

        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&format!(
            "INSERT INTO direct_chats (group_id, host_id, member_id, user_low, user_high, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
             ON CONFLICT(group_id, user_low, user_high) DO NOTHING
             RETURNING {CONVERSATION_COLUMNS}"
        ))
        .bind(group_id.0)
        .bind(host_id.0)
        .bind(member_id.0)
        .bind(low.0)
        .bind(high.0)
        .bind(at)
        .fetch_optional(&mut *tx)
        .await
        .context("failed to insert direct chat")?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };
        let conversation = conversation_from_row(&row)?;

        for user_id in [host_id, member_id] {
            sqlx::query(
                "INSERT INTO direct_participants (conversation_id, user_id, joined_at)
                 VALUES (?, ?, ?)
                 ON CONFLICT(conversation_id, user_id) DO NOTHING",
            )
            .bind(conversation.id.0)
            .bind(user_id.0)
            .bind(at)
            .execute(&mut *tx)
            .await
            .context("failed to seed direct chat participants")?;
        }
        tx.commit().await?;

        Ok(Some(conversation))
    }

    pub async fn load_direct_chat(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<Conversation>> {
        let row = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM direct_chats WHERE id = ?"
        ))
        .bind(conversation_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(conversation_from_row).transpose()
    }

    /// Conversations the user is an active participant of, most recently updated first.
    pub async fn list_direct_chats_for_user(&self, user_id: UserId) -> Result<Vec<Conversation>> {
        let rows = sqlx::query(
            "SELECT c.id, c.group_id, c.host_id, c.member_id, c.created_at, c.updated_at
             FROM direct_chats c
             INNER JOIN direct_participants p ON p.conversation_id = c.id
             WHERE p.user_id = ? AND p.left_at IS NULL
             ORDER BY c.updated_at DESC, c.id DESC",
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(conversation_from_row).collect()
    }

    /// Deletes the conversation with its participants and messages.
    pub async fn delete_direct_chat(&self, conversation_id: ConversationId) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM direct_messages WHERE conversation_id = ?")
            .bind(conversation_id.0)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM direct_participants WHERE conversation_id = ?")
            .bind(conversation_id.0)
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM direct_chats WHERE id = ?")
            .bind(conversation_id.0)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(deleted > 0)
    }

    pub async fn load_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Option<Participant>> {
        let row = sqlx::query(&format!(
            "SELECT {PARTICIPANT_COLUMNS} FROM direct_participants
             WHERE conversation_id = ? AND user_id = ?"
        ))
        .bind(conversation_id.0)
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(participant_from_row).transpose()
    }

    /// Inserts an active participant row. Returns `None` if one already exists.
    pub async fn insert_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        joined_at: DateTime<Utc>,
    ) -> Result<Option<Participant>> {
        let row = sqlx::query(&format!(
            "INSERT INTO direct_participants (conversation_id, user_id, joined_at)
             VALUES (?, ?, ?)
             ON CONFLICT(conversation_id, user_id) DO NOTHING
             RETURNING {PARTICIPANT_COLUMNS}"
        ))
        .bind(conversation_id.0)
        .bind(user_id.0)
        .bind(to_micros(joined_at))
        .fetch_optional(&self.pool)
        .await
        .with_context(|| {
            format!(
                "failed to insert participant {} into direct chat {}",
                user_id.0, conversation_id.0
            )
        })?;
        row.as_ref().map(participant_from_row).transpose()
    }

    /// Clears `left_at` and moves `joined_at` forward.
    ///
    /// The new `joined_at` is strictly greater than the previous one even when
    /// the clock has not advanced, so the rejoin cutoff always moves.
    pub async fn reactivate_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        at: DateTime<Utc>,
    ) -> Result<Option<Participant>> {
        let row = sqlx::query(&format!(
            "UPDATE direct_participants
             SET left_at = NULL, joined_at = MAX(?1, joined_at + 1)
             WHERE conversation_id = ?2 AND user_id = ?3
             RETURNING {PARTICIPANT_COLUMNS}"
        ))
        .bind(to_micros(at))
        .bind(conversation_id.0)
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(participant_from_row).transpose()
    }

    /// Sets `left_at` unless the participant already left.
    pub async fn mark_participant_left(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        at: DateTime<Utc>,
    ) -> Result<Option<Participant>> {
        let row = sqlx::query(&format!(
            "UPDATE direct_participants
             SET left_at = COALESCE(left_at, ?1)
             WHERE conversation_id = ?2 AND user_id = ?3
             RETURNING {PARTICIPANT_COLUMNS}"
        ))
        .bind(to_micros(at))
        .bind(conversation_id.0)
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(participant_from_row).transpose()
    }

    pub async fn mark_read(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        at: DateTime<Utc>,
    ) -> Result<Option<Participant>> {
        let row = sqlx::query(&format!(
            "UPDATE direct_participants
             SET last_read_at = ?1
             WHERE conversation_id = ?2 AND user_id = ?3
             RETURNING {PARTICIPANT_COLUMNS}"
        ))
        .bind(to_micros(at))
        .bind(conversation_id.0)
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(participant_from_row).transpose()
    }

    /// Appends a message and bumps the conversation's `updated_at`.
    ///
    /// `created_at` is never earlier than any active participant's
    /// `joined_at`, so a freshly reactivated recipient always sees it.
    pub async fn insert_message(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        content: &str,
        at: DateTime<Utc>,
    ) -> Result<DirectMessage> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&format!(
            "INSERT INTO direct_messages (conversation_id, sender_id, content, created_at)
             VALUES (?1, ?2, ?3, MAX(?4, COALESCE(
                 (SELECT MAX(joined_at) FROM direct_participants
                  WHERE conversation_id = ?1 AND left_at IS NULL), ?4)))
             RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(conversation_id.0)
        .bind(sender_id.0)
        .bind(content)
        .bind(to_micros(at))
        .fetch_one(&mut *tx)
        .await
        .with_context(|| {
            format!(
                "failed to insert message from {} into direct chat {}",
                sender_id.0, conversation_id.0
            )
        })?;
        let message = message_from_row(&row)?;

        sqlx::query("UPDATE direct_chats SET updated_at = MAX(updated_at, ?) WHERE id = ?")
            .bind(to_micros(message.created_at))
            .bind(conversation_id.0)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(message)
    }

    /// Messages with `created_at >= since`, oldest first.
    pub async fn list_messages(
        &self,
        conversation_id: ConversationId,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<DirectMessage>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM direct_messages
             WHERE conversation_id = ? AND created_at >= ?
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(conversation_id.0)
        .bind(since.map(to_micros).unwrap_or(i64::MIN))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    /// Unread messages per active conversation of `user_id`.
    ///
    /// A message is unread when someone else sent it inside the user's
    /// membership window and after their last read marker. Conversations with
    /// nothing unread are reported with zero.
    pub async fn unread_counts(&self, user_id: UserId) -> Result<Vec<UnreadCount>> {
        let rows = sqlx::query(
            "SELECT p.conversation_id, COUNT(m.id)
             FROM direct_participants p
             LEFT JOIN direct_messages m
               ON m.conversation_id = p.conversation_id
              AND m.sender_id <> p.user_id
              AND m.created_at >= p.joined_at
              AND (p.last_read_at IS NULL OR m.created_at > p.last_read_at)
             WHERE p.user_id = ? AND p.left_at IS NULL
             GROUP BY p.conversation_id
             ORDER BY p.conversation_id",
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| UnreadCount {
                conversation_id: ConversationId(r.get::<i64, _>(0)),
                unread: u32::try_from(r.get::<i64, _>(1)).unwrap_or(u32::MAX),
            })
            .collect())
    }

    /// Returns `true` when a new like row was written.
    pub async fn insert_like(&self, target: LikeTarget, user_id: UserId) -> Result<bool> {
        let sql = match target {
            LikeTarget::GroupPost(_) => {
                "INSERT INTO group_post_likes (post_id, user_id, created_at) VALUES (?, ?, ?)
                 ON CONFLICT(post_id, user_id) DO NOTHING"
            }
            LikeTarget::Review(_) => {
                "INSERT INTO review_likes (review_id, user_id, created_at) VALUES (?, ?, ?)
                 ON CONFLICT(review_id, user_id) DO NOTHING"
            }
        };
        let inserted = sqlx::query(sql)
            .bind(target.raw_id())
            .bind(user_id.0)
            .bind(to_micros(Utc::now()))
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to like {target} as user {}", user_id.0))?
            .rows_affected();
        Ok(inserted > 0)
    }

    /// Returns `true` when a like row was removed.
    pub async fn delete_like(&self, target: LikeTarget, user_id: UserId) -> Result<bool> {
        let sql = match target {
            LikeTarget::GroupPost(_) => {
                "DELETE FROM group_post_likes WHERE post_id = ? AND user_id = ?"
            }
            LikeTarget::Review(_) => "DELETE FROM review_likes WHERE review_id = ? AND user_id = ?",
        };
        let deleted = sqlx::query(sql)
            .bind(target.raw_id())
            .bind(user_id.0)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted > 0)
    }

    pub async fn like_state(&self, target: LikeTarget, user_id: UserId) -> Result<LikeState> {
        let sql = match target {
            LikeTarget::GroupPost(_) => {
                "SELECT COUNT(*), COALESCE(SUM(user_id = ?2), 0)
                 FROM group_post_likes WHERE post_id = ?1"
            }
            LikeTarget::Review(_) => {
                "SELECT COUNT(*), COALESCE(SUM(user_id = ?2), 0)
                 FROM review_likes WHERE review_id = ?1"
            }
        };
        let row = sqlx::query(sql)
            .bind(target.raw_id())
            .bind(user_id.0)
            .fetch_one(&self.pool)
            .await?;
        Ok(LikeState {
            target,
            liked: row.get::<i64, _>(1) > 0,
            count: u32::try_from(row.get::<i64, _>(0)).unwrap_or(u32::MAX),
        })
    }
}

fn ordered_pair(a: UserId, b: UserId) -> (UserId, UserId) {
    if a.0 <= b.0 {
        (a, b)
    } else {
        (b, a)
    }
}

pub fn to_micros(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

pub fn from_micros(value: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_micros(value)
        .ok_or_else(|| anyhow!("timestamp out of range: {value}"))
}

fn optional_micros(row: &SqliteRow, column: &str) -> Result<Option<DateTime<Utc>>> {
    row.try_get::<Option<i64>, _>(column)?
        .map(from_micros)
        .transpose()
}

fn conversation_from_row(row: &SqliteRow) -> Result<Conversation> {
    Ok(Conversation {
        id: ConversationId(row.try_get("id")?),
        group_id: GroupId(row.try_get("group_id")?),
        host_id: UserId(row.try_get("host_id")?),
        member_id: UserId(row.try_get("member_id")?),
        created_at: from_micros(row.try_get("created_at")?)?,
        updated_at: from_micros(row.try_get("updated_at")?)?,
    })
}

fn participant_from_row(row: &SqliteRow) -> Result<Participant> {
    Ok(Participant {
        conversation_id: ConversationId(row.try_get("conversation_id")?),
        user_id: UserId(row.try_get("user_id")?),
        joined_at: from_micros(row.try_get("joined_at")?)?,
        left_at: optional_micros(row, "left_at")?,
        last_read_at: optional_micros(row, "last_read_at")?,
    })
}

fn message_from_row(row: &SqliteRow) -> Result<DirectMessage> {
    Ok(DirectMessage {
        id: MessageId(row.try_get("id")?),
        conversation_id: ConversationId(row.try_get("conversation_id")?),
        sender_id: UserId(row.try_get("sender_id")?),
        content: row.try_get("content")?,
        created_at: from_micros(row.try_get("created_at")?)?,
    })
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
