use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use shared::{
    domain::{BroadcastTopic, ConversationId, GroupId, LikeTarget, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        BroadcastRequest, Conversation, CreateConversationRequest, DirectMessage, LikeBroadcast,
        LikeState, Participant, PushEnvelope, RealtimeEvent, SendMessageRequest, UnreadCount,
    },
};
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{info, warn};
use url::Url;

use crate::{BackendError, BroadcastChannel, ChatBackend, LikeBackend};

const PUSH_CAPACITY: usize = 256;
pub const API_KEY_HEADER: &str = "apikey";

/// Talks to the development server over REST and receives pushes over its
/// WebSocket.
pub struct HttpBackend {
    http: Client,
    server_url: String,
    api_key: Option<String>,
    changes: broadcast::Sender<RealtimeEvent>,
    broadcasts: broadcast::Sender<BroadcastRequest>,
}

impl HttpBackend {
    pub fn new(server_url: impl Into<String>, api_key: Option<String>) -> Result<Arc<Self>> {
        let server_url = server_url.into().trim_end_matches('/').to_string();
        let parsed = Url::parse(&server_url)
            .with_context(|| format!("invalid backend url: {server_url}"))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(anyhow!("backend url must start with http:// or https://"));
        }
        let (changes, _) = broadcast::channel(PUSH_CAPACITY);
        let (broadcasts, _) = broadcast::channel(PUSH_CAPACITY);
        Ok(Arc::new(Self {
            http: Client::new(),
            server_url,
            api_key,
            changes,
            broadcasts,
        }))
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .http
            .request(method, format!("{}{path}", self.server_url));
        match &self.api_key {
            Some(key) => builder.header(API_KEY_HEADER, key),
            None => builder,
        }
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        builder: RequestBuilder,
    ) -> Result<T, BackendError> {
        let response = builder.send().await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }

    async fn send_optional<T: DeserializeOwned>(
        &self,
        builder: RequestBuilder,
    ) -> Result<Option<T>, BackendError> {
        let response = builder.send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }

    async fn send_empty(&self, builder: RequestBuilder) -> Result<(), BackendError> {
        let response = builder.send().await?;
        check_status(response).await?;
        Ok(())
    }

    fn ws_url(&self) -> Result<Url> {
        let ws_url = if self.server_url.starts_with("https://") {
            self.server_url.replacen("https://", "wss://", 1)
        } else if self.server_url.starts_with("http://") {
            self.server_url.replacen("http://", "ws://", 1)
        } else {
            return Err(anyhow!("server_url must start with http:// or https://"));
        };
        let mut url = Url::parse(&format!("{ws_url}/ws"))?;
        if let Some(key) = &self.api_key {
            url.query_pairs_mut().append_pair(API_KEY_HEADER, key);
        }
        Ok(url)
    }

    /// Opens the push socket and forwards its frames to subscribers until the
    /// server closes it.
    pub async fn connect_push(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let ws_url = self.ws_url()?;
        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .with_context(|| format!("failed to connect websocket: {}", self.server_url))?;
        let (_, mut ws_reader) = ws_stream.split();
        info!(server_url = %self.server_url, "http: push socket connected");

        let backend = Arc::clone(self);
        Ok(tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => backend.route_push(&text),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!("http: push socket failed: {err}");
                        break;
                    }
                }
            }
            info!("http: push socket closed");
        }))
    }

    pub(crate) fn route_push(&self, text: &str) {
        match serde_json::from_str::<PushEnvelope>(text) {
            Ok(PushEnvelope::Change(event)) => {
                let _ = self.changes.send(event);
            }
            Ok(PushEnvelope::Broadcast(request)) => {
                let _ = self.broadcasts.send(request);
            }
            Err(err) => warn!("http: skipping malformed push frame: {err}"),
        }
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let api_error = serde_json::from_str::<ApiError>(&body).unwrap_or_else(|_| {
        let code = match status {
            StatusCode::NOT_FOUND => ErrorCode::NotFound,
            StatusCode::CONFLICT => ErrorCode::Conflict,
            StatusCode::UNAUTHORIZED => ErrorCode::Unauthorized,
            StatusCode::FORBIDDEN => ErrorCode::Forbidden,
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => ErrorCode::Validation,
            _ => ErrorCode::Internal,
        };
        ApiError::new(code, format!("{status}: {body}"))
    });
    Err(api_error.into())
}

fn participant_path(conversation_id: ConversationId, user_id: UserId) -> String {
    format!("/direct_chats/{conversation_id}/participants/{user_id}")
}

fn like_path(target: LikeTarget) -> String {
    format!("/likes/{}/{}", target.kind().as_str(), target.raw_id())
}

#[async_trait]
impl ChatBackend for HttpBackend {
    async fn find_conversation(
        &self,
        group_id: GroupId,
        user_a: UserId,
        user_b: UserId,
    ) -> Result<Option<Conversation>, BackendError> {
        self.send_optional(self.request(Method::GET, "/direct_chats").query(&[
            ("group_id", group_id.0),
            ("user_a", user_a.0),
            ("user_b", user_b.0),
        ]))
        .await
    }

    async fn create_conversation(
        &self,
        group_id: GroupId,
        host_id: UserId,
        member_id: UserId,
    ) -> Result<Conversation, BackendError> {
        self.send_json(
            self.request(Method::POST, "/direct_chats")
                .json(&CreateConversationRequest {
                    group_id,
                    host_id,
                    member_id,
                }),
        )
        .await
    }

    async fn load_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<Conversation>, BackendError> {
        self.send_optional(
            self.request(Method::GET, &format!("/direct_chats/{conversation_id}")),
        )
        .await
    }

    async fn list_conversations(&self, user_id: UserId) -> Result<Vec<Conversation>, BackendError> {
        self.send_json(self.request(Method::GET, &format!("/users/{user_id}/direct_chats")))
            .await
    }

    async fn delete_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<(), BackendError> {
        self.send_empty(self.request(Method::DELETE, &format!("/direct_chats/{conversation_id}")))
            .await
    }

    async fn load_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Option<Participant>, BackendError> {
        self.send_optional(
            self.request(Method::GET, &participant_path(conversation_id, user_id)),
        )
        .await
    }

    async fn create_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Participant, BackendError> {
        self.send_json(self.request(Method::POST, &participant_path(conversation_id, user_id)))
            .await
    }

    async fn rejoin_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Participant, BackendError> {
        let path = format!("{}/rejoin", participant_path(conversation_id, user_id));
        self.send_json(self.request(Method::POST, &path)).await
    }

    async fn leave_conversation(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Participant, BackendError> {
        let path = format!("{}/leave", participant_path(conversation_id, user_id));
        self.send_json(self.request(Method::POST, &path)).await
    }

    async fn mark_read(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<(), BackendError> {
        let path = format!("{}/read", participant_path(conversation_id, user_id));
        self.send_empty(self.request(Method::POST, &path)).await
    }

    async fn insert_message(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        content: &str,
    ) -> Result<DirectMessage, BackendError> {
        self.send_json(
            self.request(
                Method::POST,
                &format!("/direct_chats/{conversation_id}/messages"),
            )
            .json(&SendMessageRequest {
                sender_id,
                content: content.to_string(),
            }),
        )
        .await
    }

    async fn list_messages(
        &self,
        conversation_id: ConversationId,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<DirectMessage>, BackendError> {
        let mut builder = self.request(
            Method::GET,
            &format!("/direct_chats/{conversation_id}/messages"),
        );
        if let Some(since) = since {
            builder = builder.query(&[("since_micros", since.timestamp_micros())]);
        }
        self.send_json(builder).await
    }

    async fn unread_counts(
        &self,
        user_id: UserId,
        conversation_ids: Option<&[ConversationId]>,
    ) -> Result<Vec<UnreadCount>, BackendError> {
        let mut builder = self.request(Method::GET, &format!("/users/{user_id}/unread"));
        if let Some(ids) = conversation_ids {
            let joined = ids
                .iter()
                .map(|id| id.0.to_string())
                .collect::<Vec<_>>()
                .join(",");
            builder = builder.query(&[("conversation_ids", joined)]);
        }
        self.send_json(builder).await
    }

    fn subscribe_changes(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.changes.subscribe()
    }
}

#[async_trait]
impl LikeBackend for HttpBackend {
    async fn like_state(
        &self,
        target: LikeTarget,
        user_id: UserId,
    ) -> Result<LikeState, BackendError> {
        self.send_json(
            self.request(Method::GET, &like_path(target))
                .query(&[("user_id", user_id.0)]),
        )
        .await
    }

    async fn add_like(&self, target: LikeTarget, user_id: UserId) -> Result<(), BackendError> {
        self.send_empty(
            self.request(Method::PUT, &like_path(target))
                .query(&[("user_id", user_id.0)]),
        )
        .await
    }

    async fn remove_like(&self, target: LikeTarget, user_id: UserId) -> Result<(), BackendError> {
        self.send_empty(
            self.request(Method::DELETE, &like_path(target))
                .query(&[("user_id", user_id.0)]),
        )
        .await
    }
}

#[async_trait]
impl BroadcastChannel for HttpBackend {
    async fn publish(
        &self,
        topic: BroadcastTopic,
        payload: LikeBroadcast,
    ) -> Result<(), BackendError> {
        self.send_empty(
            self.request(Method::POST, "/broadcast")
                .json(&BroadcastRequest { topic, payload }),
        )
        .await
    }

    fn subscribe_broadcasts(&self) -> broadcast::Receiver<BroadcastRequest> {
        self.broadcasts.subscribe()
    }
}

#[cfg(test)]
#[path = "tests/http_backend_tests.rs"]
mod tests;
