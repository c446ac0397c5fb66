use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, Query, Request, State, WebSocketUpgrade},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use shared::{
    domain::{BroadcastTopic, ConversationId, GroupId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        BroadcastRequest, Conversation, ConversationLookupQuery, CreateConversationRequest,
        CreateGroupRequest, CreateGroupResponse, CreatePostRequest, CreatePostResponse,
        CreateReviewRequest, CreateReviewResponse, CreateUserRequest, CreateUserResponse,
        DirectMessage, LikeState, ListMessagesQuery, Participant, PushEnvelope,
        RealtimeEvent, SendMessageRequest, UnreadCount, UnreadQuery, UserQuery,
    },
};
use storage::Storage;
use tokio::sync::broadcast;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info, warn};

mod api;
mod app_state;
mod config;

use api::ApiContext;
use app_state::AppState;
use config::{load_settings, prepare_database_url};

const API_KEY_HEADER: &str = "apikey";
const MAX_BODY_BYTES: usize = 64 * 1024;

type HttpResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;
    let (pushes, _) = broadcast::channel(settings.push_capacity);
    if settings.api_key.is_none() {
        warn!("http: no api key configured, every route is open");
    }

    let state = AppState {
        api: ApiContext { storage },
        pushes,
        api_key: settings.api_key,
    };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/users", post(http_create_user))
        .route("/groups", post(http_create_group))
        .route("/groups/:group_id/posts", post(http_create_post))
        .route("/groups/:group_id/reviews", post(http_create_review))
        .route(
            "/direct_chats",
            get(http_find_conversation).post(http_create_conversation),
        )
        .route(
            "/direct_chats/:conversation_id",
            get(http_load_conversation).delete(http_delete_conversation),
        )
        .route("/users/:user_id/direct_chats", get(http_list_conversations))
        .route(
            "/direct_chats/:conversation_id/participants/:user_id",
            get(http_load_participant).post(http_create_participant),
        )
        .route(
            "/direct_chats/:conversation_id/participants/:user_id/rejoin",
            post(http_rejoin_participant),
        )
        .route(
            "/direct_chats/:conversation_id/participants/:user_id/leave",
            post(http_leave_conversation),
        )
        .route(
            "/direct_chats/:conversation_id/participants/:user_id/read",
            post(http_mark_read),
        )
        .route(
            "/direct_chats/:conversation_id/messages",
            get(http_list_messages).post(http_send_message),
        )
        .route("/users/:user_id/unread", get(http_unread_counts))
        .route(
            "/likes/:kind/:target_id",
            put(http_add_like)
                .delete(http_remove_like)
                .get(http_like_state),
        )
        .route("/broadcast", post(http_broadcast))
        .route("/ws", get(ws_handler))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            require_api_key,
        ))
        .route("/healthz", get(healthz))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(state)
}

async fn require_api_key(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.api_key.as_deref() else {
        return next.run(request).await;
    };

    let from_header = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let from_query = request.uri().query().and_then(|query| {
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == API_KEY_HEADER)
            .map(|(_, value)| value.into_owned())
    });

    if from_header.or(from_query).as_deref() == Some(expected) {
        return next.run(request).await;
    }
    warn!(path = %request.uri().path(), "http: rejected request without a valid api key");
    failure(ApiError::new(ErrorCode::Unauthorized, "missing or invalid api key")).into_response()
}

fn failure(err: ApiError) -> (StatusCode, Json<ApiError>) {
    let status = match err.code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Conflict => StatusCode::CONFLICT,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!(message = %err.message, "http: request failed");
    }
    (status, Json(err))
}

async fn healthz(State(state): State<Arc<AppState>>) -> Result<&'static str, StatusCode> {
    state.api.storage.health_check().await.map_err(|error| {
        error!(%error, "http: health check failed");
        StatusCode::SERVICE_UNAVAILABLE
    })?;
    Ok("ok")
}

async fn http_create_user(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateUserRequest>,
) -> HttpResult<Json<CreateUserResponse>> {
    let user_id = api::create_user(&state.api, &req.username)
        .await
        .map_err(failure)?;
    Ok(Json(CreateUserResponse { user_id }))
}

async fn http_create_group(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateGroupRequest>,
) -> HttpResult<Json<CreateGroupResponse>> {
    let group_id = api::create_group(&state.api, &req).await.map_err(failure)?;
    Ok(Json(CreateGroupResponse { group_id }))
}

async fn http_create_post(
    State(state): State<Arc<AppState>>,
    Path(group_id): Path<i64>,
    Json(req): Json<CreatePostRequest>,
) -> HttpResult<Json<CreatePostResponse>> {
    let post_id = api::create_post(&state.api, GroupId(group_id), &req)
        .await
        .map_err(failure)?;
    Ok(Json(CreatePostResponse { post_id }))
}

async fn http_create_review(
    State(state): State<Arc<AppState>>,
    Path(group_id): Path<i64>,
    Json(req): Json<CreateReviewRequest>,
) -> HttpResult<Json<CreateReviewResponse>> {
    let review_id = api::create_review(&state.api, GroupId(group_id), &req)
        .await
        .map_err(failure)?;
    Ok(Json(CreateReviewResponse { review_id }))
}

async fn http_find_conversation(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ConversationLookupQuery>,
) -> HttpResult<Json<Conversation>> {
    let conversation = api::find_conversation(
        &state.api,
        GroupId(q.group_id),
        UserId(q.user_a),
        UserId(q.user_b),
    )
    .await
    .map_err(failure)?;
    Ok(Json(conversation))
}

async fn http_create_conversation(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateConversationRequest>,
) -> HttpResult<Json<Conversation>> {
    let applied = api::create_conversation(&state.api, &req)
        .await
        .map_err(failure)?;
    info!(
        conversation_id = %applied.value.id,
        group_id = %req.group_id,
        "http: direct chat created"
    );
    state.publish_changes(applied.changes);
    Ok(Json(applied.value))
}

async fn http_load_conversation(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<i64>,
) -> HttpResult<Json<Conversation>> {
    let conversation = api::load_conversation(&state.api, ConversationId(conversation_id))
        .await
        .map_err(failure)?;
    Ok(Json(conversation))
}

async fn http_delete_conversation(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<i64>,
) -> HttpResult<StatusCode> {
    let applied = api::delete_conversation(&state.api, ConversationId(conversation_id))
        .await
        .map_err(failure)?;
    info!(%conversation_id, "http: direct chat deleted");
    state.publish_changes(applied.changes);
    Ok(StatusCode::NO_CONTENT)
}

async fn http_list_conversations(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<i64>,
) -> HttpResult<Json<Vec<Conversation>>> {
    let conversations = api::list_conversations(&state.api, UserId(user_id))
        .await
        .map_err(failure)?;
    Ok(Json(conversations))
}

async fn http_load_participant(
    State(state): State<Arc<AppState>>,
    Path((conversation_id, user_id)): Path<(i64, i64)>,
) -> HttpResult<Json<Participant>> {
    let participant =
        api::load_participant(&state.api, ConversationId(conversation_id), UserId(user_id))
            .await
            .map_err(failure)?;
    Ok(Json(participant))
}

async fn http_create_participant(
    State(state): State<Arc<AppState>>,
    Path((conversation_id, user_id)): Path<(i64, i64)>,
) -> HttpResult<Json<Participant>> {
    let applied =
        api::create_participant(&state.api, ConversationId(conversation_id), UserId(user_id))
            .await
            .map_err(failure)?;
    state.publish_changes(applied.changes);
    Ok(Json(applied.value))
}

async fn http_rejoin_participant(
    State(state): State<Arc<AppState>>,
    Path((conversation_id, user_id)): Path<(i64, i64)>,
) -> HttpResult<Json<Participant>> {
    let applied =
        api::rejoin_participant(&state.api, ConversationId(conversation_id), UserId(user_id))
            .await
            .map_err(failure)?;
    state.publish_changes(applied.changes);
    Ok(Json(applied.value))
}

async fn http_leave_conversation(
    State(state): State<Arc<AppState>>,
    Path((conversation_id, user_id)): Path<(i64, i64)>,
) -> HttpResult<Json<Participant>> {
    let applied =
        api::leave_conversation(&state.api, ConversationId(conversation_id), UserId(user_id))
            .await
            .map_err(failure)?;
    state.publish_changes(applied.changes);
    Ok(Json(applied.value))
}

async fn http_mark_read(
    State(state): State<Arc<AppState>>,
    Path((conversation_id, user_id)): Path<(i64, i64)>,
) -> HttpResult<Json<Participant>> {
    let applied = api::mark_read(&state.api, ConversationId(conversation_id), UserId(user_id))
        .await
        .map_err(failure)?;
    state.publish_changes(applied.changes);
    Ok(Json(applied.value))
}

async fn http_send_message(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<i64>,
    Json(req): Json<SendMessageRequest>,
) -> HttpResult<Json<DirectMessage>> {
    let applied = api::send_message(&state.api, ConversationId(conversation_id), &req)
        .await
        .map_err(failure)?;
    state.publish_changes(applied.changes);
    Ok(Json(applied.value))
}

async fn http_list_messages(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<i64>,
    Query(q): Query<ListMessagesQuery>,
) -> HttpResult<Json<Vec<DirectMessage>>> {
    let messages = api::list_messages(&state.api, ConversationId(conversation_id), q.since_micros)
        .await
        .map_err(failure)?;
    Ok(Json(messages))
}

async fn http_unread_counts(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<i64>,
    Query(q): Query<UnreadQuery>,
) -> HttpResult<Json<Vec<UnreadCount>>> {
    let counts = api::unread_counts(&state.api, UserId(user_id), q.conversation_ids.as_deref())
        .await
        .map_err(failure)?;
    Ok(Json(counts))
}

async fn http_like_state(
    State(state): State<Arc<AppState>>,
    Path((kind, target_id)): Path<(String, i64)>,
    Query(q): Query<UserQuery>,
) -> HttpResult<Json<LikeState>> {
    let target = api::parse_like_target(&kind, target_id).map_err(failure)?;
    let like_state = api::like_state(&state.api, target, UserId(q.user_id))
        .await
        .map_err(failure)?;
    Ok(Json(like_state))
}

async fn http_add_like(
    State(state): State<Arc<AppState>>,
    Path((kind, target_id)): Path<(String, i64)>,
    Query(q): Query<UserQuery>,
) -> HttpResult<StatusCode> {
    let target = api::parse_like_target(&kind, target_id).map_err(failure)?;
    let created = api::add_like(&state.api, target, UserId(q.user_id))
        .await
        .map_err(failure)?;
    Ok(if created {
        StatusCode::CREATED
    } else {
        StatusCode::NO_CONTENT
    })
}

async fn http_remove_like(
    State(state): State<Arc<AppState>>,
    Path((kind, target_id)): Path<(String, i64)>,
    Query(q): Query<UserQuery>,
) -> HttpResult<StatusCode> {
    let target = api::parse_like_target(&kind, target_id).map_err(failure)?;
    api::remove_like(&state.api, target, UserId(q.user_id))
        .await
        .map_err(failure)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_broadcast(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BroadcastRequest>,
) -> HttpResult<StatusCode> {
    let consistent = match req.topic {
        BroadcastTopic::Target { target } => target == req.payload.target,
        BroadcastTopic::Group { group_id } => group_id == req.payload.group_id,
    };
    if !consistent {
        return Err(failure(ApiError::new(
            ErrorCode::Validation,
            format!("payload does not belong to topic {}", req.topic),
        )));
    }
    // Zero receivers just means nobody is listening right now.
    let _ = state.pushes.send(PushEnvelope::Broadcast(req));
    Ok(StatusCode::ACCEPTED)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(state, socket))
}

async fn ws_connection(state: Arc<AppState>, socket: axum::extract::ws::WebSocket) {
    use axum::extract::ws::Message;
    use futures::{SinkExt, StreamExt};
    use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};

    let (mut sender, mut receiver) = socket.split();
    let mut pushes = BroadcastStream::new(state.pushes.subscribe());

    let send_task = tokio::spawn(async move {
        while let Some(item) = pushes.next().await {
            let envelope = match item {
                Ok(envelope) => envelope,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(skipped, "realtime: push socket lagged behind, asking client to resync");
                    resync_notice(skipped)
                }
            };
            let text = match serde_json::to_string(&envelope) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(_msg)) = receiver.next().await {}

    send_task.abort();
}

fn resync_notice(skipped: u64) -> PushEnvelope {
    PushEnvelope::Change(RealtimeEvent::Resync { skipped })
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
