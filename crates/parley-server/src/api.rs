use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, Method, StatusCode},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use parley_shared::constants::{PROTOCOL_VERSION, USER_ID_HEADER};
use parley_shared::protocol::{MessagePayload, ReactionPayload};
use parley_shared::{ConversationRef, GroupId, MessageId, UserId};
use parley_store::{Group, NewMessage, PushSubscription};

use crate::chat::ChatService;
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::ws::ws_handler;

#[derive(Clone)]
pub struct AppState {
    pub chat: ChatService,
    pub config: Arc<ServerConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/online", get(online_users))
        .route(
            "/direct/{peer_id}/messages",
            post(send_direct).get(list_direct),
        )
        .route("/groups", post(create_group))
        .route("/groups/{group_id}/members", post(add_member))
        .route("/groups/{group_id}/members/{user_id}", delete(remove_member))
        .route(
            "/groups/{group_id}/messages",
            post(send_group).get(list_group),
        )
        .route("/messages/{message_id}/reactions", post(react))
        .route("/push/subscriptions", post(subscribe_push))
        .route("/ws", get(ws_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// The authenticated caller, taken from the header set by the
/// authentication layer in front of this server.
pub struct Caller(pub UserId);

impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| ServerError::Unauthenticated(format!("missing {USER_ID_HEADER} header")))?;

        raw.parse()
            .map(Caller)
            .map_err(|e| ServerError::Unauthenticated(format!("invalid {USER_ID_HEADER}: {e}")))
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    protocol: &'static str,
    name: String,
    connections: usize,
}

#[derive(Debug, Default, Deserialize)]
struct HistoryQuery {
    after: Option<MessageId>,
    limit: Option<u32>,
}

#[derive(Deserialize)]
struct CreateGroupRequest {
    name: String,
    #[serde(default)]
    members: Vec<UserId>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MemberRequest {
    user_id: UserId,
}

#[derive(Deserialize)]
struct ReactionRequest {
    emoji: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReactionsResponse {
    message_id: MessageId,
    reactions: Vec<ReactionPayload>,
}

#[derive(Deserialize)]
struct SubscribeRequest {
    endpoint: String,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        protocol: PROTOCOL_VERSION,
        name: state.config.instance_name.clone(),
        connections: state.chat.registry().connection_count(),
    })
}

async fn online_users(State(state): State<AppState>) -> Json<Vec<UserId>> {
    Json(state.chat.registry().online_users())
}

async fn send_direct(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(peer): Path<UserId>,
    Json(content): Json<NewMessage>,
) -> Result<(StatusCode, Json<MessagePayload>), ServerError> {
    let conversation = ConversationRef::direct(caller, peer);
    let sent = state.chat.send_message(caller, conversation, content).await?;
    Ok((StatusCode::CREATED, Json((&sent.message).into())))
}

async fn list_direct(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(peer): Path<UserId>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<MessagePayload>>, ServerError> {
    let conversation = ConversationRef::direct(caller, peer);
    let messages = state
        .chat
        .history(caller, conversation, query.after, query.limit)
        .await?;
    Ok(Json(messages.iter().map(MessagePayload::from).collect()))
}

async fn create_group(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Json(req): Json<CreateGroupRequest>,
) -> Result<(StatusCode, Json<Group>), ServerError> {
    let group = state.chat.create_group(caller, req.name, req.members).await?;
    Ok((StatusCode::CREATED, Json(group)))
}

async fn add_member(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(group_id): Path<GroupId>,
    Json(req): Json<MemberRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let added = state.chat.add_member(caller, group_id, req.user_id).await?;
    Ok(Json(serde_json::json!({ "added": added })))
}

async fn remove_member(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path((group_id, user_id)): Path<(GroupId, UserId)>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let removed = state.chat.remove_member(caller, group_id, user_id).await?;
    Ok(Json(serde_json::json!({ "removed": removed })))
}

async fn send_group(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(group_id): Path<GroupId>,
    Json(content): Json<NewMessage>,
) -> Result<(StatusCode, Json<MessagePayload>), ServerError> {
    let conversation = ConversationRef::group(group_id);
    let sent = state.chat.send_message(caller, conversation, content).await?;
    Ok((StatusCode::CREATED, Json((&sent.message).into())))
}

async fn list_group(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(group_id): Path<GroupId>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<MessagePayload>>, ServerError> {
    let messages = state
        .chat
        .history(caller, ConversationRef::group(group_id), query.after, query.limit)
        .await?;
    Ok(Json(messages.iter().map(MessagePayload::from).collect()))
}

async fn react(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(message_id): Path<MessageId>,
    Json(req): Json<ReactionRequest>,
) -> Result<Json<ReactionsResponse>, ServerError> {
    let reacted = state.chat.react(caller, message_id, req.emoji).await?;
    Ok(Json(ReactionsResponse {
        message_id,
        reactions: reacted
            .reactions
            .reactions
            .iter()
            .map(ReactionPayload::from)
            .collect(),
    }))
}

async fn subscribe_push(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Json(req): Json<SubscribeRequest>,
) -> Result<(StatusCode, Json<PushSubscription>), ServerError> {
    let subscription = state.chat.add_push_subscription(caller, req.endpoint).await?;
    info!(user = %caller, subscription = %subscription.id, "Push subscription registered");
    Ok((StatusCode::CREATED, Json(subscription)))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
