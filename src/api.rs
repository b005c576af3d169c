use crate::config::Config;
use crate::conversations;
use crate::db::{self, DbPool};
use crate::directory::{ProfileDirectory, StaticDirectory};
use crate::error::ChatError;
use crate::housekeeping;
use crate::identity;
use crate::messages;
use crate::model::ConversationView;
use crate::notify::{Notifier, NullNotifier};
use crate::realtime::{self, Hub, StreamEnd};
use crate::reads;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{collections::HashMap, net::SocketAddr, sync::Arc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
    pub hub: Arc<Hub>,
    pub directory: Arc<dyn ProfileDirectory>,
    pub notifier: Arc<dyn Notifier>,
    pub config: Config,
}

impl AppState {
    /// State for a standalone deployment: empty in-memory profile
    /// directory, notifications dropped.
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        Self::with_services(
            config,
            Arc::new(StaticDirectory::new()),
            Arc::new(NullNotifier),
        )
        .await
    }

    pub async fn with_services(
        config: Config,
        directory: Arc<dyn ProfileDirectory>,
        notifier: Arc<dyn Notifier>,
    ) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir).await?;
        let pool = db::open_pool(config.data_dir.join("chat.db"))?;
        Ok(Self {
            pool,
            hub: Arc::new(Hub::default()),
            directory,
            notifier,
            config,
        })
    }
}

/// Build the HTTP application router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route(
            "/api/conversations",
            post(create_conversation).get(list_conversations),
        )
        .route("/api/conversations/:id/messages", get(conversation_messages))
        .route("/api/messages", post(post_message))
        .route("/api/read_pointer", post(set_read_pointer))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Serialize)]
struct ErrorResp {
    error: String,
}

fn error_code(e: &ChatError) -> &'static str {
    match e {
        ChatError::InvalidParticipants(_) => "invalid_participants",
        ChatError::InitializationFailed(_) => "initialization_failed",
        ChatError::Timeout => "timeout",
        ChatError::NotFound(_) => "not_found",
        ChatError::EmptyMessage => "empty_message",
        ChatError::Storage(_) => "storage",
    }
}

fn err(e: &ChatError) -> (StatusCode, Json<ErrorResp>) {
    let status = match e {
        ChatError::InvalidParticipants(_) | ChatError::EmptyMessage => StatusCode::BAD_REQUEST,
        ChatError::NotFound(_) => StatusCode::NOT_FOUND,
        ChatError::InitializationFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
        ChatError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ChatError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResp {
            error: error_code(e).into(),
        }),
    )
}

#[derive(Deserialize)]
struct EnsureReq {
    user_id: String,
    peer_id: String,
    user_name: Option<String>,
    peer_name: Option<String>,
}

async fn create_conversation(
    State(state): State<AppState>,
    Json(req): Json<EnsureReq>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResp>)> {
    let directory = state.directory.clone();
    let conv = db::with_conn(&state.pool, state.config.op_timeout(), move |conn| {
        conversations::ensure_conversation(
            conn,
            directory.as_ref(),
            &req.user_id,
            &req.peer_id,
            req.user_name.as_deref(),
            req.peer_name.as_deref(),
        )
    })
    .await
    .map_err(|e| err(&e))?;
    // creates and name repairs surface on live inboxes; no-ops are
    // filtered out by the subscribers' updated_at admit check
    state.hub.publish_conversation(&conv);
    Ok((StatusCode::OK, Json(conv)))
}

#[derive(Deserialize)]
struct InboxQuery {
    user: String,
}

async fn list_conversations(
    State(state): State<AppState>,
    Query(q): Query<InboxQuery>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResp>)> {
    if !identity::valid_participant(&q.user) {
        return Err(err(&ChatError::InvalidParticipants(format!(
            "bad id: {:?}",
            q.user
        ))));
    }
    let user = q.user.clone();
    let convs = db::with_read_conn(&state.pool, state.config.op_timeout(), move |conn| {
        conversations::list_conversations_for_user(conn, &user)
    })
    .await
    .map_err(|e| err(&e))?;
    let views: Vec<ConversationView> = convs.iter().filter_map(|c| c.view_for(&q.user)).collect();
    Ok(Json(views))
}

async fn conversation_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResp>)> {
    let msgs = db::with_read_conn(&state.pool, state.config.op_timeout(), move |conn| {
        if conversations::get_conversation(conn, &id)?.is_none() {
            return Err(ChatError::NotFound(format!("conversation: {id}")));
        }
        messages::list_messages(conn, &id)
    })
    .await
    .map_err(|e| err(&e))?;
    Ok(Json(msgs))
}

#[derive(Deserialize)]
struct SendReq {
    conversation_id: String,
    sender_id: String,
    body: String,
}

async fn post_message(
    State(state): State<AppState>,
    Json(req): Json<SendReq>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResp>)> {
    // snapshot the sender's display name from the profile service; the
    // log keeps the stored conversation name as fallback
    let sender_name = state.directory.display_name(&req.sender_id).ok();

    // commit+publish is serialized per conversation so subscribers see
    // message deltas in storage order
    let order = state.hub.order_lock(&req.conversation_id);
    let _guard = order.lock().await;

    let conversation_id = req.conversation_id.clone();
    let msg = db::with_conn(&state.pool, state.config.op_timeout(), move |conn| {
        messages::append(
            conn,
            &req.conversation_id,
            &req.sender_id,
            sender_name.as_deref(),
            &req.body,
        )
    })
    .await
    .map_err(|e| err(&e))?;

    // unread counter and summary are a separate unit of work; if it fails
    // the append still stands and the reconciler closes the counter gap
    let bookkeeping = {
        let msg = msg.clone();
        db::with_conn(&state.pool, state.config.op_timeout(), move |conn| {
            reads::on_message_sent(conn, &msg)
        })
        .await
    };
    state.hub.publish_message(&msg);
    match bookkeeping {
        Ok(conv) => state.hub.publish_conversation(&conv),
        Err(e) => warn!(%conversation_id, error = %e, "post-send bookkeeping failed"),
    }

    if let Some((a, b)) = identity::split_conversation_id(&conversation_id) {
        let recipient = if msg.sender_id == a { b } else { a };
        let notifier = state.notifier.clone();
        let (cid, sid, rid) = (
            conversation_id.clone(),
            msg.sender_id.clone(),
            recipient.to_string(),
        );
        tokio::spawn(async move { notifier.message_sent(&cid, &sid, &rid) });
    }

    Ok((StatusCode::CREATED, Json(msg)))
}

#[derive(Deserialize)]
struct ReadReq {
    conversation_id: String,
    user_id: String,
}

async fn set_read_pointer(
    State(state): State<AppState>,
    Json(req): Json<ReadReq>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResp>)> {
    let user_id = req.user_id.clone();
    let conv = db::with_conn(&state.pool, state.config.op_timeout(), move |conn| {
        reads::mark_conversation_read(conn, &req.conversation_id, &req.user_id)
    })
    .await
    .map_err(|e| err(&e))?;
    state.hub.publish_conversation(&conv);
    let view = conv
        .view_for(&user_id)
        .ok_or_else(|| err(&ChatError::NotFound(format!("participant: {user_id}"))))?;
    Ok(Json(view))
}

#[derive(Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum ClientAction {
    Subscribe { conversation_id: String },
    Inbox { user_id: String },
    Unsubscribe { topic: String },
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(64);
    let mut subs: HashMap<String, JoinHandle<()>> = HashMap::new();

    let _ = sender
        .send(WsMessage::Text(json!({"t": "hello"}).to_string()))
        .await;

    loop {
        tokio::select! {
            Some(text) = out_rx.recv() => {
                if sender.send(WsMessage::Text(text)).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<ClientAction>(&text) {
                            Ok(ClientAction::Subscribe { conversation_id }) => {
                                let key = format!("conversation:{conversation_id}");
                                if let Some(old) = subs.remove(&key) {
                                    old.abort();
                                }
                                subs.insert(
                                    key,
                                    tokio::spawn(forward_messages(
                                        state.clone(),
                                        conversation_id,
                                        out_tx.clone(),
                                    )),
                                );
                            }
                            Ok(ClientAction::Inbox { user_id }) => {
                                let key = format!("inbox:{user_id}");
                                if let Some(old) = subs.remove(&key) {
                                    old.abort();
                                }
                                subs.insert(
                                    key,
                                    tokio::spawn(forward_inbox(
                                        state.clone(),
                                        user_id,
                                        out_tx.clone(),
                                    )),
                                );
                            }
                            Ok(ClientAction::Unsubscribe { topic }) => {
                                if let Some(old) = subs.remove(&topic) {
                                    old.abort();
                                }
                            }
                            Err(_) => {
                                let _ = out_tx
                                    .send(json!({"t": "error", "error": "bad_action"}).to_string())
                                    .await;
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    // scoped release: every live subscription dies with the socket
    for (_, handle) in subs {
        handle.abort();
    }
}

// Snapshot, then live deltas. A lagged receiver falls back to the outer
// loop for a fresh snapshot-then-delta handshake.
async fn forward_messages(state: AppState, conversation_id: String, out: mpsc::Sender<String>) {
    loop {
        let mut sub = match realtime::subscribe_messages(
            &state.hub,
            &state.pool,
            state.config.op_timeout(),
            &conversation_id,
        )
        .await
        {
            Ok(sub) => sub,
            Err(e) => {
                let _ = out
                    .send(json!({"t": "error", "error": error_code(&e)}).to_string())
                    .await;
                return;
            }
        };
        let snapshot = json!({
            "t": "snapshot",
            "conversation_id": conversation_id,
            "messages": sub.take_snapshot(),
        });
        if out.send(snapshot.to_string()).await.is_err() {
            return;
        }
        loop {
            match sub.recv().await {
                Ok(msg) => {
                    let evt = json!({"t": "message", "message": msg});
                    if out.send(evt.to_string()).await.is_err() {
                        return;
                    }
                }
                Err(StreamEnd::Lagged) => break,
                Err(StreamEnd::Closed) => return,
            }
        }
    }
}

async fn forward_inbox(state: AppState, user_id: String, out: mpsc::Sender<String>) {
    loop {
        let mut sub = match realtime::subscribe_conversations_for(
            &state.hub,
            &state.pool,
            state.config.op_timeout(),
            &user_id,
        )
        .await
        {
            Ok(sub) => sub,
            Err(e) => {
                let _ = out
                    .send(json!({"t": "error", "error": error_code(&e)}).to_string())
                    .await;
                return;
            }
        };
        let snapshot = json!({
            "t": "snapshot",
            "user_id": user_id,
            "conversations": sub.take_snapshot(),
        });
        if out.send(snapshot.to_string()).await.is_err() {
            return;
        }
        loop {
            match sub.recv().await {
                Ok(conv) => {
                    let evt = json!({"t": "conversation", "conversation": conv});
                    if out.send(evt.to_string()).await.is_err() {
                        return;
                    }
                }
                Err(StreamEnd::Lagged) => break,
                Err(StreamEnd::Closed) => return,
            }
        }
    }
}

/// Run the HTTP server bound to the configured address.
pub async fn run_http_server(config: Config) -> anyhow::Result<()> {
    let state = AppState::new(config.clone()).await?;
    housekeeping::run_housekeeping(state.clone());
    let addr: SocketAddr = config.bind.parse()?;
    tracing::info!(%addr, "conversation service listening");
    axum::Server::bind(&addr)
        .serve(build_router(state).into_make_service())
        .await?;
    Ok(())
}

// Black-box HTTP and WebSocket tests live in tests/
