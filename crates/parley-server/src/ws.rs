//! WebSocket transport.
//!
//! One actor per connection: a writer task owns the sink and serializes
//! [`ServerEvent`]s from the registry channel, a ping task watches liveness,
//! and the reader loop handles `join`/`leave` frames. When the reader exits
//! the connection leaves its rooms and the registry before the writer is torn
//! down.

use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};
use tracing::{debug, info, warn};

use parley_shared::constants::HANDSHAKE_USER_PARAM;
use parley_shared::protocol::{ClientEvent, ServerEvent};
use parley_shared::UserId;

use crate::api::AppState;
use crate::chat::ChatService;
use crate::error::ServerError;
use crate::registry::ConnectionHandle;

const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Close the connection if no pong arrives this long after a ping.
const PONG_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
pub struct Handshake {
    #[serde(rename = "userId")]
    user_id: Option<String>,
}

pub async fn ws_handler(
    State(state): State<AppState>,
    Query(handshake): Query<Handshake>,
    ws: WebSocketUpgrade,
) -> Result<Response, ServerError> {
    let raw = handshake
        .user_id
        .ok_or_else(|| {
            ServerError::Unauthenticated(format!("missing {HANDSHAKE_USER_PARAM} in handshake"))
        })?;
    let user: UserId = raw
        .parse()
        .map_err(|e| ServerError::BadRequest(format!("invalid {HANDSHAKE_USER_PARAM}: {e}")))?;

    let chat = state.chat.clone();
    Ok(ws.on_upgrade(move |socket| run_connection(socket, chat, user)))
}

async fn run_connection(socket: WebSocket, chat: ChatService, user: UserId) {
    let (sink, mut stream) = socket.split();
    let (event_tx, event_rx) = mpsc::unbounded_channel::<ServerEvent>();
    let (control_tx, control_rx) = mpsc::unbounded_channel::<Message>();

    let handle = chat.connect(user, event_tx);
    let connection = handle.id();

    let writer = tokio::spawn(writer_task(sink, event_rx, control_rx));

    let (pong_tx, mut pong_rx) = mpsc::unbounded_channel::<()>();
    let ping_tx = control_tx.clone();
    let pinger = tokio::spawn(async move {
        let mut ticker = interval(PING_INTERVAL);
        ticker.tick().await;

        loop {
            ticker.tick().await;

            if ping_tx.send(Message::Ping(Default::default())).is_err() {
                break;
            }

            match timeout(PONG_TIMEOUT, pong_rx.recv()).await {
                Ok(Some(())) => {}
                _ => {
                    warn!(connection = %connection, "Pong timeout, closing connection");
                    let _ = ping_tx.send(Message::Close(Some(CloseFrame {
                        code: 1001,
                        reason: "Pong timeout".into(),
                    })));
                    break;
                }
            }
        }
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => handle_frame(&chat, &handle, text.as_str()).await,
            Ok(Message::Binary(_)) => {
                let _ = handle.emit(ServerEvent::error("binary frames are not supported"));
            }
            Ok(Message::Pong(_)) => {
                let _ = pong_tx.send(());
            }
            Ok(Message::Ping(data)) => {
                let _ = control_tx.send(Message::Pong(data));
            }
            Ok(Message::Close(reason)) => {
                info!(connection = %connection, reason = ?reason, "Client initiated close");
                break;
            }
            Err(e) => {
                warn!(connection = %connection, error = %e, "WebSocket receive error");
                break;
            }
        }
    }

    chat.disconnect(&connection);
    pinger.abort();
    writer.abort();
}

/// Apply one client frame. Failures are reported back on the same connection.
pub async fn handle_frame(chat: &ChatService, handle: &ConnectionHandle, frame: &str) {
    let event = match ClientEvent::from_json(frame) {
        Ok(event) => event,
        Err(e) => {
            debug!(connection = %handle.id(), error = %e, "Malformed client frame");
            let _ = handle.emit(ServerEvent::error(format!("malformed frame: {e}")));
            return;
        }
    };

    match event {
        ClientEvent::Join(request) => {
            let joined = chat
                .join_room(handle.user_id(), handle.id(), request.room_id)
                .await;
            if let Err(e) = joined {
                debug!(
                    connection = %handle.id(),
                    room = %request.room_id,
                    error = %e,
                    "Join rejected"
                );
                let _ = handle.emit(ServerEvent::error(e.to_string()));
            }
        }
        ClientEvent::Leave(request) => chat.leave_room(&handle.id(), &request.room_id),
    }
}

async fn writer_task(
    mut sink: SplitSink<WebSocket, Message>,
    mut events: mpsc::UnboundedReceiver<ServerEvent>,
    mut control: mpsc::UnboundedReceiver<Message>,
) {
    loop {
        let frame = tokio::select! {
            Some(event) = events.recv() => match event.to_json() {
                Ok(json) => Message::Text(json.into()),
                Err(e) => {
                    warn!(event = event.name(), error = %e, "Failed to encode event");
                    continue;
                }
            },
            Some(message) = control.recv() => message,
            else => break,
        };

        let closing = matches!(frame, Message::Close(_));
        if sink.send(frame).await.is_err() || closing {
            break;
        }
    }
}
