use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use shared::{
    domain::UserId,
    protocol::{ClientFrame, ServerEvent},
};

use crate::app_state::AppState;

#[derive(Debug, Deserialize)]
pub(crate) struct WsQuery {
    token: String,
}

pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<WsQuery>,
) -> Response {
    let user_id = match state.auth.verify(&q.token) {
        Ok(user_id) => user_id,
        Err(error) => {
            warn!(%error, "rejecting socket handshake");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    };
    ws.on_upgrade(move |socket| ws_connection(state, socket, user_id))
        .into_response()
}

async fn ws_connection(state: Arc<AppState>, socket: WebSocket, user_id: UserId) {
    let (mut sink, mut stream) = socket.split();
    let (outbound, mut events) = mpsc::unbounded_channel::<ServerEvent>();

    let connection_id = match state.api.hub.connect(user_id, outbound) {
        Ok(connection_id) => connection_id,
        Err(error) => {
            warn!(%error, "rejecting socket registration");
            if let Ok(text) = serde_json::to_string(&ServerEvent::Error(error.into())) {
                let _ = sink.send(Message::Text(text)).await;
            }
            return;
        }
    };

    // Sole writer for this connection: draining the queue in order is what
    // gives clients FIFO delivery.
    let send_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = stream.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        match serde_json::from_str::<ClientFrame>(&text) {
            Ok(ClientFrame::UpdatePresence { status }) => {
                state.api.hub.update_presence(user_id, status);
            }
            Ok(ClientFrame::Typing {
                receiver_id,
                is_typing,
            }) => {
                state.api.hub.typing(user_id, receiver_id, is_typing);
            }
            Err(error) => debug!(%error, "ignoring unparseable client frame"),
        }
    }

    // Runs whichever way the socket went away, in-flight deliveries included.
    state.api.hub.disconnect(connection_id);
    send_task.abort();
}
