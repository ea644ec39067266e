// connection.rs
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::registry::{ChannelRegistry, Connection};
use crate::server::AppState;

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    pub session_id: Option<String>,
}

impl ConnectParams {
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref().filter(|s| !s.is_empty())
    }
}

/// `GET /ws?session_id=<id>`
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let session_id = params.session_id().map(str::to_string);

    if session_id.is_none() && state.config.require_session_id {
        debug!("rejecting connection without session_id");
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "message": "session_id is required" })),
        )
            .into_response();
    }

    let registry = Arc::clone(&state.registry);
    ws.on_upgrade(move |socket| run_connection(socket, registry, session_id))
}

/// Drive one client from upgrade to disconnect.
///
/// The connection joins its session's channel (if it named one), receives
/// every frame published there, and leaves when the socket closes or a write fails.
pub async fn run_connection(
    socket: WebSocket,
    registry: Arc<ChannelRegistry>,
    session_id: Option<String>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Arc<str>>();
    let connection = Connection::new(tx);

    match session_id.as_deref() {
        Some(sid) => {
            registry.join(&connection, sid);
            info!(connection_id = %connection.id, session_id = sid, "client connected");
        }
        None => info!(connection_id = %connection.id, "client connected without session_id"),
    }

    let mut outbound = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if ws_tx.send(Message::Text(frame.to_string())).await.is_err() {
                break;
            }
        }
    });

    // Inbound frames carry nothing for us; read only to notice the close.
    let inbound = async {
        while let Some(Ok(msg)) = ws_rx.next().await {
            if let Message::Close(_) = msg {
                break;
            }
        }
    };

    tokio::select! {
        _ = &mut outbound => {}
        _ = inbound => {}
    }

    registry.leave(&connection.id);
    outbound.abort();
    info!(connection_id = %connection.id, "client disconnected");
}
