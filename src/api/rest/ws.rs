use std::sync::Arc;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::StreamExt;
use tracing::{debug, info};

use crate::hub::connection::serve_connection;
use crate::state::AppState;

pub async fn driver_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (sender, receiver) = socket.split();

    debug!("driver websocket connected");

    let reason = serve_connection(
        state.hub.clone(),
        state.verifier.clone(),
        state.router.clone(),
        sender,
        receiver,
    )
    .await;

    info!(reason = ?reason, "driver websocket disconnected");
}
