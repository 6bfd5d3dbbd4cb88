use crate::registry::SERVER_SHUTDOWN;
use crate::server::SharedState;
use crate::session::Session;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::StreamExt;
use tracing::instrument;

#[instrument(skip(ws, state))]
pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<SharedState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: SharedState) {
    let Some(registration) = state.registry.register() else {
        tracing::info!("Refusing connection during shutdown");
        let _ = socket
            .send(Message::Close(Some(SERVER_SHUTDOWN.frame())))
            .await;
        return;
    };

    let (sink, stream) = socket.split();
    let session = Session::new(registration, state.session_context.clone());
    session.run(sink, stream).await;
}
