//! WebSocket upgrade handler and per-connection read loop.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::Mutex;
use tokio::time;

use crate::envelope::clock_prefix;
use crate::error::ConnectionError;
use crate::hub::REGISTRATION_DEADLINE;
use crate::session::{CloseCode, Connection, Session};
use crate::AppState;

use super::dispatch;

pub fn router() -> Router<AppState> {
    Router::new().route("/ws", get(ws_upgrade))
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

/// Write half of a WebSocket, shared by every task that fans out to this
/// session.
struct WsConnection {
    sink: Mutex<SplitSink<WebSocket, Message>>,
}

#[async_trait]
impl Connection for WsConnection {
    async fn send_text(&self, text: &str) -> Result<(), ConnectionError> {
        self.sink
            .lock()
            .await
            .send(Message::Text(text.to_string().into()))
            .await
            .map_err(|err| ConnectionError::Transport(err.to_string()))
    }

    async fn close(&self, code: CloseCode, reason: &str) {
        let code = match code {
            CloseCode::Normal => 1000,
            CloseCode::Internal => 1011,
        };
        let frame = Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        }));
        let _ = self.sink.lock().await.send(frame).await;
    }
}

async fn handle_connection(socket: WebSocket, state: AppState) {
    let (ws_tx, ws_rx) = socket.split();
    let conn = Arc::new(WsConnection {
        sink: Mutex::new(ws_tx),
    });

    // Guest name; authentication is the responsibility of the outer HTTP
    // layer and arrives here as an already-authenticated session.
    let name = format!("User{}", rand::thread_rng().gen_range(1000..10000));
    let session = Session::new(name, conn);

    if let Err(err) = state.hub.register(session.clone()).await {
        tracing::warn!(?err, session = %session.name, "registration rejected");
        session.close(CloseCode::Normal, "server shutting down").await;
        return;
    }

    // One-time registration completion, bounded.
    if time::timeout(REGISTRATION_DEADLINE, session.registered().wait())
        .await
        .is_err()
    {
        tracing::warn!(session = %session.name, "registration timed out");
        session.close(CloseCode::Internal, "registration timeout").await;
        return;
    }

    tracing::info!(session = %session.name, "websocket session established");

    let welcome = format!(
        "{} Welcome to the chat! Your name is {}",
        clock_prefix(),
        session.name
    );
    if session.send(&welcome).await.is_err() {
        tracing::debug!(session = %session.name, "welcome write failed");
    }

    run_read_loop(&state, &session, ws_rx).await;

    state.hub.unregister(session.clone()).await;
    tracing::info!(session = %session.name, "websocket session ended");
}

async fn run_read_loop(state: &AppState, session: &Arc<Session>, mut ws_rx: SplitStream<WebSocket>) {
    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                dispatch::handle_frame(state, session, &text).await;
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Binary(_)) => continue,
            Ok(Message::Close(_)) | Err(_) => break,
        }
    }
}
