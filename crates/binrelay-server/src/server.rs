//! Terminal-facing HTTP surface: the `/ws` socket plus two small JSON routes.

use std::future::Future;
use std::sync::Arc;

use axum::Router;
use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use binrelay_core::{HubConfig, Role};

use crate::hub::RelayHub;
use crate::registry::TerminalConnection;

/// Frames buffered per terminal before broadcasts start to wait on it.
const TERMINAL_QUEUE: usize = 256;

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<RelayHub>,
    pub config: Arc<HubConfig>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ConnectQuery {
    pub token: Option<String>,
    pub role: Option<String>,
}

/// Why a terminal was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejection {
    pub code: u16,
    pub reason: &'static str,
}

/// Check the token and resolve the role. A missing role means the bin.
pub fn admit(query: &ConnectQuery, expected_token: &str) -> Result<Role, Rejection> {
    if query.token.as_deref() != Some(expected_token) {
        return Err(Rejection {
            code: close_code::POLICY,
            reason: "unauthorized",
        });
    }
    match query.role.as_deref() {
        None => Ok(Role::Bin),
        Some(raw) => raw.parse().map_err(|_| Rejection {
            code: close_code::UNSUPPORTED,
            reason: "invalid role",
        }),
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/config", get(config_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<ConnectQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query))
}

async fn config_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "detection_delay": state.config.detection_delay_secs,
        "image_interval": state.config.image_interval_secs,
        "ws_token": state.config.auth_token,
    }))
}

async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "upstream": state.hub.upstream_state().to_string(),
        "terminals": state.hub.registry().connection_count().await,
    }))
}

async fn handle_socket(mut socket: WebSocket, state: AppState, query: ConnectQuery) {
    let role = match admit(&query, &state.config.auth_token) {
        Ok(role) => role,
        Err(rejection) => {
            warn!(
                role = ?query.role,
                reason = rejection.reason,
                "Rejecting terminal connection"
            );
            let frame = CloseFrame {
                code: rejection.code,
                reason: rejection.reason.into(),
            };
            if let Err(e) = socket.send(Message::Close(Some(frame))).await {
                debug!(error = %e, "Failed to send close frame");
            }
            return;
        }
    };

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (frame_tx, mut frame_rx) = mpsc::channel::<String>(TERMINAL_QUEUE);
    let conn = Arc::new(TerminalConnection::new(role, frame_tx));
    let connection_id = conn.id;
    state.hub.register_terminal(Arc::clone(&conn)).await;
    info!(role = %role, %connection_id, "Terminal connected");

    let writer_conn = Arc::clone(&conn);
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                frame = frame_rx.recv() => {
                    let Some(text) = frame else { break };
                    if ws_tx.send(Message::Text(text.into())).await.is_err() {
                        debug!("Terminal send failed, client disconnected");
                        break;
                    }
                }
                () = writer_conn.closed() => {
                    let frame = CloseFrame {
                        code: close_code::NORMAL,
                        reason: "closed".into(),
                    };
                    let _ = ws_tx.send(Message::Close(Some(frame))).await;
                    break;
                }
            }
        }
    });

    loop {
        tokio::select! {
            () = conn.closed() => break,
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let routed = state
                        .hub
                        .handle_terminal_message(role, text.as_str().to_owned())
                        .await;
                    debug!(role = %role, ?routed, "Terminal message routed");
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(role = %role, error = %e, "Terminal socket error");
                    break;
                }
            },
        }
    }

    state.hub.unregister_terminal(role, connection_id).await;
    conn.close();
    if let Err(e) = writer.await {
        debug!(error = %e, "Terminal writer task failed");
    }
    info!(role = %role, %connection_id, "Terminal disconnected");
}
