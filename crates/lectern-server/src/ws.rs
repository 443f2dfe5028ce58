use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::rejection::QueryRejection;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::{SinkExt, StreamExt};
use lectern_core::presentation::{ErrorPayload, PresentationEvent, ServerFrame};
use lectern_core::{RelayError, Role, SessionKey};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

use crate::connection::ConnectionHandle;
use crate::registry::SessionRegistry;
use crate::server::AppState;

/// Interval between server pings.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// A connection with no pong for this long is closed.
pub const PONG_TIMEOUT: Duration = Duration::from_secs(90);

/// Query parameters of the `/ws` handshake.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct HandshakeParams {
    #[serde(rename = "apiKey")]
    pub api_key: Option<String>,
    #[serde(rename = "type")]
    pub client_type: Option<String>,
}

impl HandshakeParams {
    pub fn validate(&self) -> Result<(SessionKey, Role), RelayError> {
        let key = SessionKey::parse(self.api_key.clone().unwrap_or_default())?;
        let role = Role::from_handshake(self.client_type.as_deref())?;
        Ok((key, role))
    }
}

/// Time since the peer last answered a ping, shared between the reader that
/// records pongs and the writer that checks them.
#[derive(Debug)]
struct Heartbeat {
    started: Instant,
    last_pong_ms: AtomicU64,
}

impl Heartbeat {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            last_pong_ms: AtomicU64::new(0),
        }
    }

    fn pong(&self) {
        let now = self.started.elapsed().as_millis() as u64;
        self.last_pong_ms.store(now, Ordering::Relaxed);
    }

    fn since_pong(&self) -> Duration {
        let now = self.started.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_pong_ms.load(Ordering::Relaxed)))
    }

    fn lapsed(&self) -> bool {
        self.since_pong() > PONG_TIMEOUT
    }
}

fn reject(status: StatusCode, message: String) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

/// WebSocket upgrade handler. The handshake is validated before anything is
/// registered; a refused handshake never upgrades.
pub async fn ws_handler(
    State(state): State<AppState>,
    params: Result<Query<HandshakeParams>, QueryRejection>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let params = match params {
        Ok(Query(params)) => params,
        Err(e) => return reject(StatusCode::BAD_REQUEST, e.body_text()),
    };
    let (key, role) = match params.validate() {
        Ok(v) => v,
        Err(e) => {
            info!(error_kind = e.error_kind(), error = %e, "handshake refused");
            let status = StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::BAD_REQUEST);
            return reject(status, e.to_string());
        }
    };
    let ws = match ws {
        Ok(ws) => ws,
        Err(e) => return e.into_response(),
    };

    ws.on_upgrade(move |socket| handle_socket(socket, key, role, state))
}

async fn handle_socket(socket: WebSocket, key: SessionKey, role: Role, state: AppState) {
    let (conn, rx) = ConnectionHandle::channel(key, role, state.max_send_queue);
    let span = tracing::info_span!(
        "ws",
        session_key = %conn.key(),
        connection_id = %conn.id(),
        role = %role,
    );

    async move {
        info!("client connected");
        state.registry.bind(conn.clone());
        run_connection(socket, conn.clone(), rx, Arc::clone(&state.registry)).await;
        state.registry.unbind(&conn);
        info!("client disconnected");
    }
    .instrument(span)
    .await;
}

/// Drive one bound connection until the peer goes away, the heartbeat
/// lapses, or the registry force-closes it.
async fn run_connection(
    socket: WebSocket,
    conn: ConnectionHandle,
    mut rx: mpsc::Receiver<Arc<str>>,
    registry: Arc<SessionRegistry>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let heartbeat = Arc::new(Heartbeat::new());

    let writer_conn = conn.clone();
    let writer_heartbeat = Arc::clone(&heartbeat);
    let mut writer = tokio::spawn(
        async move {
            let mut ping_interval = tokio::time::interval(HEARTBEAT_INTERVAL);
            ping_interval.tick().await;

            loop {
                tokio::select! {
                    () = writer_conn.closed() => {
                        debug!("close requested");
                        let _ = ws_tx.send(WsMessage::Close(None)).await;
                        break;
                    }
                    frame = rx.recv() => {
                        let Some(frame) = frame else { break };
                        if ws_tx.send(WsMessage::Text(frame.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    _ = ping_interval.tick() => {
                        if writer_heartbeat.lapsed() {
                            let since_pong_ms = writer_heartbeat.since_pong().as_millis() as u64;
                            warn!(since_pong_ms, "heartbeat lapsed, closing");
                            let _ = ws_tx.send(WsMessage::Close(None)).await;
                            break;
                        }
                        if ws_tx.send(WsMessage::Ping(vec![].into())).await.is_err() {
                            break;
                        }
                        tracing::trace!("sent ping");
                    }
                }
            }
        }
        .in_current_span(),
    );

    let reader_conn = conn;
    let mut reader = tokio::spawn(
        async move {
            while let Some(msg) = ws_rx.next().await {
                match msg {
                    Ok(WsMessage::Text(text)) => handle_text(&registry, &reader_conn, text.as_str()),
                    Ok(WsMessage::Pong(_)) => heartbeat.pong(),
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!(error = %e, "socket read failed");
                        break;
                    }
                }
            }
        }
        .in_current_span(),
    );

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }
}

/// Decode one text frame from a client and act on it.
fn handle_text(registry: &SessionRegistry, conn: &ConnectionHandle, text: &str) {
    if !conn.role().is_controller() {
        debug!(len = text.len(), "ignoring frame from overlay");
        return;
    }

    match PresentationEvent::from_wire(text) {
        Ok(event) => {
            let _ = registry.relay(conn.key(), conn.id(), &event);
        }
        Err(e) => {
            warn!(error_kind = e.error_kind(), error = %e, "rejected controller frame");
            let message = e.to_string();
            let frame = ServerFrame::Error(ErrorPayload { message: &message });
            match frame.encode() {
                Ok(json) => {
                    let _ = conn.send(Arc::from(json));
                }
                Err(e) => warn!(error = %e, "failed to encode error frame"),
            }
        }
    }
}
