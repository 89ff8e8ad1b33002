//! Websocket endpoint streaming open intel deliveries.
//!
//! `GET /ws?token=<jwt>` (or `Authorization: Bearer <jwt>`). Invalid tokens
//! are rejected with 401 before the upgrade. Once connected:
//! - text frames are handled by the connection's [`Connection`]
//! - a ping goes out every [`PING_INTERVAL`]
//! - token expiry closes the socket with 4001, a missing permission with 4003
//!   and a fatal failure with 1011; other errors are replied as `error` messages

pub mod connection;
pub mod protocol;

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mds_auth::{Principal, TokenValidator};
use mds_core::{Error, ErrorKind, Result};

use crate::controller::Controller;
use crate::errors::json_error;
use crate::store::NotifierStore;

pub use connection::{Connection, Peer};
pub use protocol::{ClientMessage, ServerMessage};

pub const PING_INTERVAL: Duration = Duration::from_secs(30);

pub const CLOSE_UNAUTHENTICATED: u16 = 4001;
pub const CLOSE_FORBIDDEN: u16 = 4003;
pub const CLOSE_INTERNAL: u16 = 1011;
const CLOSE_GOING_AWAY: u16 = 1001;

/// Frames queued for the writer task per connection.
const OUTBOUND_BUFFER: usize = 64;

pub struct WsState<D> {
    pub controller: Arc<Controller<D>>,
    pub tokens: Arc<dyn TokenValidator>,
    /// Cancelled on service shutdown; parent of every connection lifetime.
    pub shutdown: CancellationToken,
}

impl<D> Clone for WsState<D> {
    fn clone(&self) -> Self {
        Self {
            controller: self.controller.clone(),
            tokens: self.tokens.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

pub fn router<D: NotifierStore>(state: WsState<D>) -> Router {
    Router::new().route("/ws", get(ws_handler::<D>)).with_state(state)
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

async fn ws_handler<D: NotifierStore>(
    State(state): State<WsState<D>>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let token = match query.token.as_deref().or_else(|| bearer(&headers)) {
        Some(token) => token,
        None => return json_error(StatusCode::UNAUTHORIZED, "unauthorized", "missing token"),
    };
    let principal = match state.tokens.validate(token, Utc::now()) {
        Ok(principal) => principal,
        Err(err) => return json_error(StatusCode::UNAUTHORIZED, "unauthorized", err.to_string()),
    };
    ws.on_upgrade(move |socket| serve_socket(socket, state, principal))
        .into_response()
}

/// Peer backed by the writer task's queue.
struct QueuePeer {
    out: mpsc::Sender<Message>,
}

#[async_trait]
impl Peer for QueuePeer {
    async fn send(&self, message: ServerMessage) -> Result<()> {
        let text = message.to_json()?;
        self.out
            .send(Message::Text(text))
            .await
            .map_err(|_| Error::internal("websocket closed"))
    }
}

fn close_frame(code: u16, reason: impl Into<Cow<'static, str>>) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }))
}

/// Close code for errors that end the connection.
fn close_code(kind: ErrorKind) -> Option<u16> {
    match kind {
        ErrorKind::Unauthorized => Some(CLOSE_UNAUTHENTICATED),
        ErrorKind::Forbidden => Some(CLOSE_FORBIDDEN),
        ErrorKind::Fatal => Some(CLOSE_INTERNAL),
        _ => None,
    }
}

async fn serve_socket<D: NotifierStore>(socket: WebSocket, state: WsState<D>, principal: Principal) {
    let user = principal.user_id;
    let expires_in = (principal.expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    info!(%user, "websocket connected");

    let (mut sink, mut stream) = socket.split();
    let (out, mut queued) = mpsc::channel::<Message>(OUTBOUND_BUFFER);

    let writer = tokio::spawn(async move {
        let mut ping = interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);
        loop {
            tokio::select! {
                next = queued.recv() => {
                    let Some(message) = next else { break };
                    let closing = matches!(message, Message::Close(_));
                    if sink.send(message).await.is_err() || closing {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if sink.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let lifetime = state.shutdown.child_token();
    let connection = Connection::new(
        state.controller.clone(),
        Arc::new(QueuePeer { out: out.clone() }),
        principal,
        lifetime.clone(),
    );

    let expiry = tokio::time::sleep(expires_in);
    tokio::pin!(expiry);

    let close = loop {
        tokio::select! {
            biased;
            _ = lifetime.cancelled() => break Some(close_frame(CLOSE_GOING_AWAY, "shutting down")),
            _ = &mut expiry => break Some(close_frame(CLOSE_UNAUTHENTICATED, "token expired")),
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Err(err) = connection.handle_message(&text).await {
                        debug!(%user, error = %err, "websocket request failed");
                        if connection.reply_error(&err).await.is_err() {
                            break None;
                        }
                        if let Some(code) = close_code(err.kind()) {
                            break Some(close_frame(code, err.message().to_string()));
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break None,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(%user, error = %err, "websocket receive failed");
                    break None;
                }
            },
        }
    };

    connection.teardown().await;
    if let Some(frame) = close {
        let _ = out.send(frame).await;
    }
    drop(out);
    drop(connection);
    if let Err(err) = writer.await {
        warn!(%user, error = %err, "websocket writer ended abnormally");
    }
    info!(%user, "websocket disconnected");
}
