//! axum WebSocket transport.
//!
//! The only module that touches `axum::extract::ws`: translates the upgrade
//! handshake and the socket's message stream into [`crate::connection::Connection`]
//! and [`crate::dispatch::ConnectionRuntime`], which stay axum-free so
//! `swill-testing` can drive them directly without a socket. Builds the
//! mounted [`Router`] (§6 Paths) and runs the per-connection loop (§4.7).

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response as AxumResponse};
use axum::routing::get;
use tokio::sync::mpsc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::connection::{Connection, HandshakeRequest, HandshakeResponse};
use crate::dispatch::{ConnectionRuntime, Dispatcher};
use crate::error::CloseConnection;
use crate::hooks::Hooks;

#[derive(Clone)]
struct AppState {
    dispatcher: Arc<Dispatcher>,
    config: Arc<ServerConfig>,
}

/// Builds a router exposing `dispatcher`'s RPCs at every path in `config`'s
/// mounts. Requests to other paths, or non-websocket requests to a mounted
/// path, fall through to axum's default 404 (§6 Paths).
pub fn router(dispatcher: Arc<Dispatcher>, config: ServerConfig) -> Router {
    let state = AppState { dispatcher, config: Arc::new(config) };
    let mut router = Router::new();
    for mount in state.config.mounts() {
        router = router.route(mount, get(upgrade));
    }
    router
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

fn offered_subprotocols(headers: &HeaderMap) -> Vec<String> {
    headers
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.split(',').map(|part| part.trim().to_string()).collect())
        .unwrap_or_default()
}

async fn upgrade(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    ws: WebSocketUpgrade,
) -> AxumResponse {
    let offered = offered_subprotocols(&headers);
    let subprotocol = state.config.subprotocol().to_string();
    if !offered.iter().any(|p| p == &subprotocol) {
        let close = CloseConnection::new(406, format!("{subprotocol:?} subprotocol required"));
        tracing::warn!(?offered, required = %subprotocol, "handshake rejected: subprotocol not offered");
        let status = StatusCode::from_u16(close.http_status()).unwrap_or(StatusCode::NOT_ACCEPTABLE);
        return (status, close.reason).into_response();
    }

    let handshake_request = HandshakeRequest {
        method,
        uri,
        headers: headers.clone(),
        offered_subprotocols: offered,
        peer_addr: connect_info.map(|ConnectInfo(addr)| addr),
    };

    ws.protocols([subprotocol]).on_upgrade(move |socket| async move {
        let (connection, send_rx) = Connection::new(
            state.config.subprotocol(),
            handshake_request,
            HandshakeResponse { status: 101, headers: HeaderMap::new() },
            state.config.send_queue_capacity(),
        );
        let connection = Arc::new(connection);
        let hooks = state.dispatcher.hooks();
        Hooks::run_connection(&hooks.before_connection, &connection).await;
        Hooks::run_connection(&hooks.after_accept, &connection).await;
        run_connection(state.dispatcher.clone(), state.config.clone(), connection, send_rx, socket).await;
    })
}

/// Drives one accepted connection until disconnect: receive -> dispatch,
/// send-queue -> socket, and the handler `JoinSet`, raced with
/// `tokio::select!` (§4.7, §5).
async fn run_connection(
    dispatcher: Arc<Dispatcher>,
    config: Arc<ServerConfig>,
    connection: Arc<Connection>,
    mut send_rx: mpsc::Receiver<Vec<u8>>,
    mut socket: WebSocket,
) {
    let mut runtime = ConnectionRuntime::new(dispatcher.clone(), connection.clone());

    let close = loop {
        tokio::select! {
            frame = socket.recv() => {
                match frame {
                    Some(Ok(WsMessage::Binary(bytes))) => {
                        if let Some(limit) = config.max_message_bytes() {
                            if bytes.len() > limit {
                                tracing::warn!(connection = %connection.id(), len = bytes.len(), limit, "message exceeds max_message_bytes, closing connection");
                                break Some(CloseConnection::new(1009, "message too large"));
                            }
                        }
                        if let Err(close) = runtime.handle_message(&bytes).await {
                            break Some(close);
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        tracing::debug!(connection = %connection.id(), "websocket disconnected");
                        runtime.disconnect_all();
                        break None;
                    }
                    Some(Ok(_)) => {
                        tracing::debug!(connection = %connection.id(), "ignoring non-binary websocket message");
                    }
                    Some(Err(e)) => {
                        tracing::warn!(connection = %connection.id(), error = %e, "websocket receive error");
                        runtime.disconnect_all();
                        break None;
                    }
                }
            }
            Some(bytes) = send_rx.recv() => {
                if let Err(e) = socket.send(WsMessage::Binary(bytes.into())).await {
                    tracing::warn!(connection = %connection.id(), error = %e, "websocket send failed");
                    runtime.disconnect_all();
                    break None;
                }
            }
            Some((_key, handler_close)) = runtime.join_next() => {
                if let Some(close) = handler_close {
                    break Some(close);
                }
            }
        }
    };

    if let Some(close) = close {
        let frame = CloseFrame { code: close.websocket_code(), reason: close.reason.clone().into() };
        let _ = socket.send(WsMessage::Close(Some(frame))).await;
        runtime.disconnect_all();
    }

    Hooks::run_connection(&dispatcher.hooks().after_connection, &connection).await;
}
