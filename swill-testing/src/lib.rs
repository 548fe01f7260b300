//! In-process test harness for Swill servers.
//!
//! Drives a [`ConnectionRuntime`] directly rather than opening a real
//! socket: there is no HTTP handshake, no axum, and no actual WebSocket —
//! `TestClient` feeds already-encoded frame bytes straight into the
//! dispatcher and reads encoded response bytes back off the connection's
//! send queue, the same two surfaces a real transport would drive.

use std::sync::Arc;
use std::time::Duration;

use swill::config::ServerConfig;
use swill::connection::{Connection, HandshakeRequest, HandshakeResponse};
use swill::dispatch::{ConnectionRuntime, Dispatcher};
use swill::error::CloseConnection;
use swill_core::{
    EncapsulatedRequest, EncapsulatedResponse, Metadata, RawMessagePack, RequestType,
    SwillMessage, decode_response, encode_payload, encode_request,
};
use tokio::sync::mpsc;

/// Drives a [`Dispatcher`] end to end without a socket: sends inbound frames
/// straight into its [`ConnectionRuntime`] and reads outbound frames off the
/// connection's send queue.
pub struct TestClient {
    runtime: ConnectionRuntime,
    connection: Arc<Connection>,
    send_rx: mpsc::Receiver<Vec<u8>>,
    next_seq: u64,
}

impl TestClient {
    /// Builds a client against `dispatcher` using [`ServerConfig::default`].
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self::with_config(dispatcher, &ServerConfig::default())
    }

    /// Builds a client against `dispatcher`, using `config` for the
    /// negotiated subprotocol and send-queue bound.
    pub fn with_config(dispatcher: Arc<Dispatcher>, config: &ServerConfig) -> Self {
        let (connection, send_rx) = Connection::new(
            config.subprotocol(),
            HandshakeRequest {
                method: http::Method::GET,
                uri: "/ws".parse().expect("static path parses"),
                headers: http::HeaderMap::new(),
                offered_subprotocols: vec![config.subprotocol().to_string()],
                peer_addr: None,
            },
            HandshakeResponse { status: 101, headers: http::HeaderMap::new() },
            config.send_queue_capacity(),
        );
        let connection = Arc::new(connection);
        let runtime = ConnectionRuntime::new(dispatcher, connection.clone());
        Self { runtime, connection, send_rx, next_seq: 1 }
    }

    /// Hands out the next unused client-chosen `seq`.
    ///
    /// Swill seqs only need to be unique while a call is live (§4.2); tests
    /// that don't care about a particular number can let the client pick.
    pub fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn live_call_count(&self) -> usize {
        self.runtime.live_call_count()
    }

    /// Sends one already-built inbound frame.
    pub async fn send_frame(&mut self, request: EncapsulatedRequest) -> Result<(), CloseConnection> {
        let bytes = encode_request(&request);
        self.runtime.handle_message(&bytes).await
    }

    /// Sends a MESSAGE frame carrying `value`, with no metadata.
    pub async fn send_message<T: SwillMessage>(
        &mut self,
        rpc: &str,
        seq: u64,
        value: &T,
    ) -> Result<(), CloseConnection> {
        self.send_message_with_metadata(rpc, seq, value, None).await
    }

    /// Sends a MESSAGE frame carrying `value` and optional metadata (only
    /// meaningful on the opening frame of a call, §3 Invariants).
    pub async fn send_message_with_metadata<T: SwillMessage>(
        &mut self,
        rpc: &str,
        seq: u64,
        value: &T,
        metadata: Option<Metadata>,
    ) -> Result<(), CloseConnection> {
        let data = encode_payload(value).expect("test payload encodes");
        self.send_frame(EncapsulatedRequest {
            seq,
            data,
            rpc: rpc.to_string(),
            kind: RequestType::Message,
            metadata,
        })
        .await
    }

    /// Sends a standalone METADATA frame (only valid as a stream-in call's
    /// opening frame, §4.5).
    pub async fn send_metadata(
        &mut self,
        rpc: &str,
        seq: u64,
        metadata: Metadata,
    ) -> Result<(), CloseConnection> {
        self.send_frame(EncapsulatedRequest {
            seq,
            data: RawMessagePack::null(),
            rpc: rpc.to_string(),
            kind: RequestType::Metadata,
            metadata: Some(metadata),
        })
        .await
    }

    pub async fn send_end_of_stream(&mut self, rpc: &str, seq: u64) -> Result<(), CloseConnection> {
        self.send_frame(EncapsulatedRequest {
            seq,
            data: RawMessagePack::null(),
            rpc: rpc.to_string(),
            kind: RequestType::EndOfStream,
            metadata: None,
        })
        .await
    }

    pub async fn send_cancel(&mut self, rpc: &str, seq: u64) -> Result<(), CloseConnection> {
        self.send_frame(EncapsulatedRequest {
            seq,
            data: RawMessagePack::null(),
            rpc: rpc.to_string(),
            kind: RequestType::Cancel,
            metadata: None,
        })
        .await
    }

    /// Awaits and decodes the next outbound frame. `None` once the send
    /// queue's sender side has been dropped (the connection is gone).
    pub async fn recv(&mut self) -> Option<EncapsulatedResponse> {
        let bytes = self.send_rx.recv().await?;
        Some(decode_response(&bytes).expect("server emits well-formed envelopes"))
    }

    /// Like [`TestClient::recv`], but gives up after `duration` instead of
    /// hanging forever when a scenario expects no further frames.
    pub async fn recv_timeout(&mut self, duration: Duration) -> Option<EncapsulatedResponse> {
        tokio::time::timeout(duration, self.recv()).await.unwrap_or(None)
    }

    /// Awaits the next handler task to finish, returning its `(rpc, seq)` key
    /// and, if that handler asked to close the connection, the reason why.
    pub async fn join_next(&mut self) -> Option<((String, u64), Option<CloseConnection>)> {
        self.runtime.join_next().await
    }

    /// Simulates a `websocket.disconnect` event: cancels every in-flight call
    /// (§5, testable property 12).
    pub fn disconnect(&mut self) {
        self.runtime.disconnect_all();
    }
}
