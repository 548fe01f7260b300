//! Per-WebSocket connection state: identity, the handshake snapshot, and the
//! bounded outbound send queue.

use http::{HeaderMap, Method, Uri};
use tokio::sync::mpsc;
use uuid::Uuid;

/// A snapshot of the inbound handshake request, captured once and never
/// mutated afterward.
#[derive(Clone, Debug)]
pub struct HandshakeRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub offered_subprotocols: Vec<String>,
    pub peer_addr: Option<std::net::SocketAddr>,
}

/// A snapshot of the outbound handshake response, mutable only up to the
/// point the upgrade completes.
#[derive(Clone, Debug, Default)]
pub struct HandshakeResponse {
    pub status: u16,
    pub headers: HeaderMap,
}

/// One accepted WebSocket connection.
///
/// Owns the outbound send queue (a bounded channel: the backpressure
/// primitive referenced throughout §5) and the handshake snapshots. The
/// live-call map is owned by the connection loop/dispatcher task directly,
/// not by this struct, to keep it single-writer without an interior mutex
/// (§9: "never a shared concurrent map").
pub struct Connection {
    id: Uuid,
    subprotocol: String,
    request: HandshakeRequest,
    response: HandshakeResponse,
    send_tx: mpsc::Sender<Vec<u8>>,
}

impl Connection {
    pub fn new(
        subprotocol: impl Into<String>,
        request: HandshakeRequest,
        response: HandshakeResponse,
        send_queue_capacity: usize,
    ) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (send_tx, send_rx) = mpsc::channel(send_queue_capacity);
        (
            Self {
                id: Uuid::new_v4(),
                subprotocol: subprotocol.into(),
                request,
                response,
                send_tx,
            },
            send_rx,
        )
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn subprotocol(&self) -> &str {
        &self.subprotocol
    }

    pub fn request(&self) -> &HandshakeRequest {
        &self.request
    }

    pub fn response(&self) -> &HandshakeResponse {
        &self.response
    }

    /// Enqueues one already-encoded outbound frame. Suspends the caller if
    /// the bounded queue is full: this is the connection's backpressure
    /// point.
    pub async fn enqueue(&self, bytes: Vec<u8>) -> Result<(), mpsc::error::SendError<Vec<u8>>> {
        self.send_tx.send(bytes).await
    }

    pub fn send_queue_sender(&self) -> mpsc::Sender<Vec<u8>> {
        self.send_tx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handshake() -> (HandshakeRequest, HandshakeResponse) {
        (
            HandshakeRequest {
                method: Method::GET,
                uri: "/ws".parse().unwrap(),
                headers: HeaderMap::new(),
                offered_subprotocols: vec!["swill/1".to_string()],
                peer_addr: None,
            },
            HandshakeResponse::default(),
        )
    }

    #[tokio::test]
    async fn enqueue_delivers_bytes_in_order() {
        let (req, resp) = handshake();
        let (connection, mut rx) = Connection::new("swill/1", req, resp, 4);
        connection.enqueue(vec![1]).await.unwrap();
        connection.enqueue(vec![2]).await.unwrap();
        assert_eq!(rx.recv().await, Some(vec![1]));
        assert_eq!(rx.recv().await, Some(vec![2]));
    }

    #[tokio::test]
    async fn each_connection_gets_a_fresh_id() {
        let (req1, resp1) = handshake();
        let (c1, _rx1) = Connection::new("swill/1", req1, resp1, 4);
        let (req2, resp2) = handshake();
        let (c2, _rx2) = Connection::new("swill/1", req2, resp2, 4);
        assert_ne!(c1.id(), c2.id());
    }
}
