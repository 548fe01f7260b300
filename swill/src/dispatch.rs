//! The handler registry and per-connection frame router.
//!
//! [`Dispatcher`] is immutable after [`DispatcherBuilder::build`] and shared
//! read-only across connections behind an `Arc`, the same pattern as
//! assembling a routing table once and sharing it across requests.
//! [`ConnectionRuntime`] is the per-connection, single-task-owned state: the
//! live-call map and the `JoinSet` of in-flight handler tasks.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use swill_core::{EncapsulatedResponse, RawMessagePack, RequestType, SwillStatus, decode_request, encode_payload};

use crate::call::{Call, CallKey, CallKind};
use crate::connection::Connection;
use crate::error::CloseConnection;
use crate::handler::{HandlerDescriptor, Invocation};
use crate::hooks::Hooks;
use crate::response::Response;

/// The immutable, shareable handler registry and hook set.
pub struct Dispatcher {
    handlers: HashMap<String, HandlerDescriptor>,
    hooks: Hooks,
}

impl Dispatcher {
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::default()
    }

    pub fn handler(&self, rpc: &str) -> Option<&HandlerDescriptor> {
        self.handlers.get(rpc)
    }

    pub fn handlers(&self) -> impl Iterator<Item = &HandlerDescriptor> {
        self.handlers.values()
    }

    pub fn hooks(&self) -> &Hooks {
        &self.hooks
    }
}

#[derive(Default)]
pub struct DispatcherBuilder {
    handlers: HashMap<String, HandlerDescriptor>,
    hooks: Hooks,
}

impl DispatcherBuilder {
    pub fn register(mut self, descriptor: HandlerDescriptor) -> Self {
        self.handlers.insert(descriptor.name.clone(), descriptor);
        self
    }

    pub fn before_connection(
        mut self,
        hook: impl Fn(&Connection) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    ) -> Self {
        self.hooks.before_connection.push(Arc::new(hook));
        self
    }

    pub fn after_accept(
        mut self,
        hook: impl Fn(&Connection) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    ) -> Self {
        self.hooks.after_accept.push(Arc::new(hook));
        self
    }

    pub fn before_request(
        mut self,
        hook: impl Fn(&Call) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    ) -> Self {
        self.hooks.before_request.push(Arc::new(hook));
        self
    }

    pub fn after_request(
        mut self,
        hook: impl Fn(&Call) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    ) -> Self {
        self.hooks.after_request.push(Arc::new(hook));
        self
    }

    pub fn after_connection(
        mut self,
        hook: impl Fn(&Connection) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    ) -> Self {
        self.hooks.after_connection.push(Arc::new(hook));
        self
    }

    pub fn build(self) -> Arc<Dispatcher> {
        Arc::new(Dispatcher { handlers: self.handlers, hooks: self.hooks })
    }
}

/// One live call's bookkeeping in the connection's map: its identity plus the
/// channel feeding it raw inbound frames.
struct LiveCall {
    call: Arc<Call>,
    raw_tx: mpsc::UnboundedSender<(RequestType, RawMessagePack)>,
}

/// Per-connection dispatch state. Owned by exactly one task (the connection
/// loop): the live-call map is never shared or locked (§4.4, §9).
pub struct ConnectionRuntime {
    dispatcher: Arc<Dispatcher>,
    connection: Arc<Connection>,
    live: HashMap<CallKey, LiveCall>,
    tasks: JoinSet<(CallKey, Option<CloseConnection>)>,
}

impl ConnectionRuntime {
    pub fn new(dispatcher: Arc<Dispatcher>, connection: Arc<Connection>) -> Self {
        Self { dispatcher, connection, live: HashMap::new(), tasks: JoinSet::new() }
    }

    pub fn live_call_count(&self) -> usize {
        self.live.len()
    }

    /// Routes one decoded inbound WebSocket message.
    ///
    /// A malformed envelope whose `seq` parsed successfully is attributable
    /// to a call, so it gets an `ERROR(INTERNAL_ERROR)` frame for that `seq`
    /// rather than tearing down the whole connection; only an envelope
    /// malformed before `seq` itself can be decoded closes the connection,
    /// since there is nowhere to address the error (§4.6).
    pub async fn handle_message(&mut self, bytes: &[u8]) -> Result<(), CloseConnection> {
        let frame = match decode_request(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e.error, seq = ?e.seq, "malformed envelope");
                return match e.seq {
                    Some(seq) => {
                        self.send_internal_error(seq, &e.error.to_string()).await;
                        Ok(())
                    }
                    None => Err(CloseConnection::new(1002, "malformed envelope")),
                };
            }
        };
        let key: CallKey = (frame.rpc.clone(), frame.seq);

        if let Some(live) = self.live.get(&key) {
            if live.raw_tx.send((frame.kind, frame.data)).is_err() {
                tracing::debug!(rpc = %frame.rpc, seq = frame.seq, "frame for a call whose handler task already finished");
            }
            return Ok(());
        }

        if matches!(frame.kind, RequestType::Cancel | RequestType::EndOfStream) {
            tracing::warn!(rpc = %frame.rpc, seq = frame.seq, "frame for unknown call, dropped");
            return Ok(());
        }

        let Some(descriptor) = self.dispatcher.handler(&frame.rpc) else {
            self.send_not_found(frame.seq, &frame.rpc).await;
            return Ok(());
        };

        let call = Arc::new(Call::new(frame.rpc.clone(), frame.seq, descriptor.kind, frame.metadata.clone()));
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let _ = raw_tx.send((frame.kind, frame.data));
        self.live.insert(key.clone(), LiveCall { call: call.clone(), raw_tx });

        let invocation = Invocation {
            call,
            connection: self.connection.clone(),
            response: Response::for_call(frame.seq, self.connection.send_queue_sender()),
            raw_rx,
            hooks: Arc::new(self.dispatcher.hooks().clone()),
        };
        let future = descriptor.invoke(invocation);
        self.tasks.spawn(async move {
            let close = future.await;
            (key, close)
        });
        Ok(())
    }

    async fn send_not_found(&self, seq: u64, rpc: &str) {
        let status = SwillStatus::not_found(format!("no handler registered for rpc {rpc:?}"));
        let message = status.into_error_message();
        let data = encode_payload(&message).unwrap_or_else(|_| RawMessagePack::null());
        let bytes = swill_core::encode_response(&EncapsulatedResponse::error(seq, data));
        if let Err(e) = self.connection.enqueue(bytes).await {
            tracing::warn!(error = %e, "failed to enqueue NOT_FOUND response");
        }
    }

    async fn send_internal_error(&self, seq: u64, message: &str) {
        let status = SwillStatus::internal(format!("malformed envelope: {message}"));
        let error_message = status.into_error_message();
        let data = encode_payload(&error_message).unwrap_or_else(|_| RawMessagePack::null());
        let bytes = swill_core::encode_response(&EncapsulatedResponse::error(seq, data));
        if let Err(e) = self.connection.enqueue(bytes).await {
            tracing::warn!(error = %e, "failed to enqueue INTERNAL_ERROR response");
        }
    }

    /// Awaits the next handler task to finish and removes its key from the
    /// live-call map. Returns `None` once there are no in-flight tasks; the
    /// second element of the pair is `Some` when that handler raised
    /// [`crate::error::RequestError::Close`], asking the caller to tear down
    /// the whole connection (§4.7, testable property 14).
    pub async fn join_next(&mut self) -> Option<(CallKey, Option<CloseConnection>)> {
        loop {
            let result = self.tasks.join_next().await?;
            match result {
                Ok((key, close)) => {
                    self.live.remove(&key);
                    return Some((key, close));
                }
                Err(e) => {
                    tracing::error!(error = %e, "handler task panicked");
                    continue;
                }
            }
        }
    }

    /// Cancels every in-flight call for `websocket.disconnect` (§5, testable
    /// property 12): every live call's token is cancelled and the live-call
    /// map is cleared within this one synchronous step.
    ///
    /// Handler tasks are deliberately not `abort`ed: aborting is preemptive
    /// and would tear a task down before it ever reaches an await point,
    /// which contradicts §5's "handlers MUST propagate cancellation
    /// cooperatively". Dropping each call's `raw_tx` (via `self.live.clear()`)
    /// closes its inbound frame channel, so a handler built on the provided
    /// request machinery (`StreamRequest`/`run_stream_out`) observes
    /// cancellation and unwinds on its own at the next yield boundary; the
    /// task is then reaped normally through `join_next`.
    pub fn disconnect_all(&mut self) {
        for live in self.live.values() {
            live.call.cancel();
        }
        self.live.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{HandshakeRequest, HandshakeResponse};
    use crate::handler::unary_unary;
    use serde::{Deserialize, Serialize};
    use swill_core::{Validate, encode_request};

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Num(i64);
    impl Validate for Num {}
    impl crate::shape::DescribeType for Num {}

    fn runtime() -> (ConnectionRuntime, tokio::sync::mpsc::Receiver<Vec<u8>>) {
        let dispatcher = Dispatcher::builder()
            .register(unary_unary("double", |_call, req: Num, _resp: &mut Response| async move {
                Ok::<_, crate::error::RequestError>(Num(req.0 * 2))
            }))
            .build();
        let (connection, rx) = Connection::new(
            "swill/1",
            HandshakeRequest {
                method: http::Method::GET,
                uri: "/ws".parse().unwrap(),
                headers: http::HeaderMap::new(),
                offered_subprotocols: vec!["swill/1".to_string()],
                peer_addr: None,
            },
            HandshakeResponse::default(),
            16,
        );
        (ConnectionRuntime::new(dispatcher, Arc::new(connection)), rx)
    }

    fn message_frame(rpc: &str, seq: u64, value: i64) -> Vec<u8> {
        encode_request(&swill_core::EncapsulatedRequest {
            seq,
            data: encode_payload(&Num(value)).unwrap(),
            rpc: rpc.to_string(),
            kind: RequestType::Message,
            metadata: None,
        })
    }

    #[tokio::test]
    async fn unknown_rpc_yields_not_found() {
        let (mut runtime, mut rx) = runtime();
        runtime.handle_message(&message_frame("missing", 1, 1)).await.unwrap();
        let bytes = rx.recv().await.unwrap();
        let response = swill_core::decode_response(&bytes).unwrap();
        assert_eq!(response.kind, swill_core::ResponseType::Error);
        assert_eq!(response.seq, 1);
    }

    #[tokio::test]
    async fn registered_rpc_creates_a_live_call_until_it_completes() {
        let (mut runtime, mut rx) = runtime();
        runtime.handle_message(&message_frame("double", 1, 21)).await.unwrap();
        assert_eq!(runtime.live_call_count(), 1);

        let (finished_key, close) = runtime.join_next().await.unwrap();
        assert_eq!(finished_key, ("double".to_string(), 1));
        assert!(close.is_none());
        assert_eq!(runtime.live_call_count(), 0);

        let bytes = rx.recv().await.unwrap();
        let response = swill_core::decode_response(&bytes).unwrap();
        let value: Num = swill_core::decode_payload(&response.data).unwrap();
        assert_eq!(value, Num(42));
    }

    #[tokio::test]
    async fn malformed_envelope_closes_the_connection() {
        let (mut runtime, _rx) = runtime();
        let err = runtime.handle_message(&[0xff, 0xff]).await.unwrap_err();
        assert_eq!(err.code, 1002);
    }

    #[tokio::test]
    async fn malformed_envelope_with_a_parsed_seq_gets_a_per_call_error_instead_of_closing() {
        let (mut runtime, mut rx) = runtime();

        // [seq=9, data=nil, rpc=<a uint, not a string>] — seq parses, the rest
        // doesn't, so this must surface an ERROR(seq=9) and keep running.
        let buf = [0x93, 0x09, 0xc0, 0x7b];

        runtime.handle_message(&buf).await.unwrap();

        let bytes = rx.recv().await.expect("an error frame for seq 9");
        let response = swill_core::decode_response(&bytes).unwrap();
        assert_eq!(response.kind, swill_core::ResponseType::Error);
        assert_eq!(response.seq, 9);
        assert_eq!(runtime.live_call_count(), 0);
    }
}
