//! Typed handler registration.
//!
//! Four constructors, one per call shape, capture streaming flags from their
//! generics at registration time — never via runtime reflection on the
//! handler's parameter list (§4.6, §9). Each constructor also accepts a
//! handler of either arity-1 (`Fn(Arc<Call>, Req)`) or arity-2
//! (`Fn(Arc<Call>, Req, &mut Response)`); see [`HandlerFn`].

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;

use swill_core::{EncapsulatedResponse, RawMessagePack, RequestType, SwillMessage, decode_payload, encode_payload};

use crate::call::{Call, CallKind};
use crate::connection::Connection;
use crate::error::{CloseConnection, RequestError};
use crate::hooks::Hooks;
use crate::request::{StreamSink, UnaryRequest, stream_channel};
use crate::response::Response;
use crate::shape::{DescribeType, TypeDescriptor};

/// Everything a spawned handler task needs: its call identity, the
/// connection to send on, a fresh response, the raw inbound frame feed, and
/// the dispatcher's hook lists.
pub struct Invocation {
    pub call: Arc<Call>,
    pub connection: Arc<Connection>,
    pub response: Response,
    pub raw_rx: mpsc::UnboundedReceiver<(RequestType, RawMessagePack)>,
    pub hooks: Arc<Hooks>,
}

/// A handler task's outcome once it has fully unwound: `Some` when the
/// handler (or its frame feeder) raised [`RequestError::Close`], asking the
/// connection loop to tear down the whole socket rather than just this call
/// (§4.7, testable property 14).
type RunFn = Arc<dyn Fn(Invocation) -> BoxFuture<'static, Option<CloseConnection>> + Send + Sync>;

/// A registered RPC: its call shape plus the type-erased task body that
/// drives one invocation end to end.
#[derive(Clone)]
pub struct HandlerDescriptor {
    pub name: String,
    pub kind: CallKind,
    pub request_type: TypeDescriptor,
    pub response_type: TypeDescriptor,
    run: RunFn,
}

impl HandlerDescriptor {
    /// Spawns this handler's task body against one invocation. Resolves to
    /// `Some(close)` when the connection should be torn down afterward.
    pub fn invoke(&self, invocation: Invocation) -> BoxFuture<'static, Option<CloseConnection>> {
        (self.run)(invocation)
    }
}

async fn send_frame(connection: &Connection, frame: EncapsulatedResponse) {
    let bytes = swill_core::encode_response(&frame);
    if let Err(e) = connection.enqueue(bytes).await {
        tracing::warn!(error = %e, "failed to enqueue outbound frame: connection closed");
    }
}

async fn emit_error(connection: &Connection, call: &Call, err: RequestError) {
    if let Some(status) = err.into_status() {
        tracing::warn!(rpc = %call.rpc, seq = call.seq, code = status.code.as_i32(), message = %status.message, "call failed");
        let message = status.into_error_message();
        let data = encode_payload(&message).unwrap_or_else(|_| RawMessagePack::null());
        send_frame(connection, EncapsulatedResponse::error(call.seq, data)).await;
    }
}

async fn recv_opening_frame(
    raw_rx: &mut mpsc::UnboundedReceiver<(RequestType, RawMessagePack)>,
) -> (RequestType, RawMessagePack) {
    raw_rx
        .recv()
        .await
        .expect("the dispatcher feeds the opening frame before spawning a handler task")
}

/// Keeps draining frames for a unary-in call after its single MESSAGE has
/// already been decoded, so a later CANCEL is still observed. Every frame
/// seen here is by definition not the opening frame, so each one fires
/// `before_request_data` (§4.6).
fn spawn_cancel_watcher(
    mut raw_rx: mpsc::UnboundedReceiver<(RequestType, RawMessagePack)>,
    call: Arc<Call>,
    hooks: Arc<Hooks>,
) {
    tokio::spawn(async move {
        while let Some((kind, _raw)) = raw_rx.recv().await {
            Hooks::run_call(&hooks.before_request_data, &call).await;
            if kind == RequestType::Cancel {
                call.cancel();
            } else {
                tracing::warn!(rpc = %call.rpc, seq = call.seq, ?kind, "unexpected frame for an in-flight unary-in call");
            }
        }
    });
}

/// Drains raw inbound frames into a streaming request's sink until
/// END_OF_STREAM, CANCEL, or the channel closes. Fires `before_request_data`
/// for every frame after the opening one and `before_request_message` for
/// every decoded MESSAGE (§4.5, §4.6).
async fn feed_stream_in<Req: SwillMessage>(
    mut raw_rx: mpsc::UnboundedReceiver<(RequestType, RawMessagePack)>,
    mut sink: StreamSink<Req>,
    call: Arc<Call>,
    hooks: Arc<Hooks>,
) -> Result<(), RequestError> {
    let mut opening = true;
    while let Some((kind, raw)) = raw_rx.recv().await {
        if !opening {
            Hooks::run_call(&hooks.before_request_data, &call).await;
        }
        match kind {
            RequestType::Message => {
                let value = decode_payload::<Req>(&raw)?;
                Hooks::run_call(&hooks.before_request_message, &call).await;
                sink.push(value);
            }
            RequestType::EndOfStream => {
                sink.close();
                return Ok(());
            }
            RequestType::Cancel => {
                sink.cancel();
                return Ok(());
            }
            RequestType::Metadata if !opening => {
                return Err(RequestError::Protocol(
                    "metadata frame only allowed as the opening frame of a streaming request".into(),
                ));
            }
            RequestType::Metadata => {}
        }
        opening = false;
    }
    Ok(())
}

/// Marker selecting the arity-1 blanket impl of [`HandlerFn`]: the handler
/// closure takes only `(call, input)` and never touches [`Response`].
#[derive(Debug)]
pub struct Arity1;

/// Marker selecting the arity-2 blanket impl of [`HandlerFn`]: the handler
/// closure takes `(call, input, &mut Response)`.
#[derive(Debug)]
pub struct Arity2;

/// Adapts a registered handler closure of either arity to one calling
/// convention, using an extractor-tuple type parameter to pick between
/// blanket impls for differently-shaped closures.
/// `Marker` carries no data; it only selects which impl below applies, so a
/// handler written as `Fn(Arc<Call>, Req)` and one written as
/// `Fn(Arc<Call>, Req, &mut Response)` can both be passed to the same
/// constructor.
pub trait HandlerFn<In, Out, Fut, Marker>: Send + Sync + 'static
where
    Fut: Future<Output = Out> + Send + 'static,
{
    fn call(&self, call: Arc<Call>, input: In, response: &mut Response) -> Fut;
}

impl<F, In, Out, Fut> HandlerFn<In, Out, Fut, Arity1> for F
where
    F: Fn(Arc<Call>, In) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Out> + Send + 'static,
{
    fn call(&self, call: Arc<Call>, input: In, _response: &mut Response) -> Fut {
        self(call, input)
    }
}

impl<F, In, Out, Fut> HandlerFn<In, Out, Fut, Arity2> for F
where
    F: Fn(Arc<Call>, In, &mut Response) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Out> + Send + 'static,
{
    fn call(&self, call: Arc<Call>, input: In, response: &mut Response) -> Fut {
        self(call, input, response)
    }
}

/// Attaches leading metadata to `frame` if any is pending, firing
/// `before_leading_metadata` at the moment it is consumed (§4.6).
async fn attach_leading_metadata(
    response: &mut Response,
    frame: &mut EncapsulatedResponse,
    call: &Call,
    hooks: &Hooks,
) {
    if let Some(metadata) = response.consume_leading_metadata() {
        Hooks::run_metadata(&hooks.before_leading_metadata, call, &metadata).await;
        frame.leading_metadata = Some(metadata);
    }
}

/// Attaches trailing metadata to `frame` if any was set, firing
/// `before_trailing_metadata` (§4.6). Only ever called on a terminal frame.
async fn attach_trailing_metadata(
    response: &mut Response,
    frame: &mut EncapsulatedResponse,
    call: &Call,
    hooks: &Hooks,
) {
    if let Some(metadata) = response.take_trailing_metadata() {
        Hooks::run_metadata(&hooks.before_trailing_metadata, call, &metadata).await;
        frame.trailing_metadata = Some(metadata);
    }
}

/// `request -> response`. `handler` may take `(call, request)` or
/// `(call, request, &mut Response)`; see [`HandlerFn`].
pub fn unary_unary<Req, Resp, F, Fut, Marker>(name: impl Into<String>, handler: F) -> HandlerDescriptor
where
    Req: SwillMessage + DescribeType,
    Resp: SwillMessage + DescribeType,
    F: HandlerFn<Req, Result<Resp, RequestError>, Fut, Marker>,
    Fut: Future<Output = Result<Resp, RequestError>> + Send + 'static,
    Marker: 'static,
{
    let request_type = Req::describe();
    let response_type = Resp::describe();
    let handler = Arc::new(handler);
    let run: RunFn = Arc::new(move |invocation: Invocation| {
        let handler = handler.clone();
        Box::pin(async move {
            let Invocation { call, connection, mut response, mut raw_rx, hooks } = invocation;
            Hooks::run_call(&hooks.before_request, &call).await;

            let (kind, raw) = recv_opening_frame(&mut raw_rx).await;
            let mut unary_req = UnaryRequest::<Req>::new();
            let decoded = unary_req.process_frame(kind, &raw);
            spawn_cancel_watcher(raw_rx, call.clone(), hooks.clone());

            let outcome: Result<Resp, RequestError> = async {
                decoded?;
                Hooks::run_call(&hooks.before_request_message, &call).await;
                let request = unary_req.into_inner()?;
                handler.call(call.clone(), request, &mut response).await
            }
            .await;

            let close = match outcome {
                Ok(_) if call.cancelled() => {
                    tracing::debug!(rpc = %call.rpc, seq = call.seq, "dropping response: call cancelled");
                    None
                }
                Ok(value) => {
                    Hooks::run_call(&hooks.before_response_message, &call).await;
                    match encode_payload(&value) {
                        Ok(data) => {
                            let mut frame = EncapsulatedResponse::message(call.seq, data);
                            attach_leading_metadata(&mut response, &mut frame, &call, &hooks).await;
                            attach_trailing_metadata(&mut response, &mut frame, &call, &hooks).await;
                            send_frame(&connection, frame).await;
                            None
                        }
                        Err(e) => {
                            emit_error(&connection, &call, RequestError::Serialization(e)).await;
                            None
                        }
                    }
                }
                Err(RequestError::Cancelled) => None,
                Err(RequestError::Close(close)) => Some(close),
                Err(e) => {
                    emit_error(&connection, &call, e).await;
                    None
                }
            };
            Hooks::run_call(&hooks.after_request, &call).await;
            close
        })
    });
    HandlerDescriptor { name: name.into(), kind: CallKind::UnaryUnary, request_type, response_type, run }
}

/// `request -> stream of responses`. `handler` may take `(call, request)` or
/// `(call, request, &mut Response)`; see [`HandlerFn`].
pub fn unary_stream<Req, Resp, F, Fut, S, Marker>(name: impl Into<String>, handler: F) -> HandlerDescriptor
where
    Req: SwillMessage + DescribeType,
    Resp: SwillMessage + DescribeType,
    F: HandlerFn<Req, Result<S, RequestError>, Fut, Marker>,
    Fut: Future<Output = Result<S, RequestError>> + Send + 'static,
    S: Stream<Item = Resp> + Send + 'static,
    Marker: 'static,
{
    let request_type = Req::describe();
    let response_type = Resp::describe();
    let handler = Arc::new(handler);
    let run: RunFn = Arc::new(move |invocation: Invocation| {
        let handler = handler.clone();
        Box::pin(async move {
            let Invocation { call, connection, mut response, mut raw_rx, hooks } = invocation;
            Hooks::run_call(&hooks.before_request, &call).await;

            let (kind, raw) = recv_opening_frame(&mut raw_rx).await;
            let mut unary_req = UnaryRequest::<Req>::new();
            let decoded = unary_req.process_frame(kind, &raw);
            spawn_cancel_watcher(raw_rx, call.clone(), hooks.clone());

            let setup: Result<S, RequestError> = async {
                decoded?;
                Hooks::run_call(&hooks.before_request_message, &call).await;
                let request = unary_req.into_inner()?;
                handler.call(call.clone(), request, &mut response).await
            }
            .await;

            let close = match setup {
                Err(RequestError::Cancelled) => None,
                Err(RequestError::Close(close)) => Some(close),
                Err(e) => {
                    emit_error(&connection, &call, e).await;
                    None
                }
                Ok(stream) => run_stream_out(stream, &call, &connection, &mut response, &hooks, None).await,
            };
            Hooks::run_call(&hooks.after_request, &call).await;
            close
        })
    });
    HandlerDescriptor { name: name.into(), kind: CallKind::UnaryStream, request_type, response_type, run }
}

/// `stream of requests -> response`. `handler` may take `(call, request)` or
/// `(call, request, &mut Response)`; see [`HandlerFn`].
pub fn stream_unary<Req, Resp, F, Fut, Marker>(name: impl Into<String>, handler: F) -> HandlerDescriptor
where
    Req: SwillMessage + DescribeType,
    Resp: SwillMessage + DescribeType,
    F: HandlerFn<crate::request::StreamRequest<Req>, Result<Resp, RequestError>, Fut, Marker>,
    Fut: Future<Output = Result<Resp, RequestError>> + Send + 'static,
    Marker: 'static,
{
    let request_type = Req::describe();
    let response_type = Resp::describe();
    let handler = Arc::new(handler);
    let run: RunFn = Arc::new(move |invocation: Invocation| {
        let handler = handler.clone();
        Box::pin(async move {
            let Invocation { call, connection, mut response, raw_rx, hooks } = invocation;
            Hooks::run_call(&hooks.before_request, &call).await;

            let (sink, stream_request) = stream_channel::<Req>(call.cancellation_token());
            let feeder = tokio::spawn(feed_stream_in(raw_rx, sink, call.clone(), hooks.clone()));

            let outcome: Result<Resp, RequestError> = async {
                handler.call(call.clone(), stream_request, &mut response).await
            }
            .await;

            let close = match feeder.await {
                Ok(Err(RequestError::Close(close))) => Some(close),
                Ok(Err(feed_err)) => {
                    emit_error(&connection, &call, feed_err).await;
                    None
                }
                Ok(Ok(())) | Err(_) => match outcome {
                    Ok(_) if call.cancelled() => {
                        tracing::debug!(rpc = %call.rpc, seq = call.seq, "dropping response: call cancelled");
                        None
                    }
                    Ok(value) => {
                        Hooks::run_call(&hooks.before_response_message, &call).await;
                        match encode_payload(&value) {
                            Ok(data) => {
                                let mut frame = EncapsulatedResponse::message(call.seq, data);
                                attach_leading_metadata(&mut response, &mut frame, &call, &hooks).await;
                                attach_trailing_metadata(&mut response, &mut frame, &call, &hooks).await;
                                send_frame(&connection, frame).await;
                                None
                            }
                            Err(e) => {
                                emit_error(&connection, &call, RequestError::Serialization(e)).await;
                                None
                            }
                        }
                    }
                    Err(RequestError::Cancelled) => None,
                    Err(RequestError::Close(close)) => Some(close),
                    Err(e) => {
                        emit_error(&connection, &call, e).await;
                        None
                    }
                },
            };
            Hooks::run_call(&hooks.after_request, &call).await;
            close
        })
    });
    HandlerDescriptor { name: name.into(), kind: CallKind::StreamUnary, request_type, response_type, run }
}

/// `stream of requests -> stream of responses`. `handler` may take
/// `(call, request)` or `(call, request, &mut Response)`; see [`HandlerFn`].
pub fn stream_stream<Req, Resp, F, Fut, S, Marker>(name: impl Into<String>, handler: F) -> HandlerDescriptor
where
    Req: SwillMessage + DescribeType,
    Resp: SwillMessage + DescribeType,
    F: HandlerFn<crate::request::StreamRequest<Req>, Result<S, RequestError>, Fut, Marker>,
    Fut: Future<Output = Result<S, RequestError>> + Send + 'static,
    S: Stream<Item = Resp> + Send + 'static,
    Marker: 'static,
{
    let request_type = Req::describe();
    let response_type = Resp::describe();
    let handler = Arc::new(handler);
    let run: RunFn = Arc::new(move |invocation: Invocation| {
        let handler = handler.clone();
        Box::pin(async move {
            let Invocation { call, connection, mut response, raw_rx, hooks } = invocation;
            Hooks::run_call(&hooks.before_request, &call).await;

            let (sink, stream_request) = stream_channel::<Req>(call.cancellation_token());
            let feeder = tokio::spawn(feed_stream_in(raw_rx, sink, call.clone(), hooks.clone()));

            let setup: Result<S, RequestError> = async {
                handler.call(call.clone(), stream_request, &mut response).await
            }
            .await;

            let close = match setup {
                Err(RequestError::Cancelled) => join_feeder_after_close(feeder, &call).await,
                Err(RequestError::Close(close)) => {
                    let _ = feeder.await;
                    Some(close)
                }
                Err(e) => {
                    emit_error(&connection, &call, e).await;
                    join_feeder_after_close(feeder, &call).await
                }
                Ok(stream) => {
                    run_stream_out(stream, &call, &connection, &mut response, &hooks, Some(feeder)).await
                }
            };
            Hooks::run_call(&hooks.after_request, &call).await;
            close
        })
    });
    HandlerDescriptor { name: name.into(), kind: CallKind::StreamStream, request_type, response_type, run }
}

/// Awaits a stream-in feeder whose outcome arrives after the call already
/// has a terminal outcome of its own (cancelled, closed the connection, or
/// failed outright). Only a `Close` is still worth surfacing; an ordinary
/// feeder error has no live response stream left to attach it to, so it's
/// logged rather than re-emitted as a second ERROR frame for the same call.
async fn join_feeder_after_close(
    feeder: tokio::task::JoinHandle<Result<(), RequestError>>,
    call: &Call,
) -> Option<CloseConnection> {
    match feeder.await {
        Ok(Err(RequestError::Close(close))) => Some(close),
        Ok(Err(feed_err)) => {
            tracing::warn!(rpc = %call.rpc, seq = call.seq, error = %feed_err, "inbound stream feeder ended with an error after the call already had a terminal outcome");
            None
        }
        Ok(Ok(())) | Err(_) => None,
    }
}

/// Drains a response stream, racing each `next()` against the call's
/// cancellation token (§4.6, §9), emitting one MESSAGE frame per item and a
/// final END_OF_STREAM unless cancelled. When `feeder` is given (stream-in
/// shapes), it's awaited once the response stream ends so a feeder failure
/// can still suppress END_OF_STREAM and surface as ERROR instead (§4.5,
/// testable property 10).
async fn run_stream_out<Resp: SwillMessage, S: Stream<Item = Resp> + Send + 'static>(
    stream: S,
    call: &Arc<Call>,
    connection: &Connection,
    response: &mut Response,
    hooks: &Hooks,
    feeder: Option<tokio::task::JoinHandle<Result<(), RequestError>>>,
) -> Option<CloseConnection> {
    tokio::pin!(stream);
    let token = call.cancellation_token();
    loop {
        let item = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            item = stream.next() => item,
        };
        let Some(value) = item else { break };
        Hooks::run_call(&hooks.before_response_message, call).await;
        match encode_payload(&value) {
            Ok(data) => {
                let mut frame = EncapsulatedResponse::message(call.seq, data);
                attach_leading_metadata(response, &mut frame, call, hooks).await;
                send_frame(connection, frame).await;
            }
            Err(e) => {
                emit_error(connection, call, RequestError::Serialization(e)).await;
                if let Some(feeder) = feeder {
                    let _ = feeder.await;
                }
                return None;
            }
        }
    }

    let feed_outcome = match feeder {
        Some(feeder) => feeder.await.unwrap_or(Ok(())),
        None => Ok(()),
    };
    // A feeder's own request to close the connection always wins, even over
    // this call's cancellation: it's a connection-level directive, not a
    // per-call one.
    let feed_outcome = match feed_outcome {
        Err(RequestError::Close(close)) => return Some(close),
        other => other,
    };

    if call.cancelled() {
        tracing::debug!(rpc = %call.rpc, seq = call.seq, "stream-out terminated by cancellation, no END_OF_STREAM sent");
        return None;
    }

    match feed_outcome {
        Ok(()) => {
            let mut frame = EncapsulatedResponse::end_of_stream(call.seq);
            attach_leading_metadata(response, &mut frame, call, hooks).await;
            attach_trailing_metadata(response, &mut frame, call, hooks).await;
            send_frame(connection, frame).await;
            None
        }
        Err(feed_err) => {
            emit_error(connection, call, feed_err).await;
            None
        }
    }
}
