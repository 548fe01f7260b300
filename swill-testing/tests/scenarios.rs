//! Scenario tests for whole call lifecycles, driven through `TestClient`
//! instead of a real socket.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use std::time::Duration;

use async_stream::stream;
use serde::{Deserialize, Serialize};
use swill::dispatch::Dispatcher;
use swill::handler::{stream_stream, unary_unary};
use swill::response::Response;
use swill::shape::DescribeType;
use swill_core::{
    Code, ErrorMode, FieldErrorDescriptor, ResponseType, Validate, ValidationError,
};
use swill_testing::TestClient;

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
struct Num(i64);
impl Validate for Num {}
impl DescribeType for Num {}

/// A record with two independently-checked fields, used to exercise
/// `ErrorMode::ReturnAllErrors` aggregation.
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
struct Signup {
    age: i64,
    name: String,
}
impl DescribeType for Signup {}
impl Validate for Signup {
    fn validate(&self) -> Result<(), ValidationError> {
        let mut error = ValidationError::new();
        if self.age < 18 {
            error.push("age", FieldErrorDescriptor::Description("must be at least 18".into()));
        }
        if self.name.is_empty() {
            error.push("name", FieldErrorDescriptor::Description("must not be empty".into()));
        }
        if error.is_empty() { Ok(()) } else { Err(error) }
    }

    fn error_mode(&self) -> ErrorMode {
        ErrorMode::ReturnAllErrors
    }
}

/// Testable property 6: a record failing two fields under
/// `ReturnAllErrors` surfaces both field keys in one ERROR frame's data.
#[tokio::test]
async fn validation_failure_aggregates_both_fields() {
    let dispatcher = Dispatcher::builder()
        .register(unary_unary("signup", |_call, req: Signup, _resp: &mut Response| async move {
            Ok::<_, swill::error::RequestError>(req)
        }))
        .build();
    let mut client = TestClient::new(dispatcher);

    client.send_message("signup", 1, &Signup { age: 5, name: String::new() }).await.unwrap();
    let response = client.recv().await.expect("one error frame");
    assert_eq!(response.kind, ResponseType::Error);

    let message: swill_core::ErrorMessage = swill_core::decode_payload(&response.data).unwrap();
    assert_eq!(message.code, Code::ValidationError.as_i32());
    let data = message.data.expect("validation data attached");
    let fields = data.as_object().expect("object of field -> descriptors");
    assert!(fields.contains_key("age"));
    assert!(fields.contains_key("name"));
}

/// Testable property 8: a stream-in/stream-out echo produces one MESSAGE
/// per input followed by END_OF_STREAM carrying trailing metadata, and
/// fires lifecycle hooks in the documented order.
#[tokio::test]
async fn streaming_echo_lifecycle_runs_hooks_in_order() {
    let order: Arc<std::sync::Mutex<Vec<&'static str>>> = Arc::new(std::sync::Mutex::new(Vec::new()));

    let record = |label: &'static str, order: &Arc<std::sync::Mutex<Vec<&'static str>>>| {
        let order = order.clone();
        move |_call: &swill::call::Call| -> futures::future::BoxFuture<'static, ()> {
            let order = order.clone();
            Box::pin(async move { order.lock().unwrap().push(label) })
        }
    };

    let dispatcher = Dispatcher::builder()
        .before_request(record("before_request", &order))
        .after_request(record("after_request", &order))
        .register(stream_stream(
            "echo",
            |_call, req: swill::request::StreamRequest<Num>, response: &mut Response| async move {
                response.set_trailing_metadata(std::iter::once(("count".to_string(), rmpv::Value::from(2))).collect());
                let mut inbound = req.into_stream();
                Ok::<_, swill::error::RequestError>(stream! {
                    while let Some(Ok(item)) = futures::StreamExt::next(&mut inbound).await {
                        yield item;
                    }
                })
            },
        ))
        .build();
    let mut client = TestClient::new(dispatcher);

    client.send_message("echo", 1, &Num(1)).await.unwrap();
    client.send_message("echo", 1, &Num(2)).await.unwrap();
    client.send_end_of_stream("echo", 1).await.unwrap();

    let first = client.recv().await.expect("first echoed message");
    assert_eq!(first.kind, ResponseType::Message);
    let value: Num = swill_core::decode_payload(&first.data).unwrap();
    assert_eq!(value, Num(1));

    let second = client.recv().await.expect("second echoed message");
    let value: Num = swill_core::decode_payload(&second.data).unwrap();
    assert_eq!(value, Num(2));

    let eos = client.recv().await.expect("end of stream frame");
    assert_eq!(eos.kind, ResponseType::EndOfStream);
    assert!(eos.trailing_metadata.is_some());

    client.join_next().await;
    assert_eq!(*order.lock().unwrap(), vec!["before_request", "after_request"]);
}

/// Testable property 10: a METADATA frame arriving after a streaming
/// request's opening frame is a protocol violation that terminates only
/// the offending call.
#[tokio::test]
async fn late_metadata_frame_on_a_stream_terminates_only_that_call() {
    let dispatcher = Dispatcher::builder()
        .register(stream_stream(
            "echo",
            |_call, req: swill::request::StreamRequest<Num>, _resp: &mut Response| async move {
                let mut inbound = req.into_stream();
                Ok::<_, swill::error::RequestError>(stream! {
                    while let Some(Ok(item)) = futures::StreamExt::next(&mut inbound).await {
                        yield item;
                    }
                })
            },
        ))
        .build();
    let mut client = TestClient::new(dispatcher);

    client.send_message("echo", 1, &Num(1)).await.unwrap();
    client.send_metadata("echo", 1, Default::default()).await.unwrap();

    let echoed = client.recv().await.expect("the one message sent before the violation");
    assert_eq!(echoed.kind, ResponseType::Message);

    let error = client.recv().await.expect("protocol violation surfaces as an error frame");
    assert_eq!(error.kind, ResponseType::Error);

    client.join_next().await;
    assert_eq!(client.live_call_count(), 0);
}

/// Testable property 11: cancelling a call removes its live-call entry and
/// stops further outbound frames for that `seq`.
#[tokio::test]
async fn cancel_removes_the_live_call_and_silences_further_output() {
    let dispatcher = Dispatcher::builder()
        .register(stream_stream(
            "echo",
            |_call, req: swill::request::StreamRequest<Num>, _resp: &mut Response| async move {
                let mut inbound = req.into_stream();
                Ok::<_, swill::error::RequestError>(stream! {
                    while let Some(Ok(item)) = futures::StreamExt::next(&mut inbound).await {
                        yield item;
                    }
                })
            },
        ))
        .build();
    let mut client = TestClient::new(dispatcher);

    client.send_message("echo", 1, &Num(1)).await.unwrap();
    let first = client.recv().await.expect("one echoed message before cancel");
    assert_eq!(first.kind, ResponseType::Message);

    client.send_cancel("echo", 1).await.unwrap();
    client.join_next().await;

    assert_eq!(client.live_call_count(), 0);
    assert!(client.recv_timeout(Duration::from_millis(20)).await.is_none());
}

/// Testable property 14: a handler raising `RequestError::Close` is surfaced
/// through the handler task's outcome rather than as an ERROR frame.
#[tokio::test]
async fn handler_raised_close_connection_is_surfaced_by_join_next() {
    let dispatcher = Dispatcher::builder()
        .register(unary_unary("explode", |_call, _req: Num, _resp: &mut Response| async move {
            Err(swill::error::RequestError::Close(swill::error::CloseConnection::new(1003, "unsupported payload")))
        }))
        .build();
    let mut client = TestClient::new(dispatcher);

    client.send_message("explode", 1, &Num(1)).await.unwrap();
    let (key, close) = client.join_next().await.expect("handler task finishes");
    assert_eq!(key, ("explode".to_string(), 1));

    let close = close.expect("handler asked to close the connection");
    assert_eq!(close.code, 1003);
    assert!(client.recv_timeout(Duration::from_millis(20)).await.is_none());
}

/// Testable property 12: disconnecting cancels every in-flight call.
#[tokio::test]
async fn disconnect_cancels_every_in_flight_call() {
    let cancelled_count = Arc::new(AtomicUsize::new(0));
    let counter = cancelled_count.clone();

    let dispatcher = Dispatcher::builder()
        .register(stream_stream(
            "block",
            move |call, mut req: swill::request::StreamRequest<Num>, _resp: &mut Response| {
                let counter = counter.clone();
                async move {
                    let _ = futures::StreamExt::next(&mut req.into_stream()).await;
                    if call.cancelled() {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok::<_, swill::error::RequestError>(futures::stream::empty::<Num>())
                }
            },
        ))
        .build();
    let mut client = TestClient::new(dispatcher);

    client.send_message("block", 1, &Num(1)).await.unwrap();
    client.send_message("block", 2, &Num(2)).await.unwrap();
    assert_eq!(client.live_call_count(), 2);

    client.disconnect();
    assert_eq!(client.live_call_count(), 0);

    client.join_next().await;
    client.join_next().await;
    assert_eq!(cancelled_count.load(Ordering::SeqCst), 2);
}
