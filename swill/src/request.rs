//! Per-call inbound state: a single decoded message (unary) or a queue of
//! them (streaming).

use futures::Stream;
use swill_core::{PayloadError, RawMessagePack, RequestType, SwillMessage, decode_payload};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::RequestError;

impl From<PayloadError> for RequestError {
    fn from(err: PayloadError) -> Self {
        match err {
            PayloadError::Deserialization(e) => RequestError::Deserialization(e),
            PayloadError::Validation(e) => RequestError::Validation(e),
        }
    }
}

/// Raised when a streaming request observes cancellation mid-iteration.
///
/// Distinct from [`RequestError::Cancelled`]: this is the `Err` arm of the
/// stream's own `Item`, not a dispatcher-level error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("request cancelled")]
pub struct RequestCancelled;

/// The inbound side of a unary-request call: exactly one MESSAGE is expected.
#[derive(Debug, Default)]
pub struct UnaryRequest<T> {
    data: Option<T>,
    cancelled: bool,
}

impl<T: SwillMessage> UnaryRequest<T> {
    pub fn new() -> Self {
        Self { data: None, cancelled: false }
    }

    /// Feeds one inbound frame. MESSAGE decodes and stores the payload;
    /// CANCEL marks the request cancelled; anything else is a protocol
    /// violation (§4.5).
    pub fn process_frame(
        &mut self,
        kind: RequestType,
        raw: &RawMessagePack,
    ) -> Result<(), RequestError> {
        match kind {
            RequestType::Message => {
                self.data = Some(decode_payload::<T>(raw)?);
                Ok(())
            }
            RequestType::Cancel => {
                self.cancelled = true;
                Ok(())
            }
            other => Err(RequestError::Protocol(format!(
                "unexpected frame type {other:?} for a unary request"
            ))),
        }
    }

    pub fn cancelled(&self) -> bool {
        self.cancelled
    }

    /// Consumes the request, failing if it was cancelled or no MESSAGE ever arrived.
    pub fn into_inner(self) -> Result<T, RequestError> {
        if self.cancelled {
            return Err(RequestError::Cancelled);
        }
        self.data
            .ok_or_else(|| RequestError::Protocol("no message received for unary request".into()))
    }
}

/// The producer half of a streaming request's inbound queue.
///
/// Owned by the dispatcher; `push` is called once per decoded inbound
/// MESSAGE, `close` on END_OF_STREAM, `cancel` on CANCEL.
pub struct StreamSink<T> {
    tx: Option<mpsc::UnboundedSender<T>>,
    cancellation: CancellationToken,
}

impl<T> StreamSink<T> {
    pub fn push(&self, value: T) {
        if let Some(tx) = &self.tx {
            // The only way `send` fails is if the receiver (the handler task)
            // already dropped, which means nobody will ever observe this
            // item anyway.
            let _ = tx.send(value);
        }
    }

    pub fn close(&mut self) {
        self.tx = None;
    }

    pub fn cancel(&mut self) {
        self.cancellation.cancel();
        self.tx = None;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_none()
    }
}

/// The consumer half: an async stream of decoded inbound messages.
pub struct StreamRequest<T> {
    rx: mpsc::UnboundedReceiver<T>,
    cancellation: CancellationToken,
}

impl<T: Send + 'static> StreamRequest<T> {
    /// Converts into an owned `Stream`, yielding `Err(RequestCancelled)` as
    /// its terminal item if cancellation fires before or during a wait, or
    /// ending normally once the producer closed the queue.
    pub fn into_stream(self) -> impl Stream<Item = Result<T, RequestCancelled>> {
        let StreamRequest { mut rx, cancellation } = self;
        async_stream::stream! {
            loop {
                tokio::select! {
                    biased;
                    _ = cancellation.cancelled() => {
                        yield Err(RequestCancelled);
                        return;
                    }
                    item = rx.recv() => {
                        match item {
                            Some(value) => yield Ok(value),
                            None => return,
                        }
                    }
                }
            }
        }
    }
}

/// Creates a streaming request's producer/consumer pair, sharing `cancellation`
/// with the owning [`crate::call::Call`].
pub fn stream_channel<T>(cancellation: CancellationToken) -> (StreamSink<T>, StreamRequest<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        StreamSink { tx: Some(tx), cancellation: cancellation.clone() },
        StreamRequest { rx, cancellation },
    )
}
