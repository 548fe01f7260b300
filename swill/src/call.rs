//! A live RPC invocation.

use swill_core::Metadata;
use tokio_util::sync::CancellationToken;

/// Uniquely identifies a live call on a connection for its lifetime.
///
/// A `seq` MAY be reused once the call it identified has terminated; the
/// implementation never assumes monotonicity, only uniqueness-while-live.
pub type CallKey = (String, u64);

/// Which ends of a call are unary vs. streaming.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallKind {
    UnaryUnary,
    UnaryStream,
    StreamUnary,
    StreamStream,
}

impl CallKind {
    pub fn request_streams(self) -> bool {
        matches!(self, CallKind::StreamUnary | CallKind::StreamStream)
    }

    pub fn response_streams(self) -> bool {
        matches!(self, CallKind::UnaryStream | CallKind::StreamStream)
    }
}

/// Per-call bookkeeping shared between the dispatcher and the handler task.
///
/// Holds nothing about the payload itself (that lives in the request object
/// fed to the handler) — just identity, kind, client metadata, and the
/// cancellation flag the dispatcher and handler both observe.
#[derive(Debug)]
pub struct Call {
    pub rpc: String,
    pub seq: u64,
    pub kind: CallKind,
    /// Metadata attached to the opening frame. Setting it again after the
    /// opening frame is a protocol violation the feeder rejects.
    pub metadata: Option<Metadata>,
    cancellation: CancellationToken,
}

impl Call {
    pub fn new(rpc: impl Into<String>, seq: u64, kind: CallKind, metadata: Option<Metadata>) -> Self {
        Self {
            rpc: rpc.into(),
            seq,
            kind,
            metadata,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn key(&self) -> CallKey {
        (self.rpc.clone(), self.seq)
    }

    /// Marks this call cancelled. Idempotent.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// A future that resolves once this call is cancelled, for racing against
    /// a stream's `next()` at each yield boundary (§4.6, §9).
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }
}
