//! Per-call outbound metadata slots.

use tokio::sync::mpsc;

use swill_core::{EncapsulatedResponse, Metadata};

/// A response error: a metadata slot was set in violation of the
/// set-once/terminal-only rules (§4.5, testable property 9).
#[derive(Debug, thiserror::Error)]
pub enum ResponseError {
    #[error("leading metadata was already sent")]
    LeadingAlreadySent,
}

/// Leading/trailing metadata slots attached to one call's outbound side.
///
/// Leading metadata may be set at most once and never after it has been
/// sent; trailing metadata may be set any time up to the terminal frame and
/// is attached only to that frame. Holds a clone of the connection's send
/// queue and the call's `seq` so `set_leading_metadata(.., send_immediately:
/// true)` can enqueue a standalone METADATA frame itself — handlers are
/// never given `&Connection` directly, so without this the "send now" path
/// would have nowhere to put the frame (§4.5).
#[derive(Debug)]
pub struct Response {
    leading: Option<Metadata>,
    leading_sent: bool,
    trailing: Option<Metadata>,
    seq: u64,
    send_tx: Option<mpsc::Sender<Vec<u8>>>,
}

impl Default for Response {
    fn default() -> Self {
        Self { leading: None, leading_sent: false, trailing: None, seq: 0, send_tx: None }
    }
}

impl Response {
    /// A response with nowhere to send an immediate metadata frame.
    /// `send_leading_metadata_now` is a no-op on a response built this way;
    /// intended for tests that only exercise the metadata slots themselves.
    pub fn new() -> Self {
        Self::default()
    }

    /// A response wired to a live call: `seq` identifies the call on the
    /// wire and `send_tx` is a clone of the owning connection's outbound
    /// queue, used only by the `send_immediately` path.
    pub fn for_call(seq: u64, send_tx: mpsc::Sender<Vec<u8>>) -> Self {
        Self { leading: None, leading_sent: false, trailing: None, seq, send_tx: Some(send_tx) }
    }

    /// Sets leading metadata. If `send_immediately` is true and no leading
    /// metadata has been sent yet, enqueues a standalone METADATA frame on
    /// the connection's outbound queue right away; otherwise the metadata
    /// rides on the next outbound frame via
    /// [`Response::consume_leading_metadata`].
    pub async fn set_leading_metadata(
        &mut self,
        metadata: Metadata,
        send_immediately: bool,
    ) -> Result<(), ResponseError> {
        if self.leading_sent {
            return Err(ResponseError::LeadingAlreadySent);
        }
        self.leading = Some(metadata.clone());
        if send_immediately {
            self.leading_sent = true;
            if let Some(send_tx) = &self.send_tx {
                let frame = EncapsulatedResponse::metadata_only(self.seq, metadata);
                let bytes = swill_core::encode_response(&frame);
                if send_tx.send(bytes).await.is_err() {
                    tracing::warn!(seq = self.seq, "failed to send immediate leading metadata: connection closed");
                }
            }
        }
        Ok(())
    }

    pub fn set_trailing_metadata(&mut self, metadata: Metadata) {
        self.trailing = Some(metadata);
    }

    /// Returns the stored leading metadata once, marking it sent; subsequent
    /// calls return `None` even if a value was stored.
    pub fn consume_leading_metadata(&mut self) -> Option<Metadata> {
        if self.leading_sent {
            return None;
        }
        self.leading_sent = true;
        self.leading.take()
    }

    pub fn trailing_metadata(&self) -> Option<&Metadata> {
        self.trailing.as_ref()
    }

    pub fn take_trailing_metadata(&mut self) -> Option<Metadata> {
        self.trailing.take()
    }
}
