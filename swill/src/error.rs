//! Connection- and call-level error taxonomy.
//!
//! Splits "this terminates one call" from "this terminates the connection":
//! [`RequestError`] covers the former, [`CloseConnection`] the latter. Both
//! eventually carry a
//! `swill_core::SwillStatus` onto the wire via [`RequestError::into_status`].

use swill_core::{Code, SwillStatus, ValidationError};

/// An error that terminates the current call but not the connection.
///
/// Surfaced to the client as `ERROR(code, message)` on the offending call's
/// `seq`; the live-call map entry is then removed.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error(transparent)]
    Deserialization(#[from] swill_core::DeserializationError),

    #[error(transparent)]
    Serialization(#[from] swill_core::SerializationError),

    #[error("validation failed")]
    Validation(ValidationError),

    #[error("no handler registered for rpc {0:?}")]
    HandlerNotFound(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Cooperative cancellation. Never placed on the wire: the dispatcher
    /// suppresses this variant at the call boundary.
    #[error("request cancelled")]
    Cancelled,

    /// A handler returned a user-facing application error.
    #[error(transparent)]
    Application(#[from] SwillStatus),

    /// Catch-all for a handler panic or an opaque error bubbling out.
    #[error("internal error: {0}")]
    Internal(String),

    /// A handler (or frame feeder) wants to terminate the whole connection,
    /// not just this call. Propagated up through the handler task's return
    /// value rather than rendered as an ERROR frame (§4.7, testable property 14).
    #[error(transparent)]
    Close(#[from] CloseConnection),
}

impl RequestError {
    /// Render this error as the wire-level status carried in an ERROR frame.
    ///
    /// Returns `None` for [`RequestError::Cancelled`], which must never reach
    /// the wire.
    pub fn into_status(self) -> Option<SwillStatus> {
        match self {
            RequestError::Deserialization(e) => Some(SwillStatus::internal(e.to_string())),
            RequestError::Serialization(e) => Some(SwillStatus::internal(e.to_string())),
            RequestError::Validation(e) => {
                Some(SwillStatus::new(Code::ValidationError, e.to_string()).with_data(e.to_json()))
            }
            RequestError::HandlerNotFound(rpc) => {
                Some(SwillStatus::not_found(format!("no handler registered for rpc {rpc:?}")))
            }
            RequestError::Protocol(message) => Some(SwillStatus::internal(message)),
            RequestError::Cancelled => None,
            RequestError::Application(status) => Some(status),
            RequestError::Internal(message) => Some(SwillStatus::internal(message)),
            // Never rendered as an ERROR frame: callers match this variant
            // explicitly and close the connection instead.
            RequestError::Close(_) => None,
        }
    }
}

/// Raised by a hook or handler to terminate the whole connection.
///
/// Values below 1000 are interpreted as a pre-upgrade HTTP status; values
/// 1000 and above are WebSocket close codes. Per §6, a pre-upgrade code
/// outside `200..1000` is substituted with 403.
#[derive(Debug, thiserror::Error)]
#[error("close connection: {code} {reason}")]
pub struct CloseConnection {
    pub code: u16,
    pub reason: String,
}

impl CloseConnection {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self { code, reason: reason.into() }
    }

    /// The code as it should appear in an actual WebSocket close frame,
    /// guaranteed to be at least 1000.
    pub fn websocket_code(&self) -> u16 {
        self.code.max(1000)
    }

    /// The code as it should appear in a pre-upgrade HTTP rejection,
    /// substituting 403 when out of the valid HTTP-status-ish range.
    pub fn http_status(&self) -> u16 {
        if (200..1000).contains(&self.code) {
            self.code
        } else {
            403
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn websocket_code_floors_to_1000() {
        assert_eq!(CloseConnection::new(500, "oops").websocket_code(), 1000);
        assert_eq!(CloseConnection::new(1003, "bye").websocket_code(), 1003);
    }

    #[test]
    fn http_status_substitutes_out_of_range_codes() {
        assert_eq!(CloseConnection::new(406, "no subprotocol").http_status(), 406);
        assert_eq!(CloseConnection::new(1003, "bye").http_status(), 403);
        assert_eq!(CloseConnection::new(50, "too low").http_status(), 403);
    }

    #[test]
    fn cancelled_never_renders_to_a_status() {
        assert!(RequestError::Cancelled.into_status().is_none());
    }
}
