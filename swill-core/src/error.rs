//! Wire-level error codes and the structured status carried inside ERROR frames.

use serde::{Deserialize, Serialize};

use crate::validator::Validate;

/// HTTP-status-like error codes carried on the wire inside an ERROR response frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum Code {
    BadRequest = 400,
    Unauthorized = 401,
    Forbidden = 403,
    NotFound = 404,
    InternalError = 500,
    InvalidRpc = 501,
    ValidationError = 422,
}

impl Code {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(code: i32) -> Option<Self> {
        match code {
            400 => Some(Self::BadRequest),
            401 => Some(Self::Unauthorized),
            403 => Some(Self::Forbidden),
            404 => Some(Self::NotFound),
            500 => Some(Self::InternalError),
            501 => Some(Self::InvalidRpc),
            422 => Some(Self::ValidationError),
            _ => None,
        }
    }
}

/// The payload of an ERROR response frame: `{code, message, data}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<serde_json::Value>,
}

/// `ErrorMessage` carries no constraints of its own; it rides the same
/// `SwillMessage` codec path as any other payload.
impl Validate for ErrorMessage {}

impl ErrorMessage {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code: code.as_i32(),
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// A user-raised application error carrying an arbitrary numeric `code` and a
/// `message`, surfaced to the client as `ERROR(code, message)`.
///
/// This is the Swill analogue of a status error: handlers return
/// `Result<T, SwillStatus>` and the dispatcher turns the `Err` variant into an
/// ERROR frame without terminating the connection.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{message}")]
pub struct SwillStatus {
    pub code: Code,
    pub message: String,
    pub data: Option<serde_json::Value>,
}

impl SwillStatus {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Code::NotFound, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::InternalError, message)
    }

    pub fn invalid_rpc(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidRpc, message)
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn into_error_message(self) -> ErrorMessage {
        ErrorMessage {
            code: self.code.as_i32(),
            message: self.message,
            data: self.data,
        }
    }
}

/// Errors raised encoding a value into a MessagePack payload.
#[derive(Clone, Debug, thiserror::Error)]
#[error("serialization error: {0}")]
pub struct SerializationError(pub String);

/// Errors raised decoding MessagePack bytes, either at the envelope level
/// (malformed frame) or the payload level (value doesn't match the declared shape).
#[derive(Clone, Debug, thiserror::Error)]
#[error("deserialization error: {0}")]
pub struct DeserializationError(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_round_trips_through_i32() {
        for code in [
            Code::BadRequest,
            Code::Unauthorized,
            Code::Forbidden,
            Code::NotFound,
            Code::InternalError,
            Code::InvalidRpc,
            Code::ValidationError,
        ] {
            assert_eq!(Code::from_i32(code.as_i32()), Some(code));
        }
        assert_eq!(Code::from_i32(999), None);
    }

    #[test]
    fn status_carries_data_through_to_error_message() {
        let status =
            SwillStatus::not_found("no such widget").with_data(serde_json::json!({"id": 7}));
        let msg = status.into_error_message();
        assert_eq!(msg.code, Code::NotFound.as_i32());
        assert_eq!(msg.data, Some(serde_json::json!({"id": 7})));
    }
}
