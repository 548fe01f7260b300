//! Payload encode/decode on top of the envelope layer.
//!
//! A handler's request and response types implement [`SwillMessage`], which
//! bundles the `serde` shape the codec encodes/decodes against with the
//! (possibly no-op) [`Validate`] implementation run immediately after
//! decoding succeeds.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::envelope::RawMessagePack;
use crate::error::{DeserializationError, SerializationError};
use crate::validator::{Validate, ValidationError};

/// A value that can ride as an envelope payload: encoded to and decoded from
/// MessagePack bytes, then checked against its own constraint validator.
///
/// Implemented automatically by `#[derive(Serialize, Deserialize)]` types via
/// a blanket impl; types with constraints additionally implement [`Validate`]
/// (its default is a no-op, so plain messages need nothing extra).
pub trait SwillMessage: Serialize + DeserializeOwned + Validate + Send + Sync + 'static {}

impl<T> SwillMessage for T where T: Serialize + DeserializeOwned + Validate + Send + Sync + 'static {}

/// Encodes `value` as a payload, returning the already-framed bytes.
///
/// Used on the send path: the resulting [`RawMessagePack`] is spliced into an
/// `EncapsulatedResponse` without further encoding.
pub fn encode_payload<T: SwillMessage>(value: &T) -> Result<RawMessagePack, SerializationError> {
    rmp_serde::to_vec_named(value)
        .map(RawMessagePack::from)
        .map_err(|e| SerializationError(e.to_string()))
}

/// Decodes a payload and runs its validator.
///
/// Mirrors §4.1: deserialization failures raise [`DeserializationError`];
/// once a value is produced, [`Validate::validate`] runs and a failure is
/// surfaced distinctly (callers map it to `ERROR(VALIDATION_ERROR)` rather
/// than `ERROR(BAD_REQUEST)`).
pub fn decode_payload<T: SwillMessage>(raw: &RawMessagePack) -> Result<T, PayloadError> {
    let value: T = rmp_serde::from_slice(raw.as_slice())
        .map_err(|e| DeserializationError(format!("payload shape mismatch: {e}")))?;
    value.validate().map_err(PayloadError::Validation)?;
    Ok(value)
}

/// Either the payload didn't decode, or it decoded but failed validation.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error(transparent)]
    Deserialization(#[from] DeserializationError),
    #[error(transparent)]
    Validation(ValidationError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validator::FieldErrorDescriptor;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Greeting {
        name: String,
    }

    impl Validate for Greeting {
        fn validate(&self) -> Result<(), ValidationError> {
            if self.name.is_empty() {
                Err(ValidationError::single("name", "must not be empty"))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn encode_then_decode_round_trips() {
        let value = Greeting { name: "Ada".into() };
        let raw = encode_payload(&value).unwrap();
        let decoded: Greeting = decode_payload(&raw).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn decode_runs_validator_after_deserializing() {
        let value = Greeting { name: String::new() };
        let raw = encode_payload(&value).unwrap();
        let err = decode_payload::<Greeting>(&raw).unwrap_err();
        match err {
            PayloadError::Validation(v) => {
                assert_eq!(
                    v.fields.get("name").unwrap()[0],
                    FieldErrorDescriptor::Description("must not be empty".into())
                );
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn decode_rejects_shape_mismatch() {
        let raw = RawMessagePack::from(vec![0xc0]); // nil, not a map
        let err = decode_payload::<Greeting>(&raw);
        assert!(matches!(err, Err(PayloadError::Deserialization(_))));
    }
}
