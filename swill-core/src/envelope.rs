//! Swill frame envelopes.
//!
//! Every WebSocket message carries exactly one MessagePack-encoded envelope:
//! an `EncapsulatedRequest` client -> server, or an `EncapsulatedResponse`
//! server -> client. Both are array-encoded (`[seq, data, ...]`) with trailing
//! fields at their default value omitted from the wire form; the decoder
//! accepts any array at least as long as the required prefix and defaults the
//! rest.

use std::collections::BTreeMap;
use std::io::Cursor;

use crate::error::DeserializationError;

/// A metadata map. MessagePack keys are strings; values are arbitrary.
pub type Metadata = BTreeMap<String, rmpv::Value>;

/// Inbound frame kind (client -> server).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum RequestType {
    #[default]
    Message = 0,
    EndOfStream = 1,
    Metadata = 2,
    Cancel = 3,
}

impl RequestType {
    pub fn from_u8(v: u8) -> Result<Self, DeserializationError> {
        match v {
            0 => Ok(Self::Message),
            1 => Ok(Self::EndOfStream),
            2 => Ok(Self::Metadata),
            3 => Ok(Self::Cancel),
            other => Err(DeserializationError(format!(
                "unknown request frame type {other}"
            ))),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Outbound frame kind (server -> client).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ResponseType {
    #[default]
    Message = 0,
    EndOfStream = 1,
    Metadata = 2,
    Error = 3,
}

impl ResponseType {
    pub fn from_u8(v: u8) -> Result<Self, DeserializationError> {
        match v {
            0 => Ok(Self::Message),
            1 => Ok(Self::EndOfStream),
            2 => Ok(Self::Metadata),
            3 => Ok(Self::Error),
            other => Err(DeserializationError(format!(
                "unknown response frame type {other}"
            ))),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// A pre-encoded MessagePack document.
///
/// The dispatcher treats call payloads as opaque bytes on the wire: they are
/// sliced out of an inbound envelope (or produced once by the codec on the
/// outbound side) and spliced into the next envelope without being decoded
/// and re-encoded in between. This is the "raw" wrapper referenced by the
/// framing rules: it lets an already-encoded value be embedded in an
/// envelope at zero extra encode cost. Backed by `bytes::Bytes` rather than
/// `Vec<u8>` so that splicing a payload into a new envelope is a cheap clone
/// of a refcounted buffer, not a copy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawMessagePack(pub bytes::Bytes);

impl RawMessagePack {
    /// The MessagePack encoding of `null` (`0xc0`), reused whenever a response
    /// carries no explicit payload.
    pub fn null() -> Self {
        Self(bytes::Bytes::from_static(&[0xc0]))
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for RawMessagePack {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes::Bytes::from(bytes))
    }
}

/// `seq: u64, data: raw bytes, rpc: string, type: RequestType, metadata: optional mapping`.
///
/// `seq = 0` is reserved and never issued by a conforming client.
#[derive(Clone, Debug)]
pub struct EncapsulatedRequest {
    pub seq: u64,
    pub data: RawMessagePack,
    pub rpc: String,
    pub kind: RequestType,
    pub metadata: Option<Metadata>,
}

/// `seq: u64, data: raw bytes, type: ResponseType, leading_metadata: optional mapping, trailing_metadata: optional mapping`.
#[derive(Clone, Debug)]
pub struct EncapsulatedResponse {
    pub seq: u64,
    pub data: RawMessagePack,
    pub kind: ResponseType,
    pub leading_metadata: Option<Metadata>,
    pub trailing_metadata: Option<Metadata>,
}

impl EncapsulatedResponse {
    pub fn message(seq: u64, data: RawMessagePack) -> Self {
        Self {
            seq,
            data,
            kind: ResponseType::Message,
            leading_metadata: None,
            trailing_metadata: None,
        }
    }

    pub fn end_of_stream(seq: u64) -> Self {
        Self {
            seq,
            data: RawMessagePack::null(),
            kind: ResponseType::EndOfStream,
            leading_metadata: None,
            trailing_metadata: None,
        }
    }

    pub fn metadata_only(seq: u64, leading_metadata: Metadata) -> Self {
        Self {
            seq,
            data: RawMessagePack::null(),
            kind: ResponseType::Metadata,
            leading_metadata: Some(leading_metadata),
            trailing_metadata: None,
        }
    }

    pub fn error(seq: u64, data: RawMessagePack) -> Self {
        Self {
            seq,
            data,
            kind: ResponseType::Error,
            leading_metadata: None,
            trailing_metadata: None,
        }
    }
}

fn read_value_span(cursor: &mut Cursor<&[u8]>) -> Result<Vec<u8>, DeserializationError> {
    let buf = *cursor.get_ref();
    let start = cursor.position() as usize;
    rmpv::decode::read_value(cursor)
        .map_err(|e| DeserializationError(format!("malformed payload: {e}")))?;
    let end = cursor.position() as usize;
    Ok(buf[start..end].to_vec())
}

fn read_str(cursor: &mut Cursor<&[u8]>) -> Result<String, DeserializationError> {
    rmp::decode::read_str_from_slice(slice_from(cursor))
        .map(|(s, rest)| {
            advance_to(cursor, rest);
            s.to_string()
        })
        .map_err(|e| DeserializationError(format!("expected string: {e:?}")))
}

fn slice_from<'a>(cursor: &Cursor<&'a [u8]>) -> &'a [u8] {
    let buf = *cursor.get_ref();
    &buf[cursor.position() as usize..]
}

fn advance_to(cursor: &mut Cursor<&[u8]>, rest: &[u8]) {
    let buf = *cursor.get_ref();
    let consumed = buf.len() - rest.len();
    cursor.set_position(consumed as u64);
}

fn read_metadata(cursor: &mut Cursor<&[u8]>) -> Result<Option<Metadata>, DeserializationError> {
    let value = read_value_span(cursor)?;
    let value: rmpv::Value = rmpv::decode::read_value(&mut Cursor::new(value.as_slice()))
        .map_err(|e| DeserializationError(format!("malformed metadata: {e}")))?;
    match value {
        rmpv::Value::Nil => Ok(None),
        rmpv::Value::Map(entries) => {
            let mut map = Metadata::new();
            for (k, v) in entries {
                let key = k
                    .as_str()
                    .ok_or_else(|| DeserializationError("metadata keys must be strings".into()))?
                    .to_string();
                map.insert(key, v);
            }
            Ok(Some(map))
        }
        other => Err(DeserializationError(format!(
            "metadata must be a mapping or null, got {other:?}"
        ))),
    }
}

fn write_metadata(buf: &mut Vec<u8>, metadata: &Option<Metadata>) -> Result<(), std::io::Error> {
    match metadata {
        None => {
            rmp::encode::write_nil(buf)?;
        }
        Some(map) => {
            rmp::encode::write_map_len(buf, map.len() as u32)?;
            for (k, v) in map {
                rmp::encode::write_str(buf, k)?;
                rmpv::encode::write_value(buf, v)
                    .map_err(|e| std::io::Error::other(e.to_string()))?;
            }
        }
    }
    Ok(())
}

/// Failure decoding an inbound envelope. Carries `seq` when the sequence
/// number itself parsed successfully before the rest of the envelope turned
/// out malformed, so a caller can still address an ERROR frame to the
/// offending call instead of only being able to close the whole connection;
/// `seq` is `None` when the envelope is malformed before `seq` is reached.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{error}")]
pub struct DecodeRequestError {
    pub seq: Option<u64>,
    pub error: DeserializationError,
}

/// Decode one inbound envelope from a complete WebSocket binary message.
pub fn decode_request(bytes: &[u8]) -> Result<EncapsulatedRequest, DecodeRequestError> {
    let mut cursor = Cursor::new(bytes);
    let len = rmp::decode::read_array_len(&mut cursor)
        .map_err(|e| without_seq(format!("expected envelope array: {e:?}")))?;
    if len < 3 {
        return Err(without_seq(format!(
            "request envelope needs at least 3 fields, got {len}"
        )));
    }

    let seq: u64 = rmp::decode::read_int(&mut cursor)
        .map_err(|e| without_seq(format!("expected seq: {e:?}")))?;

    let data = RawMessagePack::from(read_value_span(&mut cursor).map_err(|e| with_seq(seq, e))?);
    let rpc = read_str(&mut cursor).map_err(|e| with_seq(seq, e))?;

    let kind = if len >= 4 {
        let v: u8 = rmp::decode::read_int(&mut cursor)
            .map_err(|e| with_seq(seq, DeserializationError(format!("expected request type: {e:?}"))))?;
        RequestType::from_u8(v).map_err(|e| with_seq(seq, e))?
    } else {
        RequestType::default()
    };

    let metadata = if len >= 5 {
        read_metadata(&mut cursor).map_err(|e| with_seq(seq, e))?
    } else {
        None
    };

    Ok(EncapsulatedRequest {
        seq,
        data,
        rpc,
        kind,
        metadata,
    })
}

fn without_seq(message: String) -> DecodeRequestError {
    DecodeRequestError { seq: None, error: DeserializationError(message) }
}

fn with_seq(seq: u64, error: DeserializationError) -> DecodeRequestError {
    DecodeRequestError { seq: Some(seq), error }
}

/// Encode one outbound envelope into a complete WebSocket binary message.
///
/// The maximal run of trailing default-valued fields is omitted from the
/// array, matching the wire convention; `decode_request`/`decode_response`
/// accept the shorter form.
pub fn encode_response(response: &EncapsulatedResponse) -> Vec<u8> {
    let want_trailing = response.trailing_metadata.is_some();
    let want_leading = want_trailing || response.leading_metadata.is_some();
    let want_kind = want_leading || response.kind != ResponseType::default();
    let len = if want_kind { 5 } else { 2 };

    let mut buf = Vec::with_capacity(16 + response.data.0.len());
    rmp::encode::write_array_len(&mut buf, len).expect("write to Vec never fails");
    rmp::encode::write_uint(&mut buf, response.seq).expect("write to Vec never fails");
    buf.extend_from_slice(&response.data.0);

    if want_kind {
        rmp::encode::write_uint(&mut buf, response.kind.as_u8() as u64)
            .expect("write to Vec never fails");
        write_metadata(&mut buf, &response.leading_metadata).expect("write to Vec never fails");
        write_metadata(&mut buf, &response.trailing_metadata).expect("write to Vec never fails");
    }

    buf
}

/// Decode an `EncapsulatedResponse`. Used by the in-process test harness and
/// by property tests that assert envelope round-trips.
pub fn decode_response(bytes: &[u8]) -> Result<EncapsulatedResponse, DeserializationError> {
    let mut cursor = Cursor::new(bytes);
    let len = rmp::decode::read_array_len(&mut cursor)
        .map_err(|e| DeserializationError(format!("expected envelope array: {e:?}")))?;
    if len < 2 {
        return Err(DeserializationError(format!(
            "response envelope needs at least 2 fields, got {len}"
        )));
    }

    let seq: u64 = rmp::decode::read_int(&mut cursor)
        .map_err(|e| DeserializationError(format!("expected seq: {e:?}")))?;
    let data = RawMessagePack::from(read_value_span(&mut cursor)?);

    let kind = if len >= 3 {
        let v: u8 = rmp::decode::read_int(&mut cursor)
            .map_err(|e| DeserializationError(format!("expected response type: {e:?}")))?;
        ResponseType::from_u8(v)?
    } else {
        ResponseType::default()
    };

    let leading_metadata = if len >= 4 {
        read_metadata(&mut cursor)?
    } else {
        None
    };
    let trailing_metadata = if len >= 5 {
        read_metadata(&mut cursor)?
    } else {
        None
    };

    Ok(EncapsulatedResponse {
        seq,
        data,
        kind,
        leading_metadata,
        trailing_metadata,
    })
}

/// Encode an inbound envelope. Only used by the in-process test harness,
/// which plays the role of a client driving the dispatcher directly.
pub fn encode_request(request: &EncapsulatedRequest) -> Vec<u8> {
    let want_metadata = request.metadata.is_some();
    let want_kind = want_metadata || request.kind != RequestType::default();
    let len = if want_kind { 5 } else { 3 };

    let mut buf = Vec::with_capacity(16 + request.data.0.len() + request.rpc.len());
    rmp::encode::write_array_len(&mut buf, len).expect("write to Vec never fails");
    rmp::encode::write_uint(&mut buf, request.seq).expect("write to Vec never fails");
    buf.extend_from_slice(&request.data.0);
    rmp::encode::write_str(&mut buf, &request.rpc).expect("write to Vec never fails");

    if want_kind {
        rmp::encode::write_uint(&mut buf, request.kind.as_u8() as u64)
            .expect("write to Vec never fails");
        write_metadata(&mut buf, &request.metadata).expect("write to Vec never fails");
    }

    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_example_envelope_from_spec() {
        // \x93\x01\x92\x02\x04\xa3add == {seq: 1, data: [2, 4], rpc: "add"}
        let bytes = [0x93, 0x01, 0x92, 0x02, 0x04, 0xa3, b'a', b'd', b'd'];
        let req = decode_request(&bytes).unwrap();
        assert_eq!(req.seq, 1);
        assert_eq!(req.rpc, "add");
        assert_eq!(req.kind, RequestType::Message);
        assert!(req.metadata.is_none());
        assert_eq!(req.data.as_slice(), &[0x92, 0x02, 0x04]);
    }

    #[test]
    fn request_round_trips() {
        let original = EncapsulatedRequest {
            seq: 2,
            data: RawMessagePack::from(b"\xa4DATA".to_vec()),
            rpc: "test".to_string(),
            kind: RequestType::Message,
            metadata: None,
        };
        let bytes = encode_request(&original);
        let decoded = decode_request(&bytes).unwrap();
        assert_eq!(decoded.seq, 2);
        assert_eq!(decoded.rpc, "test");
    }

    #[test]
    fn raw_payload_passes_through_unchanged() {
        let payload = RawMessagePack::from(b"\x92\x01\x02".to_vec());
        let response = EncapsulatedResponse::message(5, payload.clone());
        let bytes = encode_response(&response);
        // the 3 payload bytes appear unchanged at the payload offset
        assert!(bytes.windows(3).any(|w| w == payload.as_slice()));
        let decoded = decode_response(&bytes).unwrap();
        assert_eq!(decoded.data, payload);
    }

    #[test]
    fn null_payload_is_the_canonical_msgpack_nil() {
        let response = EncapsulatedResponse::end_of_stream(1);
        assert_eq!(response.data.as_slice(), &[0xc0]);
    }

    #[test]
    fn error_response_round_trips_with_explicit_type() {
        let response = EncapsulatedResponse::error(1, RawMessagePack::from(b"\x80".to_vec()));
        let bytes = encode_response(&response);
        let decoded = decode_response(&bytes).unwrap();
        assert_eq!(decoded.kind, ResponseType::Error);
        assert_eq!(decoded.seq, 1);
    }

    #[test]
    fn short_array_defaults_missing_tail_fields() {
        // [seq, data] only — no type or metadata elements on the wire.
        let mut buf = Vec::new();
        rmp::encode::write_array_len(&mut buf, 2).unwrap();
        rmp::encode::write_uint(&mut buf, 7).unwrap();
        rmp::encode::write_nil(&mut buf).unwrap();

        let decoded = decode_response(&buf).unwrap();
        assert_eq!(decoded.seq, 7);
        assert_eq!(decoded.kind, ResponseType::Message);
        assert!(decoded.leading_metadata.is_none());
        assert!(decoded.trailing_metadata.is_none());
    }

    #[test]
    fn unknown_cancel_or_end_of_stream_frame_has_no_metadata_requirement() {
        let mut buf = Vec::new();
        rmp::encode::write_array_len(&mut buf, 4).unwrap();
        rmp::encode::write_uint(&mut buf, 3).unwrap();
        rmp::encode::write_nil(&mut buf).unwrap();
        rmp::encode::write_str(&mut buf, "whatever").unwrap();
        rmp::encode::write_uint(&mut buf, RequestType::Cancel.as_u8() as u64).unwrap();

        let decoded = decode_request(&buf).unwrap();
        assert_eq!(decoded.kind, RequestType::Cancel);
    }
}
