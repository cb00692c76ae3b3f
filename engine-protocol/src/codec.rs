//! Encoder and decoder turning messages into frames and back.
//!
//! The frame layout is the same for every transport; only the payload
//! encoding differs. MessagePack is the compact binary form used between
//! co-located compartments, JSON the textual form used for the handshake
//! and for debugging over the network.

use crate::error::ProtocolError;
use crate::frame::Frame;
use crate::message::Message;
use bytes::{Bytes, BytesMut};
use serde::de::{self, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Payload encoding for frames.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WireFormat {
    /// MessagePack with named fields (structs as maps).
    #[default]
    #[serde(rename = "msgpack")]
    MsgPack,
    /// UTF-8 JSON.
    #[serde(rename = "json")]
    Json,
}

impl WireFormat {
    /// Serializes a message payload (without framing).
    pub fn to_payload(&self, message: &Message) -> Result<Vec<u8>, ProtocolError> {
        match self {
            // Named encoding keeps the envelope self-describing, which the
            // tagged decode below relies on.
            WireFormat::MsgPack => Ok(rmp_serde::to_vec_named(message)?),
            WireFormat::Json => Ok(serde_json::to_vec(message)?),
        }
    }

    /// Deserializes a message payload (without framing).
    ///
    /// Bytes that are not valid in this encoding yield
    /// [`ProtocolError::MalformedPayload`]; a well-formed value that is not a
    /// valid envelope yields [`ProtocolError::InvalidEnvelope`].
    pub fn from_payload(&self, payload: &[u8]) -> Result<Message, ProtocolError> {
        let value: Value = match self {
            WireFormat::MsgPack => rmp_serde::from_slice::<WireValue>(payload)
                .map(|v| v.0)
                .map_err(|e| ProtocolError::MalformedPayload(e.to_string()))?,
            WireFormat::Json => serde_json::from_slice(payload)
                .map_err(|e| ProtocolError::MalformedPayload(e.to_string()))?,
        };

        let message: Message = serde_json::from_value(value)
            .map_err(|e| ProtocolError::InvalidEnvelope(e.to_string()))?;
        message.validate()?;
        Ok(message)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WireFormat::MsgPack => "msgpack",
            WireFormat::Json => "json",
        }
    }
}

/// A JSON value read from MessagePack.
///
/// MessagePack `bin` has no JSON counterpart; it is read as an array of byte
/// values, the same shape serde gives `Vec<u8>` in JSON.
struct WireValue(Value);

impl<'de> Deserialize<'de> for WireValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(WireValueVisitor).map(WireValue)
    }
}

struct WireValueVisitor;

impl<'de> Visitor<'de> for WireValueVisitor {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("any MessagePack value")
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<Value, E> {
        Ok(Value::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Value, E> {
        Ok(Value::from(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Value, E> {
        Ok(Value::from(v))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Value, E> {
        Ok(serde_json::Number::from_f64(v).map_or(Value::Null, Value::Number))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Value, E> {
        Ok(Value::String(v.to_owned()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<Value, E> {
        Ok(Value::String(v))
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Value, E> {
        Ok(Value::Array(v.iter().map(|b| Value::from(*b)).collect()))
    }

    fn visit_none<E: de::Error>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_unit<E: de::Error>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<Value, D::Error> {
        WireValue::deserialize(deserializer).map(|v| v.0)
    }

    fn visit_newtype_struct<D: Deserializer<'de>>(
        self,
        deserializer: D,
    ) -> Result<Value, D::Error> {
        WireValue::deserialize(deserializer).map(|v| v.0)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Value, A::Error> {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0).min(4096));
        while let Some(WireValue(item)) = seq.next_element()? {
            items.push(item);
        }
        Ok(Value::Array(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Value, A::Error> {
        let mut object = serde_json::Map::new();
        while let Some((key, WireValue(value))) = map.next_entry::<String, WireValue>()? {
            object.insert(key, value);
        }
        Ok(Value::Object(object))
    }
}

impl fmt::Display for WireFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WireFormat {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "msgpack" | "messagepack" => Ok(WireFormat::MsgPack),
            "json" => Ok(WireFormat::Json),
            other => Err(ProtocolError::InvalidEnvelope(format!(
                "unknown wire format: {}",
                other
            ))),
        }
    }
}

/// Encodes messages into frames.
#[derive(Debug, Clone, Copy)]
pub struct Encoder {
    format: WireFormat,
    max_frame_size: usize,
}

impl Encoder {
    pub fn new(format: WireFormat, max_frame_size: usize) -> Self {
        Self {
            format,
            max_frame_size,
        }
    }

    pub fn format(&self) -> WireFormat {
        self.format
    }

    pub fn set_format(&mut self, format: WireFormat) {
        self.format = format;
    }

    /// Encodes a message into a complete frame.
    pub fn encode(&self, message: &Message) -> Result<BytesMut, ProtocolError> {
        let payload = self.format.to_payload(message)?;
        Frame::new(payload).encode(self.max_frame_size)
    }
}

/// Incrementally decodes frames into messages.
#[derive(Debug)]
pub struct Decoder {
    buffer: BytesMut,
    format: WireFormat,
    max_frame_size: usize,
}

impl Decoder {
    pub fn new(format: WireFormat, max_frame_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            format,
            max_frame_size,
        }
    }

    pub fn format(&self) -> WireFormat {
        self.format
    }

    /// Switches the payload encoding for all frames decoded from now on.
    ///
    /// Bytes already buffered are kept and decoded with the new format.
    pub fn set_format(&mut self, format: WireFormat) {
        self.format = format;
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Appends bytes to the internal buffer.
    pub fn extend_bytes(&mut self, data: Bytes) {
        self.buffer.extend_from_slice(&data);
    }

    /// Attempts to decode the next complete frame from the buffer.
    pub fn decode_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        Frame::decode(&mut self.buffer, self.max_frame_size)
    }

    /// Attempts to decode the next message from the buffer.
    ///
    /// Yields at most one message per call; `Ok(None)` means more bytes are
    /// needed.
    pub fn decode(&mut self) -> Result<Option<Message>, ProtocolError> {
        match self.decode_frame()? {
            Some(frame) => Ok(Some(self.format.from_payload(&frame.payload)?)),
            None => Ok(None),
        }
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

/// Decodes one message from the front of `buf` without buffering.
///
/// Returns the message (if a whole frame is present) and the number of
/// bytes it consumed.
pub fn decode(
    format: WireFormat,
    buf: &[u8],
    max_frame_size: usize,
) -> Result<(Option<Message>, usize), ProtocolError> {
    match Frame::decode_slice(buf, max_frame_size)? {
        (Some(frame), consumed) => Ok((Some(format.from_payload(&frame.payload)?), consumed)),
        (None, _) => Ok((None, 0)),
    }
}

/// Encodes one message as a complete frame.
pub fn encode(
    format: WireFormat,
    message: &Message,
    max_frame_size: usize,
) -> Result<BytesMut, ProtocolError> {
    Encoder::new(format, max_frame_size).encode(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ErrorResponse, Notification, Request, Response, RpcError};
    use crate::{ErrorCode, DEFAULT_MAX_FRAME_SIZE};
    use proptest::prelude::*;
    use serde_json::json;

    const FORMATS: [WireFormat; 2] = [WireFormat::MsgPack, WireFormat::Json];

    #[test]
    fn test_encoder_decoder_roundtrip() {
        for format in FORMATS {
            let msg = Message::from(Request::new(42, "ping"));
            let encoded = Encoder::new(format, DEFAULT_MAX_FRAME_SIZE)
                .encode(&msg)
                .unwrap();

            let mut decoder = Decoder::new(format, DEFAULT_MAX_FRAME_SIZE);
            decoder.extend(&encoded);
            assert_eq!(decoder.decode().unwrap(), Some(msg));
            assert_eq!(decoder.buffered(), 0);
        }
    }

    #[test]
    fn test_partial_frame_decoding() {
        let msg = Message::from(Response::ok(1, json!({"pong": true})));
        let encoded = encode(WireFormat::MsgPack, &msg, DEFAULT_MAX_FRAME_SIZE).unwrap();

        let mut decoder = Decoder::new(WireFormat::MsgPack, DEFAULT_MAX_FRAME_SIZE);
        for byte in &encoded[..encoded.len() - 1] {
            decoder.extend(std::slice::from_ref(byte));
            assert!(decoder.decode().unwrap().is_none());
        }
        decoder.extend(&encoded[encoded.len() - 1..]);
        assert_eq!(decoder.decode().unwrap(), Some(msg));
    }

    #[test]
    fn test_one_message_per_call() {
        let first = Message::from(Response::partial(5, json!("a")));
        let second = Message::from(Response::ok(5, json!("b")));

        let mut decoder = Decoder::new(WireFormat::Json, DEFAULT_MAX_FRAME_SIZE);
        decoder.extend(&encode(WireFormat::Json, &first, DEFAULT_MAX_FRAME_SIZE).unwrap());
        decoder.extend(&encode(WireFormat::Json, &second, DEFAULT_MAX_FRAME_SIZE).unwrap());

        assert_eq!(decoder.decode().unwrap(), Some(first));
        assert_eq!(decoder.decode().unwrap(), Some(second));
        assert_eq!(decoder.decode().unwrap(), None);
    }

    #[test]
    fn test_stateless_decode_reports_consumed() {
        let msg = Message::from(Notification::pong(1));
        let encoded = encode(WireFormat::MsgPack, &msg, DEFAULT_MAX_FRAME_SIZE).unwrap();

        let (decoded, consumed) =
            decode(WireFormat::MsgPack, &encoded, DEFAULT_MAX_FRAME_SIZE).unwrap();
        assert_eq!(decoded, Some(msg));
        assert_eq!(consumed, encoded.len());

        let (decoded, consumed) =
            decode(WireFormat::MsgPack, &encoded[..3], DEFAULT_MAX_FRAME_SIZE).unwrap();
        assert!(decoded.is_none());
        assert_eq!(consumed, 0);
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let msg = Message::from(Request::new(1, "upload").with_params(json!("x".repeat(128))));
        let encoded = encode(WireFormat::Json, &msg, DEFAULT_MAX_FRAME_SIZE).unwrap();

        let mut decoder = Decoder::new(WireFormat::Json, 64);
        decoder.extend(&encoded);
        assert!(matches!(
            decoder.decode(),
            Err(ProtocolError::FrameTooLarge { max: 64, .. })
        ));

        assert!(matches!(
            encode(WireFormat::Json, &msg, 64),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_malformed_payload() {
        let frame = Frame::new(&b"{not json"[..]).encode(64).unwrap();
        let mut decoder = Decoder::new(WireFormat::Json, 64);
        decoder.extend(&frame);
        let err = decoder.decode().unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedPayload(_)));
        assert!(err.is_framing());
    }

    #[test]
    fn test_wellformed_but_invalid_envelope() {
        let frame = Frame::new(&br#"{"type":"response","result":1}"#[..])
            .encode(64)
            .unwrap();
        let mut decoder = Decoder::new(WireFormat::Json, 64);
        decoder.extend(&frame);
        let err = decoder.decode().unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidEnvelope(_)));
        assert!(!err.is_framing());
    }

    struct Blob(&'static [u8]);

    impl Serialize for Blob {
        fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            serializer.serialize_bytes(self.0)
        }
    }

    #[derive(Serialize)]
    struct RawNotification {
        #[serde(rename = "type")]
        kind: &'static str,
        method: &'static str,
        params: Blob,
    }

    #[test]
    fn test_msgpack_bin_params_are_read_as_byte_array() {
        let payload = rmp_serde::to_vec_named(&RawNotification {
            kind: "notification",
            method: "log",
            params: Blob(&[1, 2, 3]),
        })
        .unwrap();
        let frame = Frame::new(payload).encode(DEFAULT_MAX_FRAME_SIZE).unwrap();

        let mut decoder = Decoder::new(WireFormat::MsgPack, DEFAULT_MAX_FRAME_SIZE);
        decoder.extend(&frame);
        let message = decoder.decode().unwrap().unwrap();
        assert_eq!(
            message,
            Message::from(Notification::new("log", json!([1, 2, 3])))
        );
    }

    #[test]
    fn test_format_switch_keeps_buffered_bytes() {
        let hello = Message::from(Response::ok(1, json!({"wire_format": "msgpack"})));
        let ping = Message::from(Notification::ping(1));

        let mut bytes = encode(WireFormat::Json, &hello, DEFAULT_MAX_FRAME_SIZE).unwrap();
        bytes.extend_from_slice(&encode(WireFormat::MsgPack, &ping, DEFAULT_MAX_FRAME_SIZE).unwrap());

        let mut decoder = Decoder::new(WireFormat::Json, DEFAULT_MAX_FRAME_SIZE);
        decoder.extend(&bytes);
        assert_eq!(decoder.decode().unwrap(), Some(hello));
        decoder.set_format(WireFormat::MsgPack);
        assert_eq!(decoder.decode().unwrap(), Some(ping));
    }

    #[test]
    fn test_wire_format_parsing() {
        assert_eq!("msgpack".parse::<WireFormat>().unwrap(), WireFormat::MsgPack);
        assert_eq!("JSON".parse::<WireFormat>().unwrap(), WireFormat::Json);
        assert!("xml".parse::<WireFormat>().is_err());
        assert_eq!(
            serde_json::to_string(&WireFormat::MsgPack).unwrap(),
            "\"msgpack\""
        );
    }

    fn arb_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(|n| json!(n)),
            "[a-z0-9 ]{0,12}".prop_map(Value::String),
        ];
        leaf.prop_recursive(3, 16, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    fn arb_message() -> impl Strategy<Value = Message> {
        prop_oneof![
            (any::<u64>(), "[a-z.]{1,16}", arb_value())
                .prop_map(|(id, method, params)| {
                    Message::from(Request::new(id, method).with_params(params))
                }),
            ("[a-z.]{1,16}", arb_value())
                .prop_map(|(method, params)| Message::from(Notification::new(method, params))),
            (any::<u64>(), arb_value(), any::<bool>()).prop_map(|(id, result, partial)| {
                if partial {
                    Message::from(Response::partial(id, result))
                } else {
                    Message::from(Response::ok(id, result))
                }
            }),
            (any::<u64>(), any::<i32>(), "[ -~]{0,24}").prop_map(|(id, code, message)| {
                Message::from(ErrorResponse::new(id, RpcError::new(ErrorCode::from(code), message)))
            }),
        ]
    }

    proptest! {
        #[test]
        fn prop_framing_roundtrip(msg in arb_message(), json in any::<bool>()) {
            let format = if json { WireFormat::Json } else { WireFormat::MsgPack };
            let encoded = encode(format, &msg, DEFAULT_MAX_FRAME_SIZE).unwrap();
            let (decoded, consumed) = decode(format, &encoded, DEFAULT_MAX_FRAME_SIZE).unwrap();
            prop_assert_eq!(decoded, Some(msg));
            prop_assert_eq!(consumed, encoded.len());
        }

        #[test]
        fn prop_arbitrary_chunking_yields_same_messages(
            msgs in prop::collection::vec(arb_message(), 1..5),
            chunk in 1usize..17,
        ) {
            let mut wire = Vec::new();
            for msg in &msgs {
                wire.extend_from_slice(&encode(WireFormat::MsgPack, msg, DEFAULT_MAX_FRAME_SIZE).unwrap());
            }

            let mut decoder = Decoder::new(WireFormat::MsgPack, DEFAULT_MAX_FRAME_SIZE);
            let mut out = Vec::new();
            for piece in wire.chunks(chunk) {
                decoder.extend(piece);
                while let Some(msg) = decoder.decode().unwrap() {
                    out.push(msg);
                }
            }
            prop_assert_eq!(out, msgs);
        }
    }
}
