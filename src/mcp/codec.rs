//! Envelope codec: JSON encoding, structural validation and line framing.

use bytes::{BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, Result};
use crate::mcp::protocol::*;

/// Decode a single envelope from raw bytes.
pub fn decode(bytes: &[u8]) -> Result<Message> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| Error::Decode(e.to_string()))?;
    decode_value(value)
}

/// Classify and validate an already-parsed JSON value.
pub fn decode_value(value: Value) -> Result<Message> {
    let object = match &value {
        Value::Object(map) => map,
        Value::Array(_) => {
            return Err(Error::SchemaViolation(
                "batch messages are not supported".to_string(),
            ))
        }
        other => {
            return Err(Error::SchemaViolation(format!(
                "expected a JSON object, found {}",
                kind_of(other)
            )))
        }
    };

    if let Some(version) = object.get("jsonrpc") {
        if version.as_str() != Some(JSONRPC_VERSION) {
            return Err(Error::SchemaViolation(format!(
                "unsupported jsonrpc version: {version}"
            )));
        }
    }

    let has_id = object.contains_key("id");
    let has_method = object.contains_key("method");
    let has_result = object.contains_key("result");
    let has_error = object.contains_key("error");

    if has_method {
        if has_result || has_error {
            return Err(Error::SchemaViolation(
                "message carries both a method and a result or error".to_string(),
            ));
        }
        return if has_id {
            typed(value).map(Message::Request)
        } else {
            typed(value).map(Message::Notification)
        };
    }

    match (has_result, has_error) {
        (true, true) => Err(Error::SchemaViolation(
            "response has both result and error".to_string(),
        )),
        (true, false) | (false, true) if !has_id => Err(Error::SchemaViolation(
            "missing field `id`".to_string(),
        )),
        (true, false) | (false, true) => typed(value).map(Message::Response),
        (false, false) if has_id => Err(Error::SchemaViolation(
            "response has neither result nor error".to_string(),
        )),
        (false, false) => Err(Error::SchemaViolation("missing field `method`".to_string())),
    }
}

fn typed<T: DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| Error::SchemaViolation(e.to_string()))
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Encode an envelope.
pub fn encode(message: &Message) -> Result<Vec<u8>> {
    Ok(match message {
        Message::Request(req) => serde_json::to_vec(req)?,
        Message::Notification(notif) => serde_json::to_vec(notif)?,
        Message::Response(resp) => {
            check_response(resp)?;
            serde_json::to_vec(resp)?
        }
    })
}

/// Encode an envelope as a UTF-8 string (SSE `data:` payloads).
pub fn encode_to_string(message: &Message) -> Result<String> {
    Ok(match message {
        Message::Request(req) => serde_json::to_string(req)?,
        Message::Notification(notif) => serde_json::to_string(notif)?,
        Message::Response(resp) => {
            check_response(resp)?;
            serde_json::to_string(resp)?
        }
    })
}

fn check_response(resp: &JsonRpcResponse) -> Result<()> {
    if resp.result.is_some() == resp.error.is_some() {
        return Err(Error::SchemaViolation(
            "response must carry exactly one of result and error".to_string(),
        ));
    }
    Ok(())
}

/// Best-effort recovery of the `id` of a frame that failed to decode.
pub fn salvage_id(bytes: &[u8]) -> Option<RequestId> {
    let value: Map<String, Value> = serde_json::from_slice(bytes).ok()?;
    serde_json::from_value(value.get("id")?.clone()).ok()
}

/// The error response sent back for a frame that could not be decoded.
pub fn rejection(bytes: &[u8], error: &Error) -> JsonRpcResponse {
    JsonRpcResponse::failure(salvage_id(bytes), error.to_rpc_error())
}

/// One newline-delimited frame read from a byte stream.
#[derive(Debug)]
pub enum Frame {
    Message(Message),
    /// The frame was delimited correctly but its content is not a valid envelope.
    Invalid(JsonRpcResponse),
}

impl Frame {
    fn parse(bytes: &[u8]) -> Self {
        match decode(bytes) {
            Ok(message) => Self::Message(message),
            Err(e) => Self::Invalid(rejection(bytes, &e)),
        }
    }
}

/// Newline-delimited JSON-RPC codec for byte streams such as stdio.
///
/// A bad frame yields [`Frame::Invalid`] and the stream continues. A frame
/// longer than `max_length` is unrecoverable and yields [`Error::FrameTooLarge`].
#[derive(Debug, Clone)]
pub struct JsonRpcCodec {
    max_length: usize,
    scanned: usize,
}

impl JsonRpcCodec {
    pub fn new(max_length: usize) -> Self {
        Self {
            max_length,
            scanned: 0,
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

impl Decoder for JsonRpcCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        loop {
            let newline = src[self.scanned..].iter().position(|b| *b == b'\n');
            let Some(offset) = newline else {
                self.scanned = src.len();
                if src.len() > self.max_length {
                    return Err(Error::FrameTooLarge {
                        max: self.max_length,
                    });
                }
                return Ok(None);
            };

            let end = self.scanned + offset;
            self.scanned = 0;
            if end > self.max_length {
                return Err(Error::FrameTooLarge {
                    max: self.max_length,
                });
            }

            let line = src.split_to(end + 1);
            let line = line[..end].trim_ascii();
            if line.is_empty() {
                continue;
            }
            return Ok(Some(Frame::parse(line)));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        self.scanned = 0;
        let rest = src.split_to(src.len());
        let rest = rest.trim_ascii();
        if rest.is_empty() {
            Ok(None)
        } else {
            Ok(Some(Frame::parse(rest)))
        }
    }
}

impl Encoder<Message> for JsonRpcCodec {
    type Error = Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        let bytes = encode(&item)?;
        dst.reserve(bytes.len() + 1);
        dst.extend_from_slice(&bytes);
        dst.put_u8(b'\n');
        Ok(())
    }
}
