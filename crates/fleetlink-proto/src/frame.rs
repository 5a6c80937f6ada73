//! The frame envelope and its MessagePack codec.

use std::collections::HashMap;
use std::io::Cursor;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Errors produced by the frame codec.
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("Frame encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("Frame decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Self-describing message envelope exchanged over the relay.
///
/// `sid` is empty for pre-session frames (e.g. the device watchdog
/// ping). `props` carries per-kind metadata such as file paths and
/// permissions; `body` is the opaque payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub proto: u16,
    #[serde(rename = "type")]
    pub typ: String,
    #[serde(default)]
    pub sid: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub props: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Bytes::is_empty")]
    pub body: Bytes,
}

impl Frame {
    pub fn new(proto: u16, typ: &str) -> Self {
        Self {
            proto,
            typ: typ.to_string(),
            sid: String::new(),
            props: HashMap::new(),
            body: Bytes::new(),
        }
    }

    #[must_use]
    pub fn with_session(mut self, sid: &str) -> Self {
        self.sid = sid.to_string();
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    #[must_use]
    pub fn with_prop(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.props.insert(key.to_string(), value.into());
        self
    }

    /// String property, when present and a string.
    pub fn prop_str(&self, key: &str) -> Option<&str> {
        self.props.get(key).and_then(Value::as_str)
    }

    /// Integer property, when present and numeric.
    pub fn prop_i64(&self, key: &str) -> Option<i64> {
        self.props.get(key).and_then(Value::as_i64)
    }

    pub fn is_kind(&self, proto: u16, typ: &str) -> bool {
        self.proto == proto && self.typ == typ
    }
}

/// Encode a frame as a self-describing MessagePack map.
pub fn encode(frame: &Frame) -> Result<Vec<u8>, ProtoError> {
    Ok(rmp_serde::to_vec_named(frame)?)
}

/// Decode a single frame from a byte slice.
pub fn decode(bytes: &[u8]) -> Result<Frame, ProtoError> {
    Ok(rmp_serde::from_slice(bytes)?)
}

/// Iterator over frames concatenated in a single byte stream, as
/// stored in session recordings.
pub struct FrameStream<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> FrameStream<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(bytes),
        }
    }
}

impl Iterator for FrameStream<'_> {
    type Item = Result<Frame, ProtoError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor.position() >= self.cursor.get_ref().len() as u64 {
            return None;
        }
        Some(rmp_serde::decode::from_read(&mut self.cursor).map_err(ProtoError::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MSG_PING, MSG_SHELL_DATA, PROP_PATH, PROTO_FILE_TRANSFER, PROTO_SHELL};

    #[test]
    fn roundtrip_shell_data() {
        let frame = Frame::new(PROTO_SHELL, MSG_SHELL_DATA)
            .with_session("0ff7cda3-a398-43b0-9776-6622cb6aa110")
            .with_body(&b"ls -al\r\n"[..]);

        let encoded = encode(&frame).unwrap();
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn roundtrip_props() {
        let frame = Frame::new(PROTO_FILE_TRANSFER, "get_file")
            .with_session("sid-1")
            .with_prop(PROP_PATH, "/etc/hosts")
            .with_prop("uid", 1000);

        let decoded = decode(&encode(&frame).unwrap()).unwrap();
        assert_eq!(decoded.prop_str(PROP_PATH), Some("/etc/hosts"));
        assert_eq!(decoded.prop_i64("uid"), Some(1000));
    }

    #[test]
    fn missing_optional_fields_default() {
        let frame = Frame::new(PROTO_SHELL, MSG_PING);
        let decoded = decode(&encode(&frame).unwrap()).unwrap();
        assert!(decoded.sid.is_empty());
        assert!(decoded.props.is_empty());
        assert!(decoded.body.is_empty());
    }

    #[test]
    fn frame_stream_yields_concatenated_frames() {
        let first = Frame::new(PROTO_SHELL, MSG_SHELL_DATA)
            .with_session("s")
            .with_body(&b"hello\n"[..]);
        let second = Frame::new(PROTO_SHELL, MSG_SHELL_DATA)
            .with_session("s")
            .with_body(&b"world\n"[..]);

        let mut stream = Vec::new();
        stream.extend(encode(&first).unwrap());
        stream.extend(encode(&second).unwrap());

        let frames: Vec<Frame> = FrameStream::new(&stream).map(Result::unwrap).collect();
        assert_eq!(frames, vec![first, second]);
    }

    #[test]
    fn decode_garbage_is_an_error() {
        assert!(decode(&[0xc1, 0xff, 0x00]).is_err());
    }
}
