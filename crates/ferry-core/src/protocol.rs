//! Wire protocol definitions
//!
//! A message on the wire is a 4-byte big-endian length followed by a
//! JSON body `{ "type": u8, "payload": base64 }`. The payload blob is
//! itself a JSON-encoded struct for typed messages, raw UTF-8 for
//! `Error`, and empty for bare markers like `FileEnd` and `Complete`.

use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};

use crate::error::TransferError;
use crate::MAX_MESSAGE_SIZE;

/// All message kinds, in wire order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum MessageKind {
    Manifest = 0,
    Resume = 1,
    FileStart = 2,
    FileEnd = 3,
    Complete = 4,
    Error = 5,
    Handshake = 6,
    HandshakeAck = 7,
}

impl From<MessageKind> for u8 {
    fn from(kind: MessageKind) -> u8 {
        kind as u8
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, String> {
        match value {
            0 => Ok(MessageKind::Manifest),
            1 => Ok(MessageKind::Resume),
            2 => Ok(MessageKind::FileStart),
            3 => Ok(MessageKind::FileEnd),
            4 => Ok(MessageKind::Complete),
            5 => Ok(MessageKind::Error),
            6 => Ok(MessageKind::Handshake),
            7 => Ok(MessageKind::HandshakeAck),
            other => Err(format!("unknown message type: {other}")),
        }
    }
}

/// A single framed message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(
        default,
        skip_serializing_if = "Vec::is_empty",
        serialize_with = "payload_encode",
        deserialize_with = "payload_decode"
    )]
    pub payload: Vec<u8>,
}

impl Frame {
    /// A frame with no payload (`FileEnd`, `Complete`).
    pub fn bare(kind: MessageKind) -> Self {
        Self {
            kind,
            payload: Vec::new(),
        }
    }

    /// A frame carrying raw payload bytes (`Error`).
    pub fn raw(kind: MessageKind, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    /// A frame whose payload is the JSON encoding of `body`.
    pub fn json<T: Serialize>(kind: MessageKind, body: &T) -> Result<Self, TransferError> {
        let payload = serde_json::to_vec(body)
            .map_err(|e| TransferError::protocol(format!("encode {kind:?} payload: {e}")))?;
        Ok(Self { kind, payload })
    }

    /// Decode the payload as JSON into `T`.
    pub fn decode_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, TransferError> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| TransferError::protocol(format!("malformed {:?} payload: {e}", self.kind)))
    }
}

fn payload_encode<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
    use base64::Engine;
    ser.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
}

fn payload_decode<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
    use base64::Engine;
    let encoded = String::deserialize(de)?;
    base64::engine::general_purpose::STANDARD
        .decode(encoded.as_bytes())
        .map_err(D::Error::custom)
}

/// Handshake sent by the receiver to open a transfer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HandshakePayload {
    pub code: String,
}

/// Sender's reply to a valid handshake.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HandshakeAckPayload {
    pub compress: bool,
}

/// Trusted resume offsets, keyed by manifest path. Files at offset 0
/// are omitted; a missing key means "start from zero".
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResumePayload {
    #[serde(default)]
    pub files: std::collections::BTreeMap<String, u64>,
}

/// Announces one file's byte stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileStartPayload {
    pub path: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub offset: u64,
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

/// Serialize a frame with its length prefix.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, TransferError> {
    let body = serde_json::to_vec(frame)
        .map_err(|e| TransferError::protocol(format!("encode frame: {e}")))?;
    if body.len() > MAX_MESSAGE_SIZE {
        return Err(TransferError::protocol(format!(
            "message too large: {} > {MAX_MESSAGE_SIZE}",
            body.len()
        )));
    }

    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Parse a frame body (without the length prefix).
pub fn decode_frame(body: &[u8]) -> Result<Frame, TransferError> {
    serde_json::from_slice(body)
        .map_err(|e| TransferError::protocol(format!("malformed frame: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip_all_kinds() {
        let frames = [
            Frame::json(
                MessageKind::Handshake,
                &HandshakePayload {
                    code: "123-456".into(),
                },
            )
            .unwrap(),
            Frame::json(MessageKind::HandshakeAck, &HandshakeAckPayload { compress: true })
                .unwrap(),
            Frame::json(MessageKind::Resume, &ResumePayload::default()).unwrap(),
            Frame::json(
                MessageKind::FileStart,
                &FileStartPayload {
                    path: "a/b.txt".into(),
                    size: 42,
                    offset: 7,
                },
            )
            .unwrap(),
            Frame::bare(MessageKind::FileEnd),
            Frame::bare(MessageKind::Complete),
            Frame::raw(MessageKind::Error, &b"invalid connection code"[..]),
        ];

        for frame in frames {
            let bytes = encode_frame(&frame).unwrap();
            let len = u32::from_be_bytes(bytes[..4].try_into().unwrap()) as usize;
            assert_eq!(len, bytes.len() - 4);
            let decoded = decode_frame(&bytes[4..]).unwrap();
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn test_payload_is_base64_in_json() {
        let frame = Frame::raw(MessageKind::Error, &b"boom"[..]);
        let json = serde_json::to_string(&frame).unwrap();
        assert_eq!(json, r#"{"type":5,"payload":"Ym9vbQ=="}"#);
    }

    #[test]
    fn test_empty_payload_is_omitted() {
        let frame = Frame::bare(MessageKind::Complete);
        let json = serde_json::to_string(&frame).unwrap();
        assert_eq!(json, r#"{"type":4}"#);
        let back: Frame = serde_json::from_str(&json).unwrap();
        assert!(back.payload.is_empty());
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let err = decode_frame(br#"{"type":99}"#).unwrap_err();
        assert!(matches!(err, TransferError::Protocol(_)));
    }

    #[test]
    fn test_typed_payload_roundtrip() {
        let mut resume = ResumePayload::default();
        resume.files.insert("dir/file.bin".into(), 512 * 1024);
        let frame = Frame::json(MessageKind::Resume, &resume).unwrap();
        let back: ResumePayload = frame.decode_payload().unwrap();
        assert_eq!(back, resume);
    }

    #[test]
    fn test_file_start_offset_is_optional() {
        let start: FileStartPayload =
            serde_json::from_str(r#"{"path":"x","size":10}"#).unwrap();
        assert_eq!(start.offset, 0);
    }
}
