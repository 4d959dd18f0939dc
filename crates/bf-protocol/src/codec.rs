//! Tokio codec for newline-delimited JSON frames
//!
//! Encoding appends a single `\n` after the compact JSON text. serde_json
//! escapes control characters inside strings, so an encoded payload never
//! contains a raw newline.
//!
//! Decoding yields `Result<Frame, DecodeError>` items. A malformed frame is
//! an *item*, not a stream error: `FramedRead` stops after the first
//! decoder error, and one bad frame must not take the tunnel down with it.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio_util::codec::{Decoder, Encoder, FramedRead};

use crate::error::ProtocolError;
use crate::message::{
    HttpRequest, HttpResponse, Message, RegistrationResponse, KIND_HTTP_REQUEST,
    KIND_HTTP_RESPONSE,
};

/// Default upper bound on a single frame (16MB)
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Bytes of an over-long frame kept for diagnostics
const OVERSIZE_PREVIEW: usize = 256;

/// A frame that could not be turned into the expected message
#[derive(Debug, Clone, Error)]
#[error("Malformed frame ({reason}): {}", preview(.raw))]
pub struct DecodeError {
    /// Raw text received (lossy UTF-8)
    pub raw: String,
    /// Why decoding failed
    pub reason: String,
}

impl DecodeError {
    fn new(raw: &[u8], reason: impl Into<String>) -> Self {
        Self {
            raw: String::from_utf8_lossy(raw).into_owned(),
            reason: reason.into(),
        }
    }
}

fn preview(raw: &str) -> String {
    const LIMIT: usize = 120;
    match raw.char_indices().nth(LIMIT) {
        Some((idx, _)) => format!("{}...", &raw[..idx]),
        None => raw.to_string(),
    }
}

/// One structurally valid frame: a JSON object plus the bytes it came from
#[derive(Debug, Clone)]
pub struct Frame {
    fields: Map<String, Value>,
    raw: Bytes,
}

impl Frame {
    /// Parse a single frame (without its terminator)
    pub fn parse(raw: Bytes) -> Result<Self, DecodeError> {
        match serde_json::from_slice::<Value>(&raw) {
            Ok(Value::Object(fields)) => Ok(Self { fields, raw }),
            Ok(_) => Err(DecodeError::new(&raw, "expected a JSON object")),
            Err(e) => Err(DecodeError::new(&raw, e.to_string())),
        }
    }

    /// The frame's discriminator.
    ///
    /// Reads `"kind"`, falling back to `"type"` which older relays use.
    pub fn kind(&self) -> Option<&str> {
        self.fields
            .get("kind")
            .and_then(Value::as_str)
            .or_else(|| self.fields.get("type").and_then(Value::as_str))
    }

    /// Raw bytes of the frame, without the terminator
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    /// Read this frame as a registration ack.
    ///
    /// The ack's discriminator is not fixed, so any `kind` is accepted;
    /// `clientId`, `publicUrl` and `status` are required.
    pub fn into_registration(self) -> Result<RegistrationResponse, DecodeError> {
        let kind = self.kind().unwrap_or_default().to_string();
        let mut response: RegistrationResponse = serde_json::from_value(Value::Object(self.fields))
            .map_err(|e| DecodeError::new(&self.raw, e.to_string()))?;
        response.kind = kind;
        Ok(response)
    }

    /// Read this frame as one of the fixed-discriminator messages
    pub fn into_message(self) -> Result<Message, DecodeError> {
        let kind = match self.kind() {
            Some(kind) => kind.to_string(),
            None => return Err(DecodeError::new(&self.raw, "missing message kind")),
        };

        let mut fields = self.fields;
        fields.insert("kind".to_string(), Value::String(kind));

        serde_json::from_value(Value::Object(fields))
            .map_err(|e| DecodeError::new(&self.raw, e.to_string()))
    }

    /// Read this frame as an `HTTP_REQUEST`
    pub fn into_request(self) -> Result<HttpRequest, DecodeError> {
        let raw = self.raw.clone();
        match self.into_message()? {
            Message::HttpRequest(request) => Ok(request),
            other => Err(DecodeError::new(
                &raw,
                format!("expected {}, got {}", KIND_HTTP_REQUEST, other.kind()),
            )),
        }
    }

    /// Read this frame as an `HTTP_RESPONSE`
    pub fn into_response(self) -> Result<HttpResponse, DecodeError> {
        let raw = self.raw.clone();
        match self.into_message()? {
            Message::HttpResponse(response) => Ok(response),
            other => Err(DecodeError::new(
                &raw,
                format!("expected {}, got {}", KIND_HTTP_RESPONSE, other.kind()),
            )),
        }
    }
}

/// Codec for newline-delimited JSON frames
#[derive(Debug)]
pub struct FrameCodec {
    /// Longest accepted frame, terminator excluded
    max_length: usize,
    /// Where to resume the newline scan in the buffer
    next_index: usize,
    /// Skipping the rest of an over-long frame
    discarding: bool,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Create a new codec with the default frame limit
    pub fn new() -> Self {
        Self::with_max_length(MAX_FRAME_LENGTH)
    }

    /// Create a codec rejecting frames longer than `max_length` bytes
    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
            discarding: false,
        }
    }

    /// Longest accepted frame
    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

/// Strip the terminator and an optional carriage return
fn trim_line(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

impl Decoder for FrameCodec {
    type Item = Result<Frame, DecodeError>;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let read_to = std::cmp::min(self.max_length.saturating_add(1), src.len());
            let newline = src[self.next_index..read_to]
                .iter()
                .position(|b| *b == b'\n');

            match (self.discarding, newline) {
                (true, Some(offset)) => {
                    // End of the over-long frame; it was already reported
                    src.advance(self.next_index + offset + 1);
                    self.discarding = false;
                    self.next_index = 0;
                }
                (true, None) => {
                    src.advance(read_to);
                    self.next_index = 0;
                    if src.is_empty() {
                        return Ok(None);
                    }
                }
                (false, Some(offset)) => {
                    let end = self.next_index + offset + 1;
                    self.next_index = 0;
                    let line = src.split_to(end).freeze();
                    let trimmed = trim_line(&line);

                    if trimmed.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }

                    let raw = line.slice_ref(trimmed);
                    return Ok(Some(Frame::parse(raw)));
                }
                (false, None) if src.len() > self.max_length => {
                    self.discarding = true;
                    self.next_index = 0;
                    let preview_len = std::cmp::min(OVERSIZE_PREVIEW, src.len());
                    return Ok(Some(Err(DecodeError::new(
                        &src[..preview_len],
                        format!("frame exceeds {} bytes", self.max_length),
                    ))));
                }
                (false, None) => {
                    self.next_index = read_to;
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(item) = self.decode(src)? {
            return Ok(Some(item));
        }

        self.next_index = 0;
        if self.discarding || src.iter().all(u8::is_ascii_whitespace) {
            self.discarding = false;
            src.clear();
            return Ok(None);
        }

        let raw = src.split();
        Ok(Some(Err(DecodeError::new(
            &raw,
            "unterminated frame at end of stream",
        ))))
    }
}

impl<T: Serialize> Encoder<T> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = serde_json::to_vec(&item)?;
        dst.reserve(payload.len() + 1);
        dst.extend_from_slice(&payload);
        dst.put_u8(b'\n');
        Ok(())
    }
}

/// Serialize a message into a complete frame, terminator included
pub fn encode<T: Serialize>(message: &T) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    FrameCodec::new().encode(message, &mut buf)?;
    Ok(buf.freeze())
}

/// Lazily decode frames from a byte stream
pub fn decode_stream<R: AsyncRead>(reader: R) -> FramedRead<R, FrameCodec> {
    FramedRead::new(reader, FrameCodec::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Headers, RegistrationRequest, RegistrationStatus};
    use crate::request_id::RequestId;
    use futures::StreamExt;

    fn decode_one(codec: &mut FrameCodec, input: &[u8]) -> Result<Frame, DecodeError> {
        let mut buf = BytesMut::from(input);
        codec.decode(&mut buf).unwrap().expect("expected a frame")
    }

    #[test]
    fn test_encode_appends_single_newline() {
        let frame = encode(&Message::Connect(RegistrationRequest::new(3000))).unwrap();
        assert_eq!(&frame[..], b"{\"kind\":\"CONNECT\",\"localPort\":3000}\n");
    }

    #[test]
    fn test_encoded_body_never_contains_raw_newline() {
        let response = HttpResponse::new(RequestId::new("r1"), 200, Headers::new(), "line1\nline2\r\n");
        let frame = encode(&Message::HttpResponse(response.clone())).unwrap();

        assert_eq!(frame.iter().filter(|b| **b == b'\n').count(), 1);
        assert_eq!(frame.last(), Some(&b'\n'));

        let mut codec = FrameCodec::new();
        let decoded = decode_one(&mut codec, &frame).unwrap().into_response().unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn test_request_frame_roundtrip_is_byte_equal() {
        let wire: &[u8] = b"{\"kind\":\"HTTP_REQUEST\",\"requestId\":\"r1\",\"method\":\"POST\",\"url\":\"/a?b=c\",\"headers\":{\"accept\":\"*/*\",\"x-trace\":\"1\"},\"body\":\"{\\\"k\\\":1}\"}\n";

        let mut codec = FrameCodec::new();
        let message = decode_one(&mut codec, wire).unwrap().into_message().unwrap();
        let encoded = encode(&message).unwrap();

        assert_eq!(&encoded[..], wire);
    }

    #[test]
    fn test_unsorted_headers_reencode_to_equal_message() {
        let wire: &[u8] = b"{\"kind\":\"HTTP_REQUEST\",\"requestId\":\"r1\",\"method\":\"GET\",\"url\":\"/\",\"headers\":{\"x-trace\":\"1\",\"accept\":\"*/*\"},\"body\":\"\"}\n";

        let mut codec = FrameCodec::new();
        let message = decode_one(&mut codec, wire).unwrap().into_message().unwrap();
        let encoded = encode(&message).unwrap();

        assert_ne!(&encoded[..], wire);
        assert!(encoded.starts_with(
            b"{\"kind\":\"HTTP_REQUEST\",\"requestId\":\"r1\",\"method\":\"GET\",\"url\":\"/\",\"headers\":{\"accept\":\"*/*\",\"x-trace\":\"1\"}"
        ));

        let reparsed = decode_one(&mut FrameCodec::new(), &encoded)
            .unwrap()
            .into_message()
            .unwrap();
        assert_eq!(reparsed, message);
    }

    #[test]
    fn test_registration_ack_accepts_any_kind() {
        let mut codec = FrameCodec::new();
        let ack = decode_one(
            &mut codec,
            b"{\"kind\":\"ack\",\"clientId\":\"abc123\",\"publicUrl\":\"https://abc123.example.com\",\"status\":\"success\"}\n",
        )
        .unwrap()
        .into_registration()
        .unwrap();

        assert_eq!(ack.kind, "ack");
        assert_eq!(ack.client_id, "abc123");
        assert_eq!(ack.public_url, "https://abc123.example.com");
        assert_eq!(ack.status, RegistrationStatus::Success);
    }

    #[test]
    fn test_type_field_is_accepted_as_kind() {
        let mut codec = FrameCodec::new();
        let frame = decode_one(
            &mut codec,
            b"{\"type\":\"HTTP_REQUEST\",\"requestId\":\"q\",\"method\":\"GET\",\"url\":\"/\",\"headers\":{},\"body\":\"\"}\n",
        )
        .unwrap();

        assert_eq!(frame.kind(), Some(KIND_HTTP_REQUEST));
        let request = frame.into_request().unwrap();
        assert_eq!(request.request_id, RequestId::new("q"));
    }

    #[test]
    fn test_registration_missing_fields_is_malformed() {
        let mut codec = FrameCodec::new();
        let err = decode_one(&mut codec, b"{\"kind\":\"ack\",\"status\":\"success\"}\n")
            .unwrap()
            .into_registration()
            .unwrap_err();

        assert!(err.reason.contains("clientId"));
        assert_eq!(err.raw, "{\"kind\":\"ack\",\"status\":\"success\"}");
    }

    #[test]
    fn test_request_with_wrong_field_type_is_malformed() {
        let mut codec = FrameCodec::new();
        let err = decode_one(
            &mut codec,
            b"{\"kind\":\"HTTP_REQUEST\",\"requestId\":7,\"method\":\"GET\",\"url\":\"/\"}\n",
        )
        .unwrap()
        .into_request()
        .unwrap_err();

        assert!(err.raw.contains("\"requestId\":7"));
    }

    #[test]
    fn test_partial_read() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&b"{\"kind\":\"ERROR\",\"mess"[..]);

        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"age\":\"Invalid message format\"}\n");
        let message = codec
            .decode(&mut buf)
            .unwrap()
            .unwrap()
            .unwrap()
            .into_message()
            .unwrap();

        assert_eq!(
            message,
            Message::Error {
                message: "Invalid message format".to_string()
            }
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_malformed_frame_does_not_poison_buffer() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&b"not json\r\n\n{\"kind\":\"ERROR\",\"message\":\"x\"}\n"[..]);

        let first = codec.decode(&mut buf).unwrap().unwrap();
        let err = first.unwrap_err();
        assert_eq!(err.raw, "not json");

        let second = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert_eq!(second.kind(), Some("ERROR"));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_non_object_frame_is_malformed() {
        let mut codec = FrameCodec::new();
        let err = decode_one(&mut codec, b"[1,2,3]\n").unwrap_err();
        assert_eq!(err.reason, "expected a JSON object");
    }

    #[test]
    fn test_oversized_frame_is_skipped() {
        let mut codec = FrameCodec::with_max_length(16);
        let mut buf = BytesMut::from(&b"{\"kind\":\"ERROR\",\"message\":\"far too long\"}\n{\"kind\":\"X\"}\n"[..]);

        let err = codec.decode(&mut buf).unwrap().unwrap().unwrap_err();
        assert!(err.reason.contains("exceeds 16 bytes"));

        let next = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert_eq!(next.kind(), Some("X"));
    }

    #[test]
    fn test_unterminated_tail_reported_at_eof() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&b"{\"kind\":\"X\"}\n{\"kind\":"[..]);

        assert!(codec.decode_eof(&mut buf).unwrap().unwrap().is_ok());
        let tail = codec.decode_eof(&mut buf).unwrap().unwrap().unwrap_err();
        assert_eq!(tail.raw, "{\"kind\":");
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_decode_stream_continues_after_errors() {
        let input: &[u8] =
            b"{\"kind\":\"A\"}\ngarbage\n{\"kind\":\"B\"}\n{\"kind\":\"HTTP_REQUEST\"}\n{\"kind\":\"C\"}\n";
        let mut frames = decode_stream(input);

        let mut kinds = Vec::new();
        let mut errors = 0;
        while let Some(item) = frames.next().await {
            match item.unwrap() {
                Ok(frame) => match frame.kind().map(str::to_string) {
                    Some(kind) if kind == KIND_HTTP_REQUEST => {
                        assert!(frame.into_request().is_err());
                        errors += 1;
                    }
                    Some(kind) => kinds.push(kind),
                    None => unreachable!(),
                },
                Err(_) => errors += 1,
            }
        }

        assert_eq!(kinds, vec!["A", "B", "C"]);
        assert_eq!(errors, 2);
    }
}
