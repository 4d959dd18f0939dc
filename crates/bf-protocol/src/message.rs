//! Message types for the bifrost tunnel protocol
//!
//! Every frame on the wire is a single JSON object terminated by `\n`.
//! The object carries a `"kind"` discriminator plus camelCase fields.
//!
//! # Message Flow
//!
//! 1. Client connects and sends `CONNECT` with the local port it exposes
//! 2. Relay answers with a registration ack carrying `clientId`,
//!    `publicUrl` and `status`
//! 3. Relay sends `HTTP_REQUEST` frames, each tagged with a `requestId`
//! 4. Client answers every request with exactly one `HTTP_RESPONSE`
//!    echoing the same `requestId`, in whatever order they complete
//!
//! The registration ack is the only frame whose `kind` is not fixed; the
//! client reads it positionally as the first frame after `CONNECT`.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

use crate::request_id::RequestId;

/// Discriminator of the registration request
pub const KIND_CONNECT: &str = "CONNECT";
/// Discriminator of a proxied request
pub const KIND_HTTP_REQUEST: &str = "HTTP_REQUEST";
/// Discriminator of a proxied response
pub const KIND_HTTP_RESPONSE: &str = "HTTP_RESPONSE";
/// Discriminator of a relay error notice
pub const KIND_ERROR: &str = "ERROR";

/// HTTP header map carried in request and response frames.
///
/// Single-valued: multi-valued headers are collapsed before they get here.
/// Keys are kept sorted, so re-encoding a frame reproduces its exact bytes
/// only when the sender wrote header keys in sorted order and fields in
/// declaration order. Other frames re-encode to an equal message.
pub type Headers = BTreeMap<String, String>;

/// Registration request sent once after the transport opens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationRequest {
    /// Port of the local HTTP service being exposed
    pub local_port: u16,
}

impl RegistrationRequest {
    /// Create a new registration request
    pub fn new(local_port: u16) -> Self {
        Self { local_port }
    }
}

/// Outcome reported by the relay in its registration ack
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RegistrationStatus {
    /// `"success"`
    Success,
    /// Any other status string, kept verbatim
    Failure(String),
}

impl RegistrationStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, RegistrationStatus::Success)
    }
}

impl From<String> for RegistrationStatus {
    fn from(status: String) -> Self {
        if status == "success" {
            RegistrationStatus::Success
        } else {
            RegistrationStatus::Failure(status)
        }
    }
}

impl From<RegistrationStatus> for String {
    fn from(status: RegistrationStatus) -> Self {
        match status {
            RegistrationStatus::Success => "success".to_string(),
            RegistrationStatus::Failure(other) => other,
        }
    }
}

impl fmt::Display for RegistrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistrationStatus::Success => f.write_str("success"),
            RegistrationStatus::Failure(other) => f.write_str(other),
        }
    }
}

/// Registration ack sent by the relay in reply to `CONNECT`.
///
/// `client_id` and `public_url` are opaque: they are stored and surfaced,
/// never parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationResponse {
    /// Discriminator as sent by the relay (not interpreted)
    #[serde(default)]
    pub kind: String,
    /// Relay-assigned client identifier
    pub client_id: String,
    /// Public URL routed to this client
    pub public_url: String,
    /// Whether the registration was accepted
    pub status: RegistrationStatus,
}

impl RegistrationResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// An HTTP request the relay wants proxied to the local service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequest {
    /// Correlation id to echo in the response
    pub request_id: RequestId,
    /// HTTP method, copied verbatim
    pub method: String,
    /// Path and query only (no scheme or host)
    pub url: String,
    /// Request headers
    #[serde(default, deserialize_with = "lenient_headers")]
    pub headers: Headers,
    /// Request body as text (may be empty)
    #[serde(default)]
    pub body: String,
}

/// The local service's answer to an [`HttpRequest`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpResponse {
    /// Correlation id of the originating request
    pub request_id: RequestId,
    /// HTTP status code
    pub status_code: u16,
    /// First value of each response header
    #[serde(default, deserialize_with = "lenient_headers")]
    pub headers: Headers,
    /// Response body as text
    #[serde(default)]
    pub body: String,
}

impl HttpResponse {
    /// Create a new response
    pub fn new(
        request_id: RequestId,
        status_code: u16,
        headers: Headers,
        body: impl Into<String>,
    ) -> Self {
        Self {
            request_id,
            status_code,
            headers,
            body: body.into(),
        }
    }
}

/// Protocol messages with a fixed discriminator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Message {
    /// Client registration (client → relay)
    #[serde(rename = "CONNECT")]
    Connect(RegistrationRequest),

    /// Request to proxy (relay → client)
    #[serde(rename = "HTTP_REQUEST")]
    HttpRequest(HttpRequest),

    /// Proxied response (client → relay)
    #[serde(rename = "HTTP_RESPONSE")]
    HttpResponse(HttpResponse),

    /// Error notice (relay → client)
    #[serde(rename = "ERROR")]
    Error {
        /// Human-readable description
        message: String,
    },
}

impl Message {
    /// Get the wire discriminator for this message
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Connect(_) => KIND_CONNECT,
            Message::HttpRequest(_) => KIND_HTTP_REQUEST,
            Message::HttpResponse(_) => KIND_HTTP_RESPONSE,
            Message::Error { .. } => KIND_ERROR,
        }
    }
}

/// Deserialize a header map, dropping entries whose value is not a string.
///
/// Relays built on loosely typed runtimes may send arrays or numbers for
/// some headers; those are logged and left out rather than failing the
/// whole frame.
fn lenient_headers<'de, D>(deserializer: D) -> Result<Headers, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<BTreeMap<String, serde_json::Value>>::deserialize(deserializer)?;

    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .filter_map(|(name, value)| match value {
            serde_json::Value::String(value) => Some((name, value)),
            other => {
                tracing::warn!(header = %name, value = %other, "Dropping non-string header value");
                None
            }
        })
        .collect())
}
