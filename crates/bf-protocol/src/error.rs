//! Protocol error types

use thiserror::Error;

/// Errors that end a framed stream.
///
/// Malformed frames are not represented here; they surface as
/// [`DecodeError`](crate::DecodeError) items so the stream keeps going.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Serialization error while encoding an outbound frame
    #[error("Serialization error: {0}")]
    Encode(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
