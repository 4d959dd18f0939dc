//! bf-protocol: Wire protocol for the bifrost reverse tunnel
//!
//! This crate defines the newline-delimited JSON frames exchanged between
//! the tunnel client and the relay server over a single TCP connection.

pub mod codec;
pub mod error;
pub mod message;
pub mod request_id;

pub use codec::{DecodeError, Frame, FrameCodec, MAX_FRAME_LENGTH};
pub use error::ProtocolError;
pub use message::{
    Headers, HttpRequest, HttpResponse, Message, RegistrationRequest, RegistrationResponse,
    RegistrationStatus, KIND_CONNECT, KIND_ERROR, KIND_HTTP_REQUEST, KIND_HTTP_RESPONSE,
};
pub use request_id::RequestId;
