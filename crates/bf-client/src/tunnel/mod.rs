//! Tunnel management for the relay connection

mod client;
mod session;
mod writer;

pub use client::{ConnectedTunnel, TunnelClient, TunnelError};
pub use session::{
    CloseReason, Session, SessionError, SessionOptions, SessionState, SessionSummary,
};
pub use writer::FrameWriter;
