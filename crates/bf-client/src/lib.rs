//! bf-client: Reverse-tunnel client for bifrost
//!
//! The client opens one outbound connection to a relay server, registers
//! a local HTTP service, and proxies the requests the relay sends over that
//! connection to the service, multiplexed by request id.

pub mod forwarder;
pub mod tunnel;

pub use forwarder::{Forward, ForwardError, LocalForwarder};
pub use tunnel::{ConnectedTunnel, Session, SessionError, SessionState, TunnelClient, TunnelError};
