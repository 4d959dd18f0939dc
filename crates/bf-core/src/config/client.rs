//! Tunnel client configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::serde_utils::duration_secs;
use crate::error::ConfigError;

/// Configuration for the tunnel client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Relay server host
    pub relay_host: String,

    /// Relay server TCP port
    pub relay_port: u16,

    /// Host of the local HTTP service
    pub local_host: String,

    /// Port of the local HTTP service, announced to the relay at registration
    pub local_port: u16,

    /// Timeout for opening the relay connection
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// How long to wait for the registration ack
    #[serde(with = "duration_secs")]
    pub handshake_timeout: Duration,

    /// Bound on each call to the local service, body read included
    #[serde(with = "duration_secs")]
    pub forward_timeout: Duration,

    /// Maximum concurrent forwards (unbounded when unset)
    pub max_in_flight: Option<usize>,

    /// How long in-flight forwards may run after the tunnel closes
    #[serde(with = "duration_secs")]
    pub shutdown_grace: Duration,

    /// Longest inbound frame accepted, in bytes
    pub max_frame_length: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_host: "localhost".to_string(),
            relay_port: 8080,
            local_host: "127.0.0.1".to_string(),
            local_port: 3000,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(30),
            forward_timeout: Duration::from_secs(30),
            max_in_flight: None,
            shutdown_grace: Duration::from_secs(5),
            max_frame_length: bf_protocol::MAX_FRAME_LENGTH,
        }
    }
}

impl ClientConfig {
    /// Relay address as `host:port`
    pub fn relay_address(&self) -> String {
        format!("{}:{}", self.relay_host, self.relay_port)
    }

    /// Base URL of the local service, without a trailing slash
    pub fn local_base_url(&self) -> String {
        if self.local_host.contains(':') && !self.local_host.starts_with('[') {
            // Bare IPv6 literal
            format!("http://[{}]:{}", self.local_host, self.local_port)
        } else {
            format!("http://{}:{}", self.local_host, self.local_port)
        }
    }

    /// Check the configuration for values that cannot work
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.relay_host.trim().is_empty() {
            return Err(ConfigError::Invalid("relay_host must not be empty".to_string()));
        }
        if self.relay_port == 0 {
            return Err(ConfigError::Invalid("relay_port must not be 0".to_string()));
        }
        if self.local_host.trim().is_empty() {
            return Err(ConfigError::Invalid("local_host must not be empty".to_string()));
        }
        if self.local_port == 0 {
            return Err(ConfigError::Invalid("local_port must not be 0".to_string()));
        }
        if self.max_in_flight == Some(0) {
            return Err(ConfigError::Invalid(
                "max_in_flight must be at least 1 when set".to_string(),
            ));
        }
        if self.max_frame_length == 0 {
            return Err(ConfigError::Invalid("max_frame_length must not be 0".to_string()));
        }
        Ok(())
    }
}
