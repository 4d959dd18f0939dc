//! bf-core: Configuration and shared types for bifrost
//!
//! This crate holds the client configuration model and the loading logic
//! shared by the tunnel library and the `bifrost` binary.

pub mod config;
pub mod error;

pub use config::ClientConfig;
pub use error::ConfigError;
