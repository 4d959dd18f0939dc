//! Outbound tunnel controller
//!
//! Opens the relay connection, registers the local service and drives the
//! session until the relay goes away or shutdown is requested. There is no
//! reconnection: losing the transport ends the tunnel.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use bf_core::{ClientConfig, ConfigError};
use bf_protocol::RegistrationResponse;

use super::session::{Session, SessionError, SessionOptions, SessionSummary};
use crate::forwarder::{Forward, LocalForwarder};

/// Errors establishing or running a tunnel
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Configuration cannot be used
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// HTTP client for the local service could not be built
    #[error("Failed to build local HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Relay could not be reached
    #[error("Failed to connect to relay at {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// Relay did not accept the connection in time
    #[error("Connecting to relay at {address} timed out after {after:?}")]
    Timeout { address: String, after: Duration },

    /// Handshake or transport failure
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Establishes tunnels to the relay configured in [`ClientConfig`]
pub struct TunnelClient {
    config: ClientConfig,
}

impl TunnelClient {
    /// Create a new tunnel client
    pub fn new(config: ClientConfig) -> Result<Self, TunnelError> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Get the client configuration
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Connect to the relay over TCP and register the local service
    pub async fn connect(&self) -> Result<ConnectedTunnel<TcpStream>, TunnelError> {
        let address = self.config.relay_address();
        let after = self.config.connect_timeout;

        tracing::debug!("Connecting to relay at {}", address);
        let stream = tokio::time::timeout(after, TcpStream::connect(&address))
            .await
            .map_err(|_| TunnelError::Timeout {
                address: address.clone(),
                after,
            })?
            .map_err(|source| TunnelError::Connect {
                address: address.clone(),
                source,
            })?;

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Could not set TCP_NODELAY: {}", e);
        }
        tracing::info!("Connected to relay at {}", address);

        let forwarder = Arc::new(LocalForwarder::from_config(&self.config)?);
        self.establish(stream, forwarder).await
    }

    /// Register over an already open transport, forwarding with `forwarder`
    pub async fn establish<T>(
        &self,
        transport: T,
        forwarder: Arc<dyn Forward>,
    ) -> Result<ConnectedTunnel<T>, TunnelError>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let mut session = Session::new(
            transport,
            self.config.local_port,
            SessionOptions::from(&self.config),
        );
        session.handshake().await?;

        Ok(ConnectedTunnel { session, forwarder })
    }
}

/// A registered tunnel, ready to serve requests
pub struct ConnectedTunnel<T> {
    session: Session<T>,
    forwarder: Arc<dyn Forward>,
}

impl<T> ConnectedTunnel<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    /// The relay's registration ack
    pub fn registration(&self) -> Option<&RegistrationResponse> {
        self.session.registration()
    }

    /// Relay-assigned client id
    pub fn client_id(&self) -> &str {
        self.session.client_id().unwrap_or_default()
    }

    /// Public URL routed to this tunnel
    pub fn public_url(&self) -> &str {
        self.session.public_url().unwrap_or_default()
    }

    /// Serve requests until the relay closes the connection or `shutdown`
    /// is cancelled
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<SessionSummary, TunnelError> {
        let summary = self.session.run(Arc::clone(&self.forwarder), shutdown).await?;
        Ok(summary)
    }
}
