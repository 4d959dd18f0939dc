//! Tunnel session: handshake, receive loop and concurrent dispatch
//!
//! A session owns one transport to the relay. It registers the local port,
//! then reads frames until the transport closes, handing every
//! `HTTP_REQUEST` to a forwarder task. Responses are written back through a
//! shared [`FrameWriter`] as the tasks complete, in any order.
//!
//! State machine:
//!
//! ```text
//! Disconnected --handshake()--> Handshaking --ack ok--> Active --EOF/error/cancel--> Closed
//!                                    |                                                 ^
//!                                    +------------- bad/missing ack, I/O error --------+
//! ```

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::Semaphore;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use bf_core::ClientConfig;
use bf_protocol::{
    DecodeError, Frame, FrameCodec, Headers, HttpRequest, HttpResponse, Message, ProtocolError,
    RegistrationRequest, RegistrationResponse, KIND_ERROR, KIND_HTTP_REQUEST,
};

use super::writer::FrameWriter;
use crate::forwarder::{Forward, ERROR_HEADER};

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transport open, nothing sent yet
    Disconnected,
    /// Registration sent, waiting for the ack
    Handshaking,
    /// Registered; the receive loop may run
    Active,
    /// Terminal
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Handshaking => "handshaking",
            SessionState::Active => "active",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Errors that end a session
#[derive(Debug, Error)]
pub enum SessionError {
    /// Reading or writing the transport failed
    #[error("Transport error: {0}")]
    Transport(#[from] ProtocolError),

    /// No registration ack within the handshake timeout
    #[error("No registration response within {0:?}")]
    HandshakeTimeout(Duration),

    /// The relay closed the connection before acknowledging registration
    #[error("Relay closed the connection during handshake")]
    HandshakeClosed,

    /// The registration ack could not be decoded
    #[error("Malformed registration response: {0}")]
    MalformedRegistration(DecodeError),

    /// The relay answered registration with a non-success status
    #[error("Registration rejected by relay (status: {status})")]
    Rejected { status: String },

    /// The relay answered registration with an error notice
    #[error("Relay error during handshake: {0}")]
    Relay(String),

    /// Operation not valid in the current state
    #[error("Operation not allowed while session is {0}")]
    InvalidState(SessionState),
}

/// Tunables for a session
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// How long to wait for the registration ack
    pub handshake_timeout: Duration,
    /// Maximum concurrent forwards (unbounded when `None`)
    pub max_in_flight: Option<usize>,
    /// How long in-flight forwards may run after the loop exits
    pub shutdown_grace: Duration,
    /// Longest inbound frame accepted
    pub max_frame_length: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from(&ClientConfig::default())
    }
}

impl From<&ClientConfig> for SessionOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            handshake_timeout: config.handshake_timeout,
            max_in_flight: config.max_in_flight,
            shutdown_grace: config.shutdown_grace,
            max_frame_length: config.max_frame_length,
        }
    }
}

/// Why the receive loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The relay closed the transport
    EndOfStream,
    /// Shutdown was requested locally
    Cancelled,
}

/// What happened during a session's receive loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    /// Requests handed to the forwarder
    pub requests: u64,
    /// Frames skipped because they could not be decoded
    pub decode_errors: u64,
    /// Frames skipped because their kind is not handled
    pub ignored: u64,
    /// Forwards dropped unanswered when the shutdown grace period ran out
    pub abandoned: u64,
    /// Why the loop stopped
    pub close_reason: CloseReason,
}

/// A tunnel session over one transport
pub struct Session<T> {
    local_port: u16,
    options: SessionOptions,
    state: SessionState,
    frames: FramedRead<ReadHalf<T>, FrameCodec>,
    writer: FrameWriter<WriteHalf<T>>,
    registration: Option<RegistrationResponse>,
}

impl<T> Session<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Take ownership of an open transport
    pub fn new(transport: T, local_port: u16, options: SessionOptions) -> Self {
        let (read_half, write_half) = tokio::io::split(transport);
        let codec = FrameCodec::with_max_length(options.max_frame_length);

        Self {
            local_port,
            options,
            state: SessionState::Disconnected,
            frames: FramedRead::new(read_half, codec),
            writer: FrameWriter::new(write_half),
            registration: None,
        }
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The relay's registration ack, once the handshake succeeded
    pub fn registration(&self) -> Option<&RegistrationResponse> {
        self.registration.as_ref()
    }

    /// Relay-assigned client id, once registered
    pub fn client_id(&self) -> Option<&str> {
        self.registration.as_ref().map(|r| r.client_id.as_str())
    }

    /// Public URL routed to this client, once registered
    pub fn public_url(&self) -> Option<&str> {
        self.registration.as_ref().map(|r| r.public_url.as_str())
    }

    /// Register with the relay.
    ///
    /// Sends `CONNECT` and waits for the ack. On success the session is
    /// `Active`; on any failure it is `Closed` and can never process requests.
    pub async fn handshake(&mut self) -> Result<&RegistrationResponse, SessionError> {
        if self.state != SessionState::Disconnected {
            return Err(SessionError::InvalidState(self.state));
        }
        self.state = SessionState::Handshaking;

        match self.exchange_registration().await {
            Ok(ack) => {
                tracing::info!(
                    client_id = %ack.client_id,
                    public_url = %ack.public_url,
                    "Registered with relay"
                );
                self.state = SessionState::Active;
                Ok(&*self.registration.insert(ack))
            }
            Err(e) => {
                tracing::error!("Handshake failed: {}", e);
                self.state = SessionState::Closed;
                let _ = self.writer.close().await;
                Err(e)
            }
        }
    }

    async fn exchange_registration(&mut self) -> Result<RegistrationResponse, SessionError> {
        let request = Message::Connect(RegistrationRequest::new(self.local_port));
        self.writer.send(&request).await?;
        tracing::debug!(local_port = self.local_port, "Registration sent");

        let next = tokio::time::timeout(self.options.handshake_timeout, self.frames.next())
            .await
            .map_err(|_| SessionError::HandshakeTimeout(self.options.handshake_timeout))?;

        let frame = match next {
            None => return Err(SessionError::HandshakeClosed),
            Some(Err(e)) => return Err(SessionError::Transport(e)),
            Some(Ok(Err(e))) => return Err(SessionError::MalformedRegistration(e)),
            Some(Ok(Ok(frame))) => frame,
        };

        if frame.kind() == Some(KIND_ERROR) {
            let message = match frame.into_message() {
                Ok(Message::Error { message }) => message,
                Ok(other) => format!("unexpected {} frame", other.kind()),
                Err(e) => return Err(SessionError::MalformedRegistration(e)),
            };
            return Err(SessionError::Relay(message));
        }

        let ack = frame
            .into_registration()
            .map_err(SessionError::MalformedRegistration)?;

        if !ack.is_success() {
            return Err(SessionError::Rejected {
                status: ack.status.to_string(),
            });
        }

        Ok(ack)
    }

    /// Run the receive loop until the relay closes the transport, a read
    /// fails, or `shutdown` is cancelled.
    ///
    /// Malformed frames and frames of unknown kind are skipped. Forwards
    /// still running when the loop stops get `shutdown_grace` to deliver
    /// their responses. Whatever is left after that, including a write the
    /// relay is not draining, is dropped, so `run` returns within the grace
    /// period of the loop stopping.
    pub async fn run<F>(
        &mut self,
        forwarder: Arc<F>,
        shutdown: CancellationToken,
    ) -> Result<SessionSummary, SessionError>
    where
        F: Forward + ?Sized,
    {
        if self.state != SessionState::Active {
            return Err(SessionError::InvalidState(self.state));
        }

        let limiter = self
            .options
            .max_in_flight
            .map(|limit| Arc::new(Semaphore::new(limit)));
        let tracker = TaskTracker::new();
        let abandon = CancellationToken::new();
        let mut requests = 0;
        let mut decode_errors = 0;
        let mut ignored = 0;

        let outcome = loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break Ok(CloseReason::Cancelled),
                next = self.frames.next() => next,
            };

            let frame = match next {
                None => break Ok(CloseReason::EndOfStream),
                Some(Err(e)) => break Err(SessionError::Transport(e)),
                Some(Ok(Err(e))) => {
                    decode_errors += 1;
                    tracing::warn!("Skipping frame: {}", e);
                    continue;
                }
                Some(Ok(Ok(frame))) => frame,
            };

            match self.classify(frame) {
                Inbound::Request(request) => {
                    requests += 1;
                    self.dispatch(request, &forwarder, &tracker, &abandon, limiter.clone());
                }
                Inbound::Malformed(e) => {
                    decode_errors += 1;
                    tracing::warn!("Skipping frame: {}", e);
                }
                Inbound::Ignored => ignored += 1,
            }
        };

        self.state = SessionState::Closed;
        match &outcome {
            Ok(reason) => tracing::info!(?reason, requests, "Tunnel session closed"),
            Err(e) => tracing::error!("Tunnel session failed: {}", e),
        }

        tracker.close();
        let deadline = tokio::time::Instant::now() + self.options.shutdown_grace;
        let mut abandoned = 0;
        if tokio::time::timeout_at(deadline, tracker.wait()).await.is_err() {
            abandoned = tracker.len() as u64;
            tracing::warn!(
                in_flight = abandoned,
                "Abandoning in-flight requests after {:?}",
                self.options.shutdown_grace
            );
            // Tasks drop their pending forward or write, releasing the writer
            abandon.cancel();
            tracker.wait().await;
        }

        // Shares the deadline: a relay that stopped reading never completes the flush
        match tokio::time::timeout_at(deadline, self.writer.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!("Error closing transport: {}", e),
            Err(_) => tracing::debug!("Transport not flushed before shutdown deadline"),
        }

        outcome.map(|close_reason| SessionSummary {
            requests,
            decode_errors,
            ignored,
            abandoned,
            close_reason,
        })
    }

    fn classify(&self, frame: Frame) -> Inbound {
        match frame.kind() {
            Some(KIND_HTTP_REQUEST) => match frame.into_request() {
                Ok(request) => Inbound::Request(request),
                Err(e) => Inbound::Malformed(e),
            },
            Some(KIND_ERROR) => {
                match frame.into_message() {
                    Ok(Message::Error { message }) => {
                        tracing::warn!("Relay reported an error: {}", message)
                    }
                    Ok(_) => {}
                    Err(e) => return Inbound::Malformed(e),
                }
                Inbound::Ignored
            }
            kind => {
                tracing::debug!(?kind, "Ignoring frame of unhandled kind");
                Inbound::Ignored
            }
        }
    }

    fn dispatch<F>(
        &self,
        request: HttpRequest,
        forwarder: &Arc<F>,
        tracker: &TaskTracker,
        abandon: &CancellationToken,
        limiter: Option<Arc<Semaphore>>,
    ) where
        F: Forward + ?Sized,
    {
        let forwarder = Arc::clone(forwarder);
        let writer = self.writer.clone();
        let abandon = abandon.clone();
        let request_id = request.request_id.clone();

        tracing::debug!(
            request_id = %request_id,
            method = %request.method,
            url = %request.url,
            "Dispatching request"
        );

        tracker.spawn(async move {
            let deliver = async {
                let permit = match limiter {
                    Some(limiter) => limiter.acquire_owned().await.ok(),
                    None => None,
                };

                let response = match AssertUnwindSafe(forwarder.forward(request))
                    .catch_unwind()
                    .await
                {
                    Ok(response) => response,
                    Err(_) => {
                        tracing::error!(request_id = %request_id, "Forwarder panicked");
                        panic_response(&request_id)
                    }
                };
                drop(permit);

                let status = response.status_code;
                match writer.send(&Message::HttpResponse(response)).await {
                    Ok(()) => tracing::debug!(request_id = %request_id, status, "Response sent"),
                    Err(e) => tracing::debug!(
                        request_id = %request_id,
                        "Response not delivered, transport closed: {}",
                        e
                    ),
                }
            };

            tokio::select! {
                _ = abandon.cancelled() => {
                    tracing::debug!(request_id = %request_id, "Request abandoned at shutdown")
                }
                _ = deliver => {}
            }
        });
    }
}

/// A decoded inbound frame, sorted by what the loop does with it
enum Inbound {
    Request(HttpRequest),
    Malformed(DecodeError),
    Ignored,
}

fn panic_response(request_id: &bf_protocol::RequestId) -> HttpResponse {
    let mut headers = Headers::new();
    headers.insert(ERROR_HEADER.to_string(), "internal".to_string());
    HttpResponse::new(
        request_id.clone(),
        500,
        headers,
        "bifrost: internal error while forwarding request",
    )
}
