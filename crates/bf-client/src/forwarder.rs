//! Forwarding of tunneled requests to the local HTTP service
//!
//! The forwarder is infallible by signature: every failure is folded into
//! a `500` response so the relay always gets an answer for each request id.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, Url};
use thiserror::Error;

use bf_core::ClientConfig;
use bf_protocol::{Headers, HttpRequest, HttpResponse, RequestId};

/// Header set on synthetic error responses, naming the failure class
pub const ERROR_HEADER: &str = "x-bifrost-error";

/// Request headers that are never copied to the local call.
///
/// `host` would fight the local service's own host resolution and
/// `content-length` is recomputed from the carried body.
const STRIPPED_HEADERS: &[&str] = &["host", "content-length"];

/// Turns an inbound request descriptor into a response descriptor
#[async_trait]
pub trait Forward: Send + Sync + 'static {
    /// Forward one request. Must always produce a response carrying the
    /// request's id.
    async fn forward(&self, request: HttpRequest) -> HttpResponse;
}

/// Why a request could not be forwarded
#[derive(Debug, Error)]
pub enum ForwardError {
    /// Method, URL or a header could not be expressed as an HTTP request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The local service did not answer within the forward timeout
    #[error("Local service timed out: {0}")]
    Timeout(#[source] reqwest::Error),

    /// The local service could not be reached
    #[error("Local service unreachable: {0}")]
    Connect(#[source] reqwest::Error),

    /// Any other failure performing the request
    #[error("Request to local service failed: {0}")]
    Upstream(#[source] reqwest::Error),

    /// The response body could not be read
    #[error("Failed to read response body: {0}")]
    Body(#[source] reqwest::Error),
}

impl ForwardError {
    /// Short failure class, sent in [`ERROR_HEADER`]
    pub fn class(&self) -> &'static str {
        match self {
            ForwardError::InvalidRequest(_) => "invalid-request",
            ForwardError::Timeout(_) => "timeout",
            ForwardError::Connect(_) => "connect",
            ForwardError::Upstream(_) => "upstream",
            ForwardError::Body(_) => "body",
        }
    }

    fn from_send(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ForwardError::Timeout(e)
        } else if e.is_connect() {
            ForwardError::Connect(e)
        } else if e.is_builder() {
            ForwardError::InvalidRequest(e.to_string())
        } else {
            ForwardError::Upstream(e)
        }
    }

    fn from_body(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ForwardError::Timeout(e)
        } else {
            ForwardError::Body(e)
        }
    }
}

/// Build the synthetic `500` sent when forwarding fails
pub fn error_response(request_id: RequestId, error: &ForwardError) -> HttpResponse {
    let mut headers = Headers::new();
    headers.insert(ERROR_HEADER.to_string(), error.class().to_string());

    HttpResponse::new(
        request_id,
        500,
        headers,
        format!("bifrost: could not forward request to local service: {}", error),
    )
}

fn is_stripped(name: &str) -> bool {
    STRIPPED_HEADERS
        .iter()
        .any(|stripped| name.eq_ignore_ascii_case(stripped))
}

/// Forwards requests to a local HTTP service with reqwest
#[derive(Debug, Clone)]
pub struct LocalForwarder {
    client: reqwest::Client,
    base_url: String,
}

impl LocalForwarder {
    /// Create a forwarder targeting `base_url` (scheme, host and port)
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            // Redirects belong to whoever made the original request
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Create a forwarder for the local service named in the configuration
    pub fn from_config(config: &ClientConfig) -> Result<Self, reqwest::Error> {
        Self::new(config.local_base_url(), config.forward_timeout)
    }

    /// Base URL requests are sent to
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn target_url(&self, path: &str) -> Result<Url, ForwardError> {
        let separator = if path.starts_with('/') { "" } else { "/" };
        let target = format!("{}{}{}", self.base_url, separator, path);
        Url::parse(&target)
            .map_err(|e| ForwardError::InvalidRequest(format!("invalid url {:?}: {}", path, e)))
    }

    /// Perform the local call, reporting failures as errors
    pub async fn try_forward(&self, request: HttpRequest) -> Result<HttpResponse, ForwardError> {
        let HttpRequest {
            request_id,
            method,
            url,
            headers,
            body,
        } = request;

        let method = Method::from_bytes(method.as_bytes())
            .map_err(|_| ForwardError::InvalidRequest(format!("invalid method {:?}", method)))?;
        let target = self.target_url(&url)?;

        let mut outbound = HeaderMap::with_capacity(headers.len());
        for (name, value) in &headers {
            if is_stripped(name) {
                continue;
            }
            let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
                ForwardError::InvalidRequest(format!("invalid header name {:?}", name))
            })?;
            let header_value = HeaderValue::from_str(value).map_err(|_| {
                ForwardError::InvalidRequest(format!("invalid value for header {:?}", name))
            })?;
            outbound.append(header_name, header_value);
        }

        let mut builder = self.client.request(method, target).headers(outbound);
        if !body.is_empty() {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(ForwardError::from_send)?;
        let status_code = response.status().as_u16();

        // Multi-valued headers keep only their first value
        let mut response_headers = Headers::new();
        for name in response.headers().keys() {
            if let Some(value) = response.headers().get(name) {
                response_headers.insert(
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                );
            }
        }

        let body = response.text().await.map_err(ForwardError::from_body)?;

        Ok(HttpResponse::new(request_id, status_code, response_headers, body))
    }
}

#[async_trait]
impl Forward for LocalForwarder {
    async fn forward(&self, request: HttpRequest) -> HttpResponse {
        let request_id = request.request_id.clone();

        match self.try_forward(request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(request_id = %request_id, error = %e, "Forwarding failed");
                error_response(request_id, &e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(method: &str, url: &str) -> HttpRequest {
        HttpRequest {
            request_id: RequestId::new("t1"),
            method: method.to_string(),
            url: url.to_string(),
            headers: Headers::new(),
            body: String::new(),
        }
    }

    #[test]
    fn test_stripped_headers_case_insensitive() {
        assert!(is_stripped("Host"));
        assert!(is_stripped("HOST"));
        assert!(is_stripped("content-length"));
        assert!(!is_stripped("x-forwarded-host"));
        assert!(!is_stripped("accept"));
    }

    #[test]
    fn test_target_url() {
        let forwarder = LocalForwarder::new("http://127.0.0.1:3000/", Duration::from_secs(1)).unwrap();
        assert_eq!(forwarder.base_url(), "http://127.0.0.1:3000");
        assert_eq!(
            forwarder.target_url("/a/b?c=d").unwrap().as_str(),
            "http://127.0.0.1:3000/a/b?c=d"
        );
        assert_eq!(
            forwarder.target_url("plain").unwrap().as_str(),
            "http://127.0.0.1:3000/plain"
        );
    }

    #[test]
    fn test_error_response_shape() {
        let response = error_response(
            RequestId::new("r9"),
            &ForwardError::InvalidRequest("invalid method \"G T\"".to_string()),
        );

        assert_eq!(response.request_id, RequestId::new("r9"));
        assert_eq!(response.status_code, 500);
        assert_eq!(response.headers.len(), 1);
        assert_eq!(
            response.headers.get(ERROR_HEADER).map(String::as_str),
            Some("invalid-request")
        );
        assert!(response.body.contains("invalid method"));
    }

    #[tokio::test]
    async fn test_invalid_method_yields_500() {
        let forwarder = LocalForwarder::new("http://127.0.0.1:9", Duration::from_secs(1)).unwrap();
        let response = forwarder.forward(request("BAD METHOD", "/")).await;

        assert_eq!(response.status_code, 500);
        assert_eq!(response.request_id, RequestId::new("t1"));
        assert_eq!(
            response.headers.get(ERROR_HEADER).map(String::as_str),
            Some("invalid-request")
        );
    }

    #[tokio::test]
    async fn test_invalid_header_value_yields_500() {
        let forwarder = LocalForwarder::new("http://127.0.0.1:9", Duration::from_secs(1)).unwrap();
        let mut req = request("GET", "/");
        req.headers.insert("x-bad".to_string(), "line\nbreak".to_string());

        let response = forwarder.forward(req).await;
        assert_eq!(response.status_code, 500);
        assert!(response.body.contains("x-bad"));
    }

    #[tokio::test]
    async fn test_unreachable_service_yields_500() {
        // Bind then drop to get a port nothing listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let forwarder =
            LocalForwarder::new(format!("http://127.0.0.1:{}", port), Duration::from_secs(5)).unwrap();
        let response = forwarder.forward(request("GET", "/hello")).await;

        assert_eq!(response.status_code, 500);
        assert_eq!(response.request_id, RequestId::new("t1"));
        assert!(!response.body.is_empty());
        assert_eq!(response.headers.len(), 1);
    }
}
