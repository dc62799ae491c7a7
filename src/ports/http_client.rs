use async_trait::async_trait;
use axum::body::Body as AxumBody;
use hyper::{Request, Response};
use thiserror::Error;

/// Custom error type for HTTP client operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpClientError {
    /// Error when connection to backend fails
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Error when the request cannot be sent as built
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Error while negotiating a protocol upgrade with the backend
    #[error("Upgrade error: {0}")]
    UpgradeFailed(String),
}

/// Result type alias for HTTP client operations
pub type HttpClientResult<T> = Result<T, HttpClientError>;

/// HttpClient defines the port (interface) for forwarding requests to backends
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Forward an ordinary HTTP request and stream back the backend's response.
    async fn send_request(&self, req: Request<AxumBody>) -> HttpClientResult<Response<AxumBody>>;

    /// Forward a request that asks for a protocol upgrade (WebSocket).
    ///
    /// The request goes out on a dedicated HTTP/1.1 connection. When the
    /// backend answers `101 Switching Protocols` the returned response carries
    /// the upgrade handle in its extensions, so `hyper::upgrade::on` can take
    /// over the raw connection.
    async fn send_upgrade_request(
        &self,
        req: Request<AxumBody>,
    ) -> HttpClientResult<Response<AxumBody>>;
}
