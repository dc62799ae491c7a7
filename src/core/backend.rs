use std::{
    fmt,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use axum::body::Body as AxumBody;
use futures_util::stream;
use http_body_util::{BodyExt, StreamBody};
use hyper::{StatusCode, Uri, body::Body as _, upgrade::OnUpgrade};
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::time::{Instant, timeout, timeout_at};

use crate::{
    core::request::{Request, text_response},
    metrics::{BackendRequestTimer, increment_backend_request_total, increment_websocket_upgrades},
    ports::http_client::HttpClient,
};

/// Errors related to backend operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BackendError {
    /// The forward target could not be turned into a request URI
    #[error("Invalid backend URI: {0}")]
    InvalidUri(String),

    /// A WebSocket request reached the backend without its upgrade handle
    #[error("WebSocket request has no upgrade handle")]
    MissingUpgrade,

    /// The proxied exchange was still streaming when the proxy timeout ran out
    #[error("Proxied connection exceeded {0:?}")]
    ProxyTimeout(Duration),
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Network address of a forward target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackendAddress {
    pub ip: IpAddr,
    pub port: u16,
}

impl BackendAddress {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl fmt::Display for BackendAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

/// Where a request ends up once routing and plugins are done with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    /// Proxy to a resolved service address
    Forward(BackendAddress),
    /// No route matched
    NotFound,
    /// A route matched but its service could not be resolved
    Unavailable,
    /// Does nothing; used for hosts only plugins answer
    Dummy,
}

impl Backend {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Forward(_) => "forward",
            Self::NotFound => "not_found",
            Self::Unavailable => "unavailable",
            Self::Dummy => "dummy",
        }
    }

    /// Handle the request. Backend I/O failures are answered with an error
    /// response here; an `Err` means the request could not even be attempted.
    pub async fn handle_request(
        &self,
        request: &mut Request,
        context: &BackendContext,
    ) -> BackendResult<()> {
        match self {
            Self::Forward(address) => {
                if request.is_websocket() {
                    forward_websocket(*address, request, context).await
                } else {
                    forward_http(*address, request, context).await
                }
            }
            Self::NotFound => {
                request
                    .respond(text_response(StatusCode::NOT_FOUND, "Not found"))
                    .await;
                Ok(())
            }
            Self::Unavailable => {
                request
                    .respond(text_response(
                        StatusCode::SERVICE_UNAVAILABLE,
                        "Service unavailable",
                    ))
                    .await;
                Ok(())
            }
            Self::Dummy => Ok(()),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Forward(address) => write!(f, "forward({address})"),
            other => f.write_str(other.kind()),
        }
    }
}

/// Shared collaborators for forwarding.
#[derive(Clone)]
pub struct BackendContext {
    pub http_client: Arc<dyn HttpClient>,
    /// Upper bound on a whole forward, response body included, and on the
    /// lifetime of a spliced WebSocket connection
    pub proxy_timeout: Duration,
}

fn forward_uri(address: BackendAddress, request: &Request) -> BackendResult<Uri> {
    let path_and_query = request
        .uri()
        .path_and_query()
        .map_or("/", |pq| pq.as_str());
    format!("http://{address}{path_and_query}")
        .parse()
        .map_err(|e: hyper::http::uri::InvalidUri| BackendError::InvalidUri(e.to_string()))
}

async fn forward_http(
    address: BackendAddress,
    request: &mut Request,
    context: &BackendContext,
) -> BackendResult<()> {
    let uri = forward_uri(address, request)?;
    let deadline = Instant::now() + context.proxy_timeout;
    let outgoing = request.forward_request(uri);
    let backend = address.to_string();
    let _timer = BackendRequestTimer::new(&backend);

    tracing::debug!(
        backend = %backend,
        method = %outgoing.method(),
        uri = %outgoing.uri(),
        "Forwarding request"
    );

    match timeout_at(deadline, context.http_client.send_request(outgoing)).await {
        Ok(Ok(response)) => {
            increment_backend_request_total(&backend, "response");
            request
                .respond(response.map(|body| with_deadline(body, deadline, context.proxy_timeout)))
                .await;
        }
        Ok(Err(e)) => {
            increment_backend_request_total(&backend, "error");
            tracing::warn!(backend = %backend, "Backend request failed: {}", e);
            request
                .respond(text_response(StatusCode::BAD_GATEWAY, "Bad Gateway"))
                .await;
        }
        Err(_) => {
            increment_backend_request_total(&backend, "timeout");
            tracing::warn!(
                backend = %backend,
                "Backend request timed out after {:?}",
                context.proxy_timeout
            );
            request
                .respond(text_response(StatusCode::BAD_GATEWAY, "Bad Gateway"))
                .await;
        }
    }
    Ok(())
}

async fn forward_websocket(
    address: BackendAddress,
    request: &mut Request,
    context: &BackendContext,
) -> BackendResult<()> {
    let uri = forward_uri(address, request)?;
    let client_upgrade = request.take_upgrade().ok_or(BackendError::MissingUpgrade)?;
    let outgoing = request.forward_request(uri);
    let backend = address.to_string();

    let mut response = match timeout(
        context.proxy_timeout,
        context.http_client.send_upgrade_request(outgoing),
    )
    .await
    {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            increment_backend_request_total(&backend, "error");
            tracing::warn!(backend = %backend, "WebSocket upgrade request failed: {}", e);
            request
                .respond(text_response(StatusCode::BAD_GATEWAY, "Bad Gateway"))
                .await;
            return Ok(());
        }
        Err(_) => {
            increment_backend_request_total(&backend, "timeout");
            tracing::warn!(backend = %backend, "WebSocket upgrade request timed out");
            request
                .respond(text_response(StatusCode::BAD_GATEWAY, "Bad Gateway"))
                .await;
            return Ok(());
        }
    };

    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        // Backend refused the upgrade; relay its answer as plain HTTP.
        increment_backend_request_total(&backend, "response");
        request.respond(response).await;
        return Ok(());
    }

    increment_backend_request_total(&backend, "upgraded");
    increment_websocket_upgrades();
    let backend_upgrade = hyper::upgrade::on(&mut response);
    request.mark_upgraded(response).await;

    let proxy_timeout = context.proxy_timeout;
    tokio::spawn(async move {
        match timeout(proxy_timeout, splice(client_upgrade, backend_upgrade)).await {
            Ok(Ok((from_client, from_backend))) => tracing::debug!(
                backend = %backend,
                from_client,
                from_backend,
                "WebSocket connection closed"
            ),
            Ok(Err(e)) => tracing::debug!(backend = %backend, "WebSocket connection ended: {}", e),
            Err(_) => tracing::debug!(
                backend = %backend,
                "WebSocket connection closed after {:?}",
                proxy_timeout
            ),
        }
    });

    Ok(())
}

/// Stream `body` until `deadline`, then fail it so hyper drops the connection.
fn with_deadline(body: AxumBody, deadline: Instant, limit: Duration) -> AxumBody {
    if body.is_end_stream() {
        return body;
    }
    let frames = stream::unfold(Some(body), move |state| async move {
        let Some(mut body) = state else {
            return None;
        };
        match timeout_at(deadline, body.frame()).await {
            Ok(Some(Ok(frame))) => Some((Ok(frame), Some(body))),
            Ok(Some(Err(e))) => Some((Err(e), None)),
            Ok(None) => None,
            Err(_) => {
                tracing::warn!("Closing proxied connection after {:?}", limit);
                Some((Err(axum::Error::new(BackendError::ProxyTimeout(limit))), None))
            }
        }
    });
    AxumBody::new(StreamBody::new(frames))
}

/// Copy bytes both ways between the two upgraded connections until either
/// side closes.
async fn splice(client: OnUpgrade, backend: OnUpgrade) -> std::io::Result<(u64, u64)> {
    let (client, backend) = tokio::try_join!(client, backend).map_err(std::io::Error::other)?;
    let mut client = TokioIo::new(client);
    let mut backend = TokioIo::new(backend);
    tokio::io::copy_bidirectional(&mut client, &mut backend).await
}
