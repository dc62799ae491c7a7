use async_trait::async_trait;
use axum::body::Body as AxumBody;
use hyper::{Request, Response, Uri, Version, client::conn::http1, header};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::{TokioExecutor, TokioIo},
};
use tokio::net::TcpStream;
use tracing::Instrument;

use crate::ports::http_client::{HttpClient, HttpClientError, HttpClientResult};

/// HTTP client adapter forwarding to cluster services over plain HTTP/1.1.
///
/// Ordinary requests go through a pooled client. Upgrade requests get a
/// dedicated connection so the raw socket can be handed over after `101`.
pub struct HttpClientAdapter {
    client: Client<HttpConnector, AxumBody>,
}

impl HttpClientAdapter {
    pub fn new() -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(100)
            .build::<_, AxumBody>(connector);

        tracing::info!("Created backend HTTP client");
        Self { client }
    }

    fn backend_span(req: &Request<AxumBody>) -> tracing::Span {
        tracing::info_span!(
            "backend_request",
            backend.authority = %req.uri().authority().map_or("unknown", |a| a.as_str()),
            http.method = %req.method(),
            http.path = %req.uri().path(),
            http.status_code = tracing::field::Empty,
        )
    }
}

impl Default for HttpClientAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// Host and port of an absolute `http://` URI.
fn connect_target(uri: &Uri) -> HttpClientResult<String> {
    let authority = uri.authority().ok_or_else(|| {
        HttpClientError::InvalidRequest(format!("Outgoing URI has no authority: {uri}"))
    })?;
    let port = authority.port_u16().unwrap_or(80);
    Ok(format!("{}:{port}", authority.host()))
}

#[async_trait]
impl HttpClient for HttpClientAdapter {
    async fn send_request(&self, req: Request<AxumBody>) -> HttpClientResult<Response<AxumBody>> {
        if req.uri().authority().is_none() {
            return Err(HttpClientError::InvalidRequest(format!(
                "Outgoing URI has no authority: {}",
                req.uri()
            )));
        }

        let span = Self::backend_span(&req);
        let (mut parts, body) = req.into_parts();
        parts.version = Version::HTTP_11;
        let outgoing = Request::from_parts(parts, body);
        let method = outgoing.method().clone();
        let uri = outgoing.uri().clone();

        async move {
            tracing::debug!("Forwarding {} {}", method, uri);

            match self.client.request(outgoing).await {
                Ok(response) => {
                    tracing::Span::current().record("http.status_code", response.status().as_u16());

                    let (mut parts, body) = response.into_parts();
                    // Framing is redone by the frontend connection.
                    parts.headers.remove(header::TRANSFER_ENCODING);
                    Ok(Response::from_parts(parts, AxumBody::new(body)))
                }
                Err(e) => {
                    tracing::Span::current().record("http.status_code", 599u16);
                    tracing::warn!("Error forwarding {} {}: {}", method, uri, e);
                    Err(HttpClientError::ConnectionError(format!(
                        "Request to {method} {uri} failed: {e}"
                    )))
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn send_upgrade_request(
        &self,
        req: Request<AxumBody>,
    ) -> HttpClientResult<Response<AxumBody>> {
        let target = connect_target(req.uri())?;
        let span = Self::backend_span(&req);

        async move {
            let stream = TcpStream::connect(&target)
                .await
                .map_err(|e| HttpClientError::ConnectionError(format!("{target}: {e}")))?;
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!(backend = %target, "Failed to set TCP_NODELAY: {}", e);
            }

            let (mut sender, connection) = http1::handshake(TokioIo::new(stream))
                .await
                .map_err(|e| HttpClientError::UpgradeFailed(e.to_string()))?;
            tokio::spawn(async move {
                if let Err(e) = connection.with_upgrades().await {
                    tracing::debug!("Upgrade connection closed: {}", e);
                }
            });

            // A direct connection takes the origin form.
            let (mut parts, body) = req.into_parts();
            parts.version = Version::HTTP_11;
            parts.uri = parts
                .uri
                .path_and_query()
                .map_or("/", |pq| pq.as_str())
                .parse()
                .map_err(|e: hyper::http::uri::InvalidUri| {
                    HttpClientError::InvalidRequest(e.to_string())
                })?;

            let response = sender
                .send_request(Request::from_parts(parts, body))
                .await
                .map_err(|e| HttpClientError::UpgradeFailed(e.to_string()))?;
            tracing::Span::current().record("http.status_code", response.status().as_u16());

            Ok(response.map(AxumBody::new))
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use http_body_util::BodyExt;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use super::*;

    #[test]
    fn test_connect_target() {
        let uri: Uri = "http://10.0.0.1:8080/chat".parse().unwrap();
        assert_eq!(connect_target(&uri).unwrap(), "10.0.0.1:8080");

        let uri: Uri = "http://[fd00::1]/".parse().unwrap();
        assert_eq!(connect_target(&uri).unwrap(), "[fd00::1]:80");

        let uri: Uri = "/relative".parse().unwrap();
        assert!(matches!(
            connect_target(&uri),
            Err(HttpClientError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_send_request_relative_uri_rejected() {
        let client = HttpClientAdapter::new();
        let req = Request::builder()
            .uri("/no-authority")
            .body(AxumBody::empty())
            .unwrap();
        assert!(matches!(
            client.send_request(req).await,
            Err(HttpClientError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_send_request_connection_refused() {
        // Bind then drop to get a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = HttpClientAdapter::new();
        let req = Request::builder()
            .uri(format!("http://{addr}/"))
            .body(AxumBody::empty())
            .unwrap();
        assert!(matches!(
            client.send_request(req).await,
            Err(HttpClientError::ConnectionError(_))
        ));
    }

    #[tokio::test]
    async fn test_send_request_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = socket.read(&mut buf).await.unwrap();
            socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\nconnection: close\r\n\r\nhello")
                .await
                .unwrap();
        });

        let client = HttpClientAdapter::new();
        let req = Request::builder()
            .uri(format!("http://{addr}/greeting"))
            .body(AxumBody::empty())
            .unwrap();
        let response = client.send_request(req).await.unwrap();
        assert_eq!(response.status(), 200);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"hello");
    }
}
