//! Per-request dispatch: the frontend request lifecycle.
//!
//! `Received -> Matched -> PluginChainRunning -> Dispatched -> Responded`
//!
//! 1. A request without a host is refused (the connection is dropped).
//! 2. The session is loaded.
//! 3. The routing table is queried for the best route.
//! 4. A plaintext request to a route with a certificate is redirected to HTTPS.
//! 5. Plugins run, in order, until one responds.
//! 6. The backend handles the request: no route means `NotFound`, a route
//!    without a resolved service means `Unavailable`.
//! 7. A request nobody answered gets a 502.
//!
//! Any failure in 2-7 is answered with a 502 unless a response was already
//! produced or the connection was upgraded, in which case it is only logged.

use std::{collections::HashSet, net::SocketAddr, sync::Arc};

use axum::body::Body as AxumBody;
use hyper::{
    Response, StatusCode,
    header::{HeaderValue, InvalidHeaderValue, LOCATION},
};
use thiserror::Error;
use tracing::Instrument;

use crate::{
    core::{
        backend::{Backend, BackendContext, BackendError},
        plugin::{PluginChain, PluginError, PluginRequest},
        request::{Request, request_hostname, text_response},
        routing::SharedRoutingTable,
        session::{Session, SessionCookie},
    },
    metrics::{RequestTimer, increment_request_total},
    ports::session_store::SessionStore,
    tracing_setup::create_request_span,
};

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DispatchError {
    /// Returned to the connection handler, which drops the connection
    #[error("Request has no host")]
    MissingHost,

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Invalid redirect target: {0}")]
    Redirect(#[from] InvalidHeaderValue),
}

pub struct Dispatcher {
    routing: SharedRoutingTable,
    plugins: Arc<PluginChain>,
    sessions: Arc<dyn SessionStore>,
    cookie: SessionCookie,
    backend_context: BackendContext,
    dummy_hosts: HashSet<String>,
}

impl Dispatcher {
    pub fn new(
        routing: SharedRoutingTable,
        plugins: Arc<PluginChain>,
        sessions: Arc<dyn SessionStore>,
        cookie: SessionCookie,
        backend_context: BackendContext,
    ) -> Self {
        Self {
            routing,
            plugins,
            sessions,
            cookie,
            backend_context,
            dummy_hosts: HashSet::new(),
        }
    }

    /// Hosts answered by the `Dummy` backend without consulting the routing
    /// table, leaving them to plugins.
    pub fn with_dummy_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.dummy_hosts = hosts
            .into_iter()
            .map(|host| host.as_ref().to_ascii_lowercase())
            .collect();
        self
    }

    /// Handle one request received on a plaintext (`is_secure == false`) or
    /// TLS listener.
    pub async fn handle(
        &self,
        req: hyper::Request<AxumBody>,
        is_secure: bool,
        remote_addr: Option<SocketAddr>,
    ) -> Result<Response<AxumBody>, DispatchError> {
        let method = req.method().clone();
        let _timer = RequestTimer::new(method.as_str());

        let Some(hostname) = request_hostname(req.headers(), req.uri()) else {
            tracing::warn!(
                remote = ?remote_addr,
                uri = %req.uri(),
                "Dropping request without a host"
            );
            return Err(DispatchError::MissingHost);
        };

        let span = create_request_span(method.as_str(), &hostname, req.uri().path(), is_secure);
        let response = self
            .dispatch(req, hostname, is_secure, remote_addr)
            .instrument(span.clone())
            .await;

        span.record("http.status_code", response.status().as_u16());
        increment_request_total(method.as_str(), response.status().as_u16());
        Ok(response)
    }

    async fn dispatch(
        &self,
        req: hyper::Request<AxumBody>,
        hostname: String,
        is_secure: bool,
        remote_addr: Option<SocketAddr>,
    ) -> Response<AxumBody> {
        let (parts, body) = req.into_parts();

        let session = match Session::load(
            self.sessions.clone(),
            self.cookie.clone(),
            &parts.headers,
            is_secure,
        )
        .await
        {
            Ok(session) => session,
            Err(e) => {
                tracing::error!("Failed to load session: {}", e);
                return text_response(StatusCode::BAD_GATEWAY, "Bad Gateway");
            }
        };

        let mut request = Request::new(parts, body, hostname, is_secure, remote_addr, session);

        if let Err(e) = self.process(&mut request).await {
            if request.is_upgraded() || request.has_responded() {
                tracing::warn!("Request failed after it was answered: {}", e);
            } else {
                tracing::warn!("Request failed: {}", e);
                request
                    .respond(text_response(StatusCode::BAD_GATEWAY, "Bad Gateway"))
                    .await;
            }
        }

        request
            .into_response()
            .unwrap_or_else(|| text_response(StatusCode::BAD_GATEWAY, "Bad Gateway"))
    }

    async fn process(&self, request: &mut Request) -> Result<(), DispatchError> {
        let table = self.routing.load_full();

        let (entry, backend) = if self.dummy_hosts.contains(request.hostname()) {
            (None, Backend::Dummy)
        } else {
            match table.find_route(request.hostname(), request.path()) {
                Some(entry) => (
                    Some(entry),
                    entry.backend.clone().unwrap_or(Backend::Unavailable),
                ),
                None => (None, Backend::NotFound),
            }
        };

        tracing::debug!(
            matched = entry.is_some(),
            backend = %backend,
            "Routing decision"
        );

        if let Some(entry) = entry {
            if entry.is_secure() && !request.is_secure() {
                let path_and_query = request
                    .uri()
                    .path_and_query()
                    .map_or("/", |pq| pq.as_str());
                let location = HeaderValue::from_str(&format!(
                    "https://{}{}",
                    request.hostname(),
                    path_and_query
                ))?;

                let mut response = Response::new(AxumBody::empty());
                *response.status_mut() = StatusCode::PERMANENT_REDIRECT;
                response.headers_mut().insert(LOCATION, location);
                request.respond(response).await;
                return Ok(());
            }
        }

        let mut ctx = PluginRequest {
            request: &mut *request,
            route: entry.map(|entry| entry.matcher.metadata()),
            backend: &backend,
        };
        self.plugins.run(&mut ctx).await?;
        if request.has_responded() {
            return Ok(());
        }

        backend
            .handle_request(request, &self.backend_context)
            .await?;

        if !request.has_responded() {
            request
                .respond(text_response(StatusCode::BAD_GATEWAY, "Bad Gateway"))
                .await;
        }
        Ok(())
    }
}
