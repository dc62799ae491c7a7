//! Per-request state shared by the dispatcher, plugins and backends.
//!
//! The central piece is the one-shot respond gate: exactly one response is
//! produced per request, and once the transport has been upgraded to a
//! WebSocket no response is produced at all.

use std::net::SocketAddr;

use axum::body::Body as AxumBody;
use http::request::Parts;
use hyper::{
    HeaderMap, Method, Response, StatusCode, Uri, Version,
    header::{
        CONNECTION, CONTENT_TYPE, HOST, HeaderName, HeaderValue, PROXY_AUTHENTICATE,
        PROXY_AUTHORIZATION, SET_COOKIE, STRICT_TRANSPORT_SECURITY, TE, TRAILER,
        TRANSFER_ENCODING, UPGRADE,
    },
    upgrade::OnUpgrade,
};

use crate::core::session::Session;

pub const HSTS_VALUE: &str = "max-age=31536000; includeSubDomains; preload";

pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
pub const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");

const KEEP_ALIVE: HeaderName = HeaderName::from_static("keep-alive");
const PROXY_CONNECTION: HeaderName = HeaderName::from_static("proxy-connection");

#[derive(Debug)]
enum Transport {
    Http,
    /// Client asked for a WebSocket upgrade; holds the client-side upgrade
    /// handle until a backend claims it
    WebSocket(Option<OnUpgrade>),
    Upgraded,
}

#[derive(Debug)]
pub struct Request {
    hostname: String,
    is_secure: bool,
    remote_addr: Option<SocketAddr>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Option<AxumBody>,
    session: Session,
    transport: Transport,
    responded: bool,
    response: Option<Response<AxumBody>>,
    pending_headers: HeaderMap,
}

impl Request {
    pub fn new(
        mut parts: Parts,
        body: AxumBody,
        hostname: String,
        is_secure: bool,
        remote_addr: Option<SocketAddr>,
        session: Session,
    ) -> Self {
        let transport = if is_websocket_upgrade(&parts.headers) {
            Transport::WebSocket(parts.extensions.remove::<OnUpgrade>())
        } else {
            Transport::Http
        };

        Self {
            hostname,
            is_secure,
            remote_addr,
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
            body: Some(body),
            session,
            transport,
            responded: false,
            response: None,
            pending_headers: HeaderMap::new(),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn is_secure(&self) -> bool {
        self.is_secure
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// Headers as they will be forwarded to the backend.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    pub fn is_websocket(&self) -> bool {
        !matches!(self.transport, Transport::Http)
    }

    pub fn is_upgraded(&self) -> bool {
        matches!(self.transport, Transport::Upgraded)
    }

    pub fn has_responded(&self) -> bool {
        self.responded
    }

    /// Queue a header for whatever response is eventually sent.
    pub fn add_response_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.pending_headers.append(name, value);
    }

    /// Take the client-side upgrade handle of a WebSocket request.
    pub fn take_upgrade(&mut self) -> Option<OnUpgrade> {
        match &mut self.transport {
            Transport::WebSocket(upgrade) => upgrade.take(),
            _ => None,
        }
    }

    /// Respond to the request. Only the first call has any effect, and no
    /// response is produced once the transport was upgraded. Returns whether
    /// this call produced the response.
    ///
    /// Response headers are layered as: HSTS on secure transports, then
    /// headers queued by plugins, then the caller's own headers (which replace
    /// earlier values of the same name, except `Set-Cookie` which accumulates).
    pub async fn respond(&mut self, response: Response<AxumBody>) -> bool {
        if self.responded || self.is_upgraded() {
            tracing::debug!(
                host = %self.hostname,
                path = %self.uri.path(),
                status = response.status().as_u16(),
                "Ignoring response to a request that was already answered"
            );
            return false;
        }
        self.responded = true;

        let cookie = self.session.save(self.is_secure).await;
        let (mut parts, body) = response.into_parts();

        let mut headers = HeaderMap::new();
        if self.is_secure {
            headers.insert(STRICT_TRANSPORT_SECURITY, HeaderValue::from_static(HSTS_VALUE));
        }
        merge_headers(&mut headers, std::mem::take(&mut self.pending_headers));
        if !cookie.is_empty() {
            headers.append(SET_COOKIE, cookie);
        }
        merge_headers(&mut headers, std::mem::take(&mut parts.headers));
        parts.headers = headers;

        self.response = Some(Response::from_parts(parts, body));
        true
    }

    /// Record that the transport switched protocols. `response` is the
    /// `101 Switching Protocols` answer handed back to the client; every later
    /// respond attempt is suppressed.
    pub async fn mark_upgraded(&mut self, response: Response<AxumBody>) {
        if let Err(e) = self.session.persist().await {
            tracing::warn!(session = %self.session.id(), "Failed to save session data: {}", e);
        }
        self.transport = Transport::Upgraded;
        self.responded = true;
        self.response = Some(response);
    }

    /// Build the request to send to a backend at `uri`, moving the body out.
    pub fn forward_request(&mut self, uri: Uri) -> hyper::Request<AxumBody> {
        let mut request = hyper::Request::new(self.body.take().unwrap_or_else(AxumBody::empty));
        *request.method_mut() = self.method.clone();
        *request.uri_mut() = uri;
        *request.version_mut() = Version::HTTP_11;

        let mut headers = self.headers.clone();
        strip_hop_by_hop(&mut headers, self.is_websocket());
        if let Some(remote) = self.remote_addr {
            let forwarded_for = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
                Some(existing) => format!("{existing}, {}", remote.ip()),
                None => remote.ip().to_string(),
            };
            if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
                headers.insert(X_FORWARDED_FOR, value);
            }
        }
        headers.insert(
            X_FORWARDED_PROTO,
            HeaderValue::from_static(if self.is_secure { "https" } else { "http" }),
        );
        if let Some(host) = self.headers.get(HOST) {
            headers.insert(X_FORWARDED_HOST, host.clone());
        }
        *request.headers_mut() = headers;

        request
    }

    /// The response produced for this request, if any.
    pub fn into_response(self) -> Option<Response<AxumBody>> {
        self.response
    }
}

/// Append `from` into `into`, replacing existing values of each name except
/// `Set-Cookie`.
fn merge_headers(into: &mut HeaderMap, from: HeaderMap) {
    let mut current: Option<HeaderName> = None;
    for (name, value) in from {
        if let Some(name) = name {
            if name != SET_COOKIE {
                into.remove(&name);
            }
            current = Some(name);
        }
        if let Some(name) = &current {
            into.append(name.clone(), value);
        }
    }
}

/// Remove headers that only apply to the client's connection. `Connection`
/// and `Upgrade` survive when the upgrade itself is being forwarded.
fn strip_hop_by_hop(headers: &mut HeaderMap, keep_upgrade: bool) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        if !(keep_upgrade && name == UPGRADE) {
            headers.remove(name);
        }
    }

    for name in [
        KEEP_ALIVE,
        PROXY_CONNECTION,
        PROXY_AUTHENTICATE,
        PROXY_AUTHORIZATION,
        TE,
        TRAILER,
        TRANSFER_ENCODING,
    ] {
        headers.remove(name);
    }
    if !keep_upgrade {
        headers.remove(CONNECTION);
        headers.remove(UPGRADE);
    }
}

/// Whether the headers ask for a WebSocket upgrade.
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let upgrade = headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    let connection = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    upgrade && connection
}

/// The request hostname: the `Host` header (or URI authority for absolute-form
/// requests) without port, lowercased.
pub fn request_hostname(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    let raw = headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| uri.authority().map(|a| a.as_str().to_string()))?;
    let raw = raw.trim();

    let host = if let Some(rest) = raw.strip_prefix('[') {
        // [v6]:port
        rest.split(']').next().unwrap_or_default()
    } else {
        raw.split(':').next().unwrap_or_default()
    };

    if host.is_empty() {
        None
    } else {
        Some(host.to_ascii_lowercase())
    }
}

/// A small plain-text response.
pub fn text_response(status: StatusCode, body: &'static str) -> Response<AxumBody> {
    let mut response = Response::new(AxumBody::from(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}
