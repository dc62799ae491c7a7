use async_trait::async_trait;
use hyper::{
    StatusCode,
    header::{AUTHORIZATION, HeaderValue, WWW_AUTHENTICATE},
};

use crate::core::{
    backend::Backend,
    plugin::{Plugin, PluginRequest},
    request::text_response,
};

/// HTTP Basic authentication for routes that ask for it through their
/// `basicauth.kingress.io/*` annotations.
///
/// Only requests headed for a service are checked; not-found, unavailable
/// and dummy routes are left to their backend.
#[derive(Debug, Default)]
pub struct BasicAuthPlugin;

impl BasicAuthPlugin {
    pub fn new() -> Self {
        Self
    }
}

fn challenge(realm: &str) -> eyre::Result<HeaderValue> {
    let value = format!(
        "Basic realm=\"{}\", charset=\"UTF-8\"",
        urlencoding::encode(realm)
    );
    Ok(HeaderValue::from_str(&value)?)
}

#[async_trait]
impl Plugin for BasicAuthPlugin {
    fn name(&self) -> &str {
        "basic-auth"
    }

    async fn on_request(&self, ctx: &mut PluginRequest<'_>) -> eyre::Result<()> {
        if !matches!(ctx.backend, Backend::Forward(_)) {
            return Ok(());
        }
        let Some(settings) = ctx.route.and_then(|route| route.settings.basic_auth.as_ref()) else {
            return Ok(());
        };

        let presented = ctx
            .request
            .headers()
            .get(AUTHORIZATION)
            .map(HeaderValue::as_bytes);
        if presented == Some(settings.expected_header.as_bytes()) {
            return Ok(());
        }

        tracing::debug!(
            host = %ctx.request.hostname(),
            path = %ctx.request.path(),
            presented = presented.is_some(),
            "Basic authentication required"
        );
        let mut response = text_response(StatusCode::UNAUTHORIZED, "Unauthorized");
        response
            .headers_mut()
            .insert(WWW_AUTHENTICATE, challenge(&settings.realm)?);
        ctx.request.respond(response).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, sync::Arc};

    use axum::body::Body as AxumBody;
    use hyper::header::HOST;

    use super::*;
    use crate::{
        adapters::memory_session_store::MemorySessionStore,
        core::{
            annotations::{
                BASIC_AUTH_CREDENTIALS, BASIC_AUTH_REALM, BASIC_AUTH_REQUIRE, RouteMetadata,
            },
            backend::BackendAddress,
            request::{Request, request_hostname},
            session::{Session, SessionCookie},
        },
        ports::cluster::ObjectRef,
    };

    async fn request(authorization: Option<&str>) -> Request {
        let mut builder = hyper::Request::builder().uri("/admin").header(HOST, "a.test");
        if let Some(value) = authorization {
            builder = builder.header(AUTHORIZATION, value);
        }
        let (parts, body) = builder.body(AxumBody::empty()).unwrap().into_parts();
        let session = Session::load(
            Arc::new(MemorySessionStore::new()),
            SessionCookie::default(),
            &parts.headers,
            false,
        )
        .await
        .unwrap();
        let hostname = request_hostname(&parts.headers, &parts.uri).unwrap();
        Request::new(parts, body, hostname, false, None, session)
    }

    fn protected(realm: &str) -> RouteMetadata {
        RouteMetadata::from_annotations(
            ObjectRef::new("default", "web"),
            BTreeMap::from([
                (BASIC_AUTH_REQUIRE.to_string(), "true".to_string()),
                (BASIC_AUTH_CREDENTIALS.to_string(), "user:pass".to_string()),
                (BASIC_AUTH_REALM.to_string(), realm.to_string()),
            ]),
        )
        .unwrap()
    }

    fn forward() -> Backend {
        Backend::Forward(BackendAddress::new("10.0.0.1".parse().unwrap(), 8080))
    }

    async fn run(request: &mut Request, route: Option<&RouteMetadata>, backend: &Backend) {
        let mut ctx = PluginRequest {
            request,
            route,
            backend,
        };
        BasicAuthPlugin::new().on_request(&mut ctx).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_credentials_are_challenged() {
        let route = protected("Admin area");
        let mut req = request(None).await;
        run(&mut req, Some(&route), &forward()).await;

        let response = req.into_response().unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get(WWW_AUTHENTICATE).unwrap(),
            "Basic realm=\"Admin%20area\", charset=\"UTF-8\""
        );
    }

    #[tokio::test]
    async fn test_wrong_credentials_are_challenged() {
        let route = protected("");
        let mut req = request(Some("Basic d3Jvbmc6d3Jvbmc=")).await;
        run(&mut req, Some(&route), &forward()).await;
        assert!(req.has_responded());
    }

    #[tokio::test]
    async fn test_matching_credentials_pass() {
        let route = protected("");
        let mut req = request(Some("Basic dXNlcjpwYXNz")).await;
        run(&mut req, Some(&route), &forward()).await;
        assert!(!req.has_responded());
    }

    #[tokio::test]
    async fn test_unprotected_route_passes() {
        let route = RouteMetadata::default();
        let mut req = request(None).await;
        run(&mut req, Some(&route), &forward()).await;
        assert!(!req.has_responded());
    }

    #[tokio::test]
    async fn test_non_forward_backends_are_skipped() {
        let route = protected("");
        for backend in [Backend::NotFound, Backend::Unavailable, Backend::Dummy] {
            let mut req = request(None).await;
            run(&mut req, Some(&route), &backend).await;
            assert!(!req.has_responded(), "{backend} should not be challenged");
        }
    }
}
