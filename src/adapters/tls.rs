//! TLS termination with per-handshake certificate selection.

use std::sync::Arc;

use rustls::{
    ServerConfig,
    server::{ClientHello, ResolvesServerCert},
    sign::CertifiedKey,
};

use crate::{core::routing::SharedRoutingTable, metrics::increment_sni_misses};

/// Picks the certificate for a handshake from the current routing table by
/// the SNI hostname. Handshakes without SNI or without a matching
/// certificate are refused.
pub struct SniCertResolver {
    routing: SharedRoutingTable,
}

impl SniCertResolver {
    pub fn new(routing: SharedRoutingTable) -> Self {
        Self { routing }
    }

    pub fn resolve_server_name(&self, server_name: Option<&str>) -> Option<Arc<CertifiedKey>> {
        let Some(server_name) = server_name else {
            tracing::debug!("TLS handshake without SNI refused");
            increment_sni_misses();
            return None;
        };

        let table = self.routing.load();
        match table
            .find_certificate(server_name)
            .and_then(|certificate| certificate.certified_key())
        {
            Some(key) => Some(key),
            None => {
                tracing::debug!(server_name, "No certificate for SNI hostname");
                increment_sni_misses();
                None
            }
        }
    }
}

impl std::fmt::Debug for SniCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SniCertResolver")
            .field("routes", &self.routing.load().len())
            .finish()
    }
}

impl ResolvesServerCert for SniCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.resolve_server_name(client_hello.server_name())
    }
}

/// Server configuration for the TLS listener. Only HTTP/1.1 is offered so
/// WebSocket upgrades keep working through the terminated connection.
pub fn build_server_config(routing: SharedRoutingTable) -> eyre::Result<Arc<ServerConfig>> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(SniCertResolver::new(routing)));
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use rustls::{ClientConfig, RootCertStore, pki_types::ServerName};
    use tokio::io::duplex;
    use tokio_rustls::{TlsAcceptor, TlsConnector};

    use super::*;
    use crate::{
        core::{
            certificate::TlsCertificate,
            matcher::{PathType, RequestMatcher},
            routing::{RoutingEntry, RoutingTable, shared_routing_table},
        },
        ports::cluster::{ObjectRef, SecretData},
    };

    struct Fixture {
        routing: SharedRoutingTable,
        roots: RootCertStore,
    }

    fn fixture() -> Fixture {
        let generated = rcgen::generate_simple_self_signed(vec!["a.test".to_string()]).unwrap();
        let certificate = TlsCertificate::from_secret(&SecretData {
            object: ObjectRef::new("default", "a-tls"),
            cert_pem: Some(generated.cert.pem().into_bytes()),
            key_pem: Some(generated.signing_key.serialize_pem().into_bytes()),
            valid_hostnames: Some(vec!["a.test".to_string()]),
        });
        let mut roots = RootCertStore::empty();
        roots.add(generated.cert.der().clone()).unwrap();

        let routing = shared_routing_table(RoutingTable::new(vec![
            RoutingEntry::new(RequestMatcher::new("a.test", "/", PathType::Prefix))
                .with_certificate(Arc::new(certificate)),
        ]));
        Fixture { routing, roots }
    }

    #[test]
    fn test_resolve_server_name() {
        let fixture = fixture();
        let resolver = SniCertResolver::new(fixture.routing);
        assert!(resolver.resolve_server_name(Some("a.test")).is_some());
        assert!(resolver.resolve_server_name(Some("A.TEST")).is_some());
        assert!(resolver.resolve_server_name(Some("b.test")).is_none());
        assert!(resolver.resolve_server_name(None).is_none());
    }

    #[test]
    fn test_resolver_follows_table_swaps() {
        let fixture = fixture();
        let resolver = SniCertResolver::new(fixture.routing.clone());
        fixture.routing.store(Arc::new(RoutingTable::empty()));
        assert!(resolver.resolve_server_name(Some("a.test")).is_none());
    }

    async fn handshake(fixture: &Fixture, server_name: &'static str) -> (bool, bool) {
        let server_config = build_server_config(fixture.routing.clone()).unwrap();
        let client_config = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::aws_lc_rs::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(fixture.roots.clone())
        .with_no_client_auth();

        let (client_io, server_io) = duplex(64 * 1024);
        let acceptor = TlsAcceptor::from(server_config);
        let connector = TlsConnector::from(Arc::new(client_config));
        let name = ServerName::try_from(server_name).unwrap();

        let (server, client) = tokio::join!(
            acceptor.accept(server_io),
            connector.connect(name, client_io)
        );
        (server.is_ok(), client.is_ok())
    }

    #[tokio::test]
    async fn test_handshake_with_matching_sni() {
        let fixture = fixture();
        assert_eq!(handshake(&fixture, "a.test").await, (true, true));
    }

    #[tokio::test]
    async fn test_handshake_fails_closed_without_certificate() {
        let fixture = fixture();
        let (server_ok, client_ok) = handshake(&fixture, "b.test").await;
        assert!(!server_ok);
        assert!(!client_ok);
    }
}
