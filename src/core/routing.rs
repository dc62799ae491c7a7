//! The routing table: an immutable snapshot built once per reconciliation
//! cycle and published with an atomic pointer swap.

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::core::{
    backend::Backend,
    certificate::TlsCertificate,
    matcher::{PathType, RequestMatcher, select_best},
};

/// Shared handle to the current routing table. One writer (the reconciler),
/// any number of lock-free readers.
pub type SharedRoutingTable = Arc<ArcSwap<RoutingTable>>;

pub fn shared_routing_table(table: RoutingTable) -> SharedRoutingTable {
    Arc::new(ArcSwap::from_pointee(table))
}

#[derive(Debug, Clone)]
pub struct RoutingEntry {
    pub matcher: RequestMatcher,
    /// `None` when the route is not secured or its secret could not be read
    pub certificate: Option<Arc<TlsCertificate>>,
    /// `None` when the service could not be resolved
    pub backend: Option<Backend>,
    /// Set while the rule's annotations have never parsed; such a route keeps
    /// answering 503 until they do
    pub forwarding_disabled: bool,
}

impl RoutingEntry {
    pub fn new(matcher: RequestMatcher) -> Self {
        Self {
            matcher,
            certificate: None,
            backend: None,
            forwarding_disabled: false,
        }
    }

    pub fn with_certificate(mut self, certificate: Arc<TlsCertificate>) -> Self {
        self.certificate = Some(certificate);
        self
    }

    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_forwarding_disabled(mut self) -> Self {
        self.forwarding_disabled = true;
        self
    }

    /// Whether plaintext requests to this route are redirected to HTTPS.
    pub fn is_secure(&self) -> bool {
        self.certificate.is_some()
    }

    /// Fill absent certificate/backend from `previous`. Returns whether
    /// anything was taken over.
    pub fn carry_forward_from(&mut self, previous: &RoutingEntry) -> bool {
        let mut carried = false;
        if self.certificate.is_none() && previous.certificate.is_some() {
            self.certificate = previous.certificate.clone();
            carried = true;
        }
        if self.backend.is_none() && !self.forwarding_disabled && previous.backend.is_some() {
            self.backend = previous.backend.clone();
            carried = true;
        }
        carried
    }
}

#[derive(Debug, Default)]
pub struct RoutingTable {
    entries: Vec<RoutingEntry>,
}

impl RoutingTable {
    pub fn new(entries: Vec<RoutingEntry>) -> Self {
        Self { entries }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a table from this cycle's entries, filling transient gaps from
    /// `previous`. Returns the table and the number of entries that took
    /// something over.
    pub fn with_carry_forward(mut entries: Vec<RoutingEntry>, previous: &RoutingTable) -> (Self, usize) {
        let mut carried = 0;
        for entry in &mut entries {
            if entry.certificate.is_some() && entry.backend.is_some() {
                continue;
            }
            if let Some(old) = previous.find_identical(&entry.matcher) {
                if entry.carry_forward_from(old) {
                    tracing::debug!(
                        host = %entry.matcher.host(),
                        path = %entry.matcher.path(),
                        "Reusing previous routing data after a lookup failure"
                    );
                    carried += 1;
                }
            }
        }

        let table = Self::new(entries);
        for (shadowed, winner) in table.new_duplicate_rules(previous) {
            let (shadowed, winner) = (&table.entries[shadowed], &table.entries[winner]);
            tracing::warn!(
                host = %shadowed.matcher.host(),
                path = %shadowed.matcher.path(),
                path_type = %shadowed.matcher.path_type(),
                first = %shadowed.matcher.metadata().owner,
                winner = %winner.matcher.metadata().owner,
                "Duplicate routing rule; the later declaration wins"
            );
        }
        (table, carried)
    }

    /// Exact and implementation-specific rules declared more than once, as
    /// index pairs of a shadowed entry and the next identical one.
    fn duplicate_rules(&self) -> Vec<(usize, usize)> {
        let mut pairs = Vec::new();
        for (i, entry) in self.entries.iter().enumerate() {
            if entry.matcher.path_type() == PathType::Prefix {
                continue;
            }
            if let Some(offset) = self.entries[i + 1..]
                .iter()
                .position(|other| other.matcher.is_identical_to(&entry.matcher))
            {
                pairs.push((i, i + 1 + offset));
            }
        }
        pairs
    }

    /// Duplicates that `previous` did not already have.
    fn new_duplicate_rules(&self, previous: &RoutingTable) -> Vec<(usize, usize)> {
        self.duplicate_rules()
            .into_iter()
            .filter(|&(shadowed, _)| !previous.has_duplicate(&self.entries[shadowed].matcher))
            .collect()
    }

    fn has_duplicate(&self, matcher: &RequestMatcher) -> bool {
        self.entries
            .iter()
            .filter(|entry| entry.matcher.is_identical_to(matcher))
            .nth(1)
            .is_some()
    }

    pub fn entries(&self) -> &[RoutingEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn find_identical(&self, matcher: &RequestMatcher) -> Option<&RoutingEntry> {
        self.entries
            .iter()
            .find(|entry| entry.matcher.is_identical_to(matcher))
    }

    /// The best matching route for a request.
    pub fn find_route(&self, hostname: &str, path: &str) -> Option<&RoutingEntry> {
        select_best(&self.entries, hostname, path, |entry| &entry.matcher)
    }

    /// First certificate in table order that is valid for `hostname`.
    pub fn find_certificate(&self, hostname: &str) -> Option<&Arc<TlsCertificate>> {
        self.entries
            .iter()
            .filter_map(|entry| entry.certificate.as_ref())
            .find(|certificate| certificate.is_valid_for_host(hostname))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        core::backend::BackendAddress,
        ports::cluster::{ObjectRef, SecretData},
    };

    fn forward(last_octet: u8) -> Backend {
        Backend::Forward(BackendAddress::new(
            format!("10.0.0.{last_octet}").parse().unwrap(),
            8080,
        ))
    }

    fn certificate(hostnames: Option<Vec<&str>>) -> Arc<TlsCertificate> {
        let generated = rcgen::generate_simple_self_signed(vec!["a.test".to_string()]).unwrap();
        Arc::new(TlsCertificate::from_secret(&SecretData {
            object: ObjectRef::new("default", "tls"),
            cert_pem: Some(generated.cert.pem().into_bytes()),
            key_pem: Some(generated.signing_key.serialize_pem().into_bytes()),
            valid_hostnames: hostnames.map(|h| h.into_iter().map(String::from).collect()),
        }))
    }

    #[test]
    fn test_find_route() {
        let table = RoutingTable::new(vec![
            RoutingEntry::new(RequestMatcher::new("a.test", "/", PathType::Prefix)).with_backend(forward(1)),
            RoutingEntry::new(RequestMatcher::new("a.test", "/api", PathType::Prefix)).with_backend(forward(2)),
        ]);
        assert_eq!(table.find_route("a.test", "/api/x").unwrap().backend, Some(forward(2)));
        assert_eq!(table.find_route("a.test", "/other").unwrap().backend, Some(forward(1)));
        assert!(table.find_route("b.test", "/").is_none());
    }

    #[test]
    fn test_carry_forward_fills_gaps_only() {
        let previous = RoutingTable::new(vec![
            RoutingEntry::new(RequestMatcher::new("a.test", "/", PathType::Prefix)).with_backend(forward(1)),
            RoutingEntry::new(RequestMatcher::new("b.test", "/", PathType::Prefix)).with_backend(forward(2)),
        ]);

        let (table, carried) = RoutingTable::with_carry_forward(
            vec![
                RoutingEntry::new(RequestMatcher::new("a.test", "/", PathType::Prefix)),
                RoutingEntry::new(RequestMatcher::new("b.test", "/", PathType::Prefix)).with_backend(forward(3)),
                RoutingEntry::new(RequestMatcher::new("c.test", "/", PathType::Prefix)),
            ],
            &previous,
        );

        assert_eq!(carried, 1);
        assert_eq!(table.entries()[0].backend, Some(forward(1)));
        assert_eq!(table.entries()[1].backend, Some(forward(3)));
        assert_eq!(table.entries()[2].backend, None);
    }

    #[test]
    fn test_carry_forward_requires_identical_matcher() {
        let previous = RoutingTable::new(vec![
            RoutingEntry::new(RequestMatcher::new("a.test", "/", PathType::Prefix)).with_backend(forward(1)),
        ]);
        let (table, carried) = RoutingTable::with_carry_forward(
            vec![RoutingEntry::new(RequestMatcher::new("a.test", "/", PathType::Exact))],
            &previous,
        );
        assert_eq!(carried, 0);
        assert!(table.entries()[0].backend.is_none());
    }

    #[test]
    fn test_duplicate_rules_ignore_prefixes() {
        let table = RoutingTable::new(vec![
            RoutingEntry::new(RequestMatcher::new("a.test", "/app", PathType::Prefix)),
            RoutingEntry::new(RequestMatcher::new("a.test", "/only", PathType::Exact)),
            RoutingEntry::new(RequestMatcher::new("a.test", "/app", PathType::Prefix)),
            RoutingEntry::new(RequestMatcher::new("a.test", "/only", PathType::Exact)),
        ]);
        assert_eq!(table.duplicate_rules(), vec![(1, 3)]);
        assert!(table.has_duplicate(&RequestMatcher::new("a.test", "/only", PathType::Exact)));
        assert!(!RoutingTable::empty().has_duplicate(&RequestMatcher::new(
            "a.test",
            "/only",
            PathType::Exact
        )));
    }

    #[test]
    fn test_duplicate_reported_once() {
        let duplicated = || {
            vec![
                RoutingEntry::new(RequestMatcher::new("a.test", "/only", PathType::Exact)),
                RoutingEntry::new(RequestMatcher::new("a.test", "/only", PathType::Exact)),
            ]
        };
        let first = RoutingTable::new(duplicated());
        assert_eq!(first.new_duplicate_rules(&RoutingTable::empty()), vec![(0, 1)]);

        let (second, _) = RoutingTable::with_carry_forward(duplicated(), &first);
        assert!(second.new_duplicate_rules(&first).is_empty());

        let (resolved, _) = RoutingTable::with_carry_forward(duplicated()[..1].to_vec(), &second);
        assert!(resolved.duplicate_rules().is_empty());
        let (reintroduced, _) = RoutingTable::with_carry_forward(duplicated(), &resolved);
        assert_eq!(reintroduced.new_duplicate_rules(&resolved), vec![(0, 1)]);
    }

    #[test]
    fn test_find_certificate_first_valid_wins() {
        let restricted = certificate(Some(vec!["other.test"]));
        let open = certificate(None);
        let table = RoutingTable::new(vec![
            RoutingEntry::new(RequestMatcher::new("x.test", "/", PathType::Prefix))
                .with_certificate(restricted.clone()),
            RoutingEntry::new(RequestMatcher::new("y.test", "/", PathType::Prefix))
                .with_certificate(open.clone()),
        ]);

        assert!(Arc::ptr_eq(table.find_certificate("a.test").unwrap(), &open));
        assert!(Arc::ptr_eq(table.find_certificate("other.test").unwrap(), &restricted));
        assert!(RoutingTable::empty().find_certificate("a.test").is_none());
    }

    #[test]
    fn test_shared_table_swap() {
        let shared = shared_routing_table(RoutingTable::empty());
        let before = shared.load_full();
        shared.store(Arc::new(RoutingTable::new(vec![RoutingEntry::new(
            RequestMatcher::new("a.test", "/", PathType::Prefix),
        )])));
        assert!(before.is_empty());
        assert_eq!(shared.load().len(), 1);
    }
}
