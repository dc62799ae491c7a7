//! Routing table reconciliation.
//!
//! Each cycle lists every routing declaration, keeps the ones addressed to
//! this controller, resolves certificates and service addresses for them and
//! publishes the resulting table with a single atomic swap. A failed lookup
//! only blanks the affected rule's certificate or backend, which is then taken
//! over from the previous table's identical rule. A failed listing keeps the
//! previous table as it is.

use std::{
    collections::{BTreeSet, HashMap},
    future::Future,
    sync::Arc,
    time::Duration,
};

use thiserror::Error;
use tokio::time::{MissedTickBehavior, interval, timeout};
use tracing::Instrument;

use crate::{
    core::{
        annotations::RouteMetadata,
        backend::{Backend, BackendAddress},
        certificate::TlsCertificate,
        matcher::RequestMatcher,
        routing::{RoutingEntry, RoutingTable, SharedRoutingTable},
    },
    metrics::{increment_reconcile_cycles, set_routing_table_entries},
    ports::cluster::{ClusterError, ClusterSource, ObjectRef, RoutingDeclaration, ServiceRef},
    tracing_setup::configure_component_tracing,
    utils::graceful_shutdown::ShutdownToken,
};

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ReconcileError {
    #[error("Failed to list routing declarations: {0}")]
    List(#[source] ClusterError),

    #[error("Listing routing declarations timed out after {0:?}")]
    ListTimeout(Duration),
}

#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    /// Declarations are served only when their ownership marker equals this
    pub ingress_class: String,
    pub interval: Duration,
    pub call_timeout: Duration,
}

/// Counters describing one completed cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Rules owned by this controller
    pub rules: usize,
    /// Rules with a certificate resolved this cycle
    pub certificates: usize,
    /// Rules with a backend resolved this cycle
    pub backends: usize,
    /// Rules that took data over from the previous table
    pub carried_forward: usize,
    /// Rules published without a certificate or backend they asked for
    pub incomplete: usize,
}

pub struct Reconciler {
    cluster: Arc<dyn ClusterSource>,
    routing: SharedRoutingTable,
    settings: ReconcilerSettings,
}

enum Lookup<T> {
    Found(T),
    Failed(String),
}

impl Reconciler {
    pub fn new(
        cluster: Arc<dyn ClusterSource>,
        routing: SharedRoutingTable,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            cluster,
            routing,
            settings,
        }
    }

    pub fn routing_table(&self) -> SharedRoutingTable {
        self.routing.clone()
    }

    /// Run one reconciliation cycle.
    pub async fn reconcile_once(&self) -> Result<ReconcileReport, ReconcileError> {
        let declarations = match timeout(
            self.settings.call_timeout,
            self.cluster.list_routing_declarations(),
        )
        .await
        {
            Ok(Ok(declarations)) => declarations,
            Ok(Err(e)) => {
                increment_reconcile_cycles("failed");
                return Err(ReconcileError::List(e));
            }
            Err(_) => {
                increment_reconcile_cycles("failed");
                return Err(ReconcileError::ListTimeout(self.settings.call_timeout));
            }
        };

        let owned: Vec<RoutingDeclaration> = declarations
            .into_iter()
            .filter(|declaration| {
                declaration.ownership_marker.as_deref() == Some(self.settings.ingress_class.as_str())
            })
            .collect();

        let previous = self.routing.load_full();
        let mut report = ReconcileReport {
            rules: owned.len(),
            ..Default::default()
        };
        let mut certificates: HashMap<ObjectRef, Lookup<Arc<TlsCertificate>>> = HashMap::new();
        let mut services: HashMap<ServiceRef, Lookup<BackendAddress>> = HashMap::new();
        let mut entries = Vec::with_capacity(owned.len());

        // Whether each published entry asked for a certificate and a backend.
        let mut wanted = Vec::with_capacity(owned.len());

        for declaration in &owned {
            let Some((matcher, forwardable)) = self.build_matcher(declaration, &previous) else {
                report.incomplete += 1;
                continue;
            };
            let mut entry = RoutingEntry::new(matcher);
            if !forwardable {
                entry = entry.with_forwarding_disabled();
            }

            if !declaration.secret_refs.is_empty() {
                entry.certificate = self
                    .resolve_certificate(declaration, &mut certificates)
                    .await;
                if entry.certificate.is_some() {
                    report.certificates += 1;
                }
            }

            if let Some(service) = declaration.service.as_ref().filter(|_| forwardable) {
                entry.backend = self
                    .resolve_backend(declaration, service, &mut services)
                    .await;
                if entry.backend.is_some() {
                    report.backends += 1;
                }
            }

            wanted.push((!declaration.secret_refs.is_empty(), declaration.service.is_some()));
            entries.push(entry);
        }

        let (table, carried) = RoutingTable::with_carry_forward(entries, &previous);
        report.carried_forward = carried;
        report.incomplete += table
            .entries()
            .iter()
            .zip(&wanted)
            .filter(|(entry, (certificate, backend))| {
                (*certificate && entry.certificate.is_none()) || (*backend && entry.backend.is_none())
            })
            .count();

        let secure = table.entries().iter().filter(|e| e.is_secure()).count();
        set_routing_table_entries(table.len(), secure);
        self.routing.store(Arc::new(table));
        increment_reconcile_cycles("succeeded");

        tracing::debug!(
            rules = report.rules,
            certificates = report.certificates,
            backends = report.backends,
            carried_forward = report.carried_forward,
            incomplete = report.incomplete,
            "Routing table published"
        );

        self.publish_status(&owned).await;

        Ok(report)
    }

    /// Run cycles on the configured interval until shutdown.
    pub async fn run(&self, mut shutdown: ShutdownToken) {
        let span = configure_component_tracing("reconciler");
        async {
            let mut ticker = interval(self.settings.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; the initial pass already ran.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.reconcile_once().await {
                            tracing::error!("Reconciliation failed, keeping previous routing table: {}", e);
                        }
                    }
                    _ = shutdown.wait_for_shutdown() => {
                        tracing::info!("Reconciliation loop stopping");
                        break;
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Build the matcher for a declaration, paired with whether its backend
    /// may be resolved. Annotations that fail to parse fall back to the
    /// previous cycle's metadata for the identical rule, as long as that rule
    /// was built from annotations that parsed. Otherwise the rule is published
    /// with no backend until the annotations are fixed.
    fn build_matcher(
        &self,
        declaration: &RoutingDeclaration,
        previous: &RoutingTable,
    ) -> Option<(RequestMatcher, bool)> {
        if declaration.host.is_empty() {
            tracing::warn!(owner = %declaration.owner, "Skipping rule without a host");
            return None;
        }

        let matcher =
            RequestMatcher::new(&declaration.host, &declaration.path, declaration.path_type);

        match RouteMetadata::from_annotations(
            declaration.owner.clone(),
            declaration.annotations.clone(),
        ) {
            Ok(metadata) => Some((matcher.with_metadata(metadata), true)),
            Err(e) => match previous
                .find_identical(&matcher)
                .filter(|entry| !entry.forwarding_disabled)
            {
                Some(entry) => {
                    tracing::warn!(
                        owner = %declaration.owner,
                        host = %declaration.host,
                        path = %declaration.path,
                        "Invalid annotations, keeping previous settings: {}",
                        e
                    );
                    let metadata = entry.matcher.metadata().clone();
                    Some((matcher.with_metadata(metadata), true))
                }
                None => {
                    tracing::warn!(
                        owner = %declaration.owner,
                        host = %declaration.host,
                        path = %declaration.path,
                        "Invalid annotations, route disabled until fixed: {}",
                        e
                    );
                    Some((matcher, false))
                }
            },
        }
    }

    /// First certificate among the referenced secrets that is valid for the
    /// rule's host.
    async fn resolve_certificate(
        &self,
        declaration: &RoutingDeclaration,
        cache: &mut HashMap<ObjectRef, Lookup<Arc<TlsCertificate>>>,
    ) -> Option<Arc<TlsCertificate>> {
        for secret in &declaration.secret_refs {
            if !cache.contains_key(secret) {
                let lookup = match self.bounded(self.cluster.fetch_secret(secret)).await {
                    Ok(data) => Lookup::Found(Arc::new(TlsCertificate::from_secret(&data))),
                    Err(reason) => Lookup::Failed(reason),
                };
                cache.insert(secret.clone(), lookup);
            }

            match cache.get(secret) {
                Some(Lookup::Found(certificate)) if certificate.is_valid_for_host(&declaration.host) => {
                    return Some(certificate.clone());
                }
                Some(Lookup::Found(_)) | None => {}
                Some(Lookup::Failed(reason)) => {
                    tracing::warn!(
                        owner = %declaration.owner,
                        secret = %secret,
                        "Failed to fetch TLS secret: {}",
                        reason
                    );
                }
            }
        }

        tracing::warn!(
            owner = %declaration.owner,
            host = %declaration.host,
            "No referenced certificate is valid for host"
        );
        None
    }

    async fn resolve_backend(
        &self,
        declaration: &RoutingDeclaration,
        service: &ServiceRef,
        cache: &mut HashMap<ServiceRef, Lookup<BackendAddress>>,
    ) -> Option<Backend> {
        if !cache.contains_key(service) {
            let lookup = match self
                .bounded(self.cluster.resolve_service_address(service))
                .await
            {
                Ok(address) => Lookup::Found(BackendAddress::new(address.ip, address.port)),
                Err(reason) => Lookup::Failed(reason),
            };
            cache.insert(service.clone(), lookup);
        }

        match cache.get(service) {
            Some(Lookup::Found(address)) => Some(Backend::Forward(*address)),
            Some(Lookup::Failed(reason)) => {
                tracing::warn!(
                    owner = %declaration.owner,
                    service = %service.object,
                    port = %service.port,
                    "Failed to resolve service: {}",
                    reason
                );
                None
            }
            None => None,
        }
    }

    /// Report this controller's reachable addresses on every owned object.
    async fn publish_status(&self, owned: &[RoutingDeclaration]) {
        let addresses = match self.bounded(self.cluster.reachable_addresses()).await {
            Ok(addresses) if !addresses.is_empty() => addresses,
            Ok(_) => return,
            Err(reason) => {
                tracing::debug!("Reachable address unavailable: {}", reason);
                return;
            }
        };

        let owners: BTreeSet<&ObjectRef> = owned.iter().map(|d| &d.owner).collect();
        for owner in owners {
            if let Err(reason) = self
                .bounded(self.cluster.publish_status(owner, &addresses))
                .await
            {
                tracing::warn!(owner = %owner, "Failed to publish status: {}", reason);
            }
        }
    }

    /// Apply the per-call timeout, flattening both failure kinds to a message.
    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, ClusterError>>,
    ) -> Result<T, String> {
        match timeout(self.settings.call_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("timed out after {:?}", self.settings.call_timeout)),
        }
    }
}
