//! Kubernetes implementation of [`ClusterSource`].
//!
//! Ingresses are flattened into one [`RoutingDeclaration`] per path rule.
//! Secrets and Services are read on demand, and status is written back with a
//! merge patch under the configured field manager.

use std::{net::IpAddr, str::FromStr};

use async_trait::async_trait;
use k8s_openapi::api::{
    core::v1::{Secret, Service},
    networking::v1::{HTTPIngressPath, Ingress, IngressServiceBackend},
};
use kube::{
    Client, ResourceExt,
    api::{Api, ListParams, Patch, PatchParams},
};
use serde_json::json;

use crate::{
    config::ClusterConfig,
    core::matcher::PathType,
    ports::cluster::{
        ClusterError, ClusterResult, ClusterSource, ObjectRef, ReachableAddress,
        RoutingDeclaration, SecretData, ServiceAddress, ServicePort, ServiceRef,
    },
};

pub const INGRESS_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";
pub const ALT_NAMES_ANNOTATION: &str = "cert-manager.io/alt-names";
const TLS_CERT_KEY: &str = "tls.crt";
const TLS_KEY_KEY: &str = "tls.key";
const DEFAULT_NAMESPACE: &str = "default";

pub struct KubeCluster {
    client: Client,
    /// Namespace of the controller's own Service
    namespace: String,
    service_name: Option<String>,
    field_manager: String,
}

impl KubeCluster {
    pub fn new(client: Client, config: &ClusterConfig) -> Self {
        Self {
            client,
            namespace: config.namespace.clone(),
            service_name: config.service_name.clone(),
            field_manager: config.field_manager.clone(),
        }
    }

    /// Connect using the in-cluster environment or the local kubeconfig.
    pub async fn try_default(config: &ClusterConfig) -> eyre::Result<Self> {
        let client = Client::try_default().await?;
        tracing::info!(
            namespace = %config.namespace,
            service = ?config.service_name,
            "Connected to Kubernetes API"
        );
        Ok(Self::new(client, config))
    }
}

fn api_error(e: kube::Error) -> ClusterError {
    ClusterError::Api(e.to_string())
}

#[async_trait]
impl ClusterSource for KubeCluster {
    async fn list_routing_declarations(&self) -> ClusterResult<Vec<RoutingDeclaration>> {
        let ingresses = Api::<Ingress>::all(self.client.clone())
            .list(&ListParams::default())
            .await
            .map_err(api_error)?;

        Ok(ingresses.items.iter().flat_map(flatten_ingress).collect())
    }

    async fn fetch_secret(&self, secret: &ObjectRef) -> ClusterResult<SecretData> {
        let found = Api::<Secret>::namespaced(self.client.clone(), &secret.namespace)
            .get_opt(&secret.name)
            .await
            .map_err(api_error)?;

        match found {
            Some(found) => Ok(secret_data(&found)),
            None => Err(ClusterError::NotFound {
                kind: "Secret",
                object: secret.clone(),
            }),
        }
    }

    async fn resolve_service_address(&self, service: &ServiceRef) -> ClusterResult<ServiceAddress> {
        let found = Api::<Service>::namespaced(self.client.clone(), &service.object.namespace)
            .get_opt(&service.object.name)
            .await
            .map_err(api_error)?
            .ok_or_else(|| ClusterError::NotFound {
                kind: "Service",
                object: service.object.clone(),
            })?;

        service_address(&found, service)
    }

    async fn reachable_addresses(&self) -> ClusterResult<Vec<ReachableAddress>> {
        let Some(service_name) = &self.service_name else {
            return Ok(Vec::new());
        };

        let found = Api::<Service>::namespaced(self.client.clone(), &self.namespace)
            .get_opt(service_name)
            .await
            .map_err(api_error)?
            .ok_or_else(|| ClusterError::NotFound {
                kind: "Service",
                object: ObjectRef::new(&self.namespace, service_name),
            })?;

        Ok(load_balancer_addresses(&found))
    }

    async fn publish_status(
        &self,
        owner: &ObjectRef,
        addresses: &[ReachableAddress],
    ) -> ClusterResult<()> {
        let patch = json!({
            "status": {
                "loadBalancer": {
                    "ingress": addresses,
                }
            }
        });

        Api::<Ingress>::namespaced(self.client.clone(), &owner.namespace)
            .patch_status(
                &owner.name,
                &PatchParams::apply(&self.field_manager),
                &Patch::Merge(&patch),
            )
            .await
            .map_err(api_error)?;

        tracing::debug!(ingress = %owner, "Published load balancer status");
        Ok(())
    }
}

/// One declaration per path rule of an Ingress. Rules without a host and
/// paths with an unknown path type are skipped.
pub fn flatten_ingress(ingress: &Ingress) -> Vec<RoutingDeclaration> {
    let owner = ObjectRef::new(
        ingress
            .namespace()
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
        ingress.name_any(),
    );
    let Some(spec) = &ingress.spec else {
        return Vec::new();
    };

    let ownership_marker = ingress
        .annotations()
        .get(INGRESS_CLASS_ANNOTATION)
        .cloned()
        .or_else(|| spec.ingress_class_name.clone());
    let annotations = ingress.annotations().clone();
    let tls = spec.tls.as_deref().unwrap_or_default();

    let mut declarations = Vec::new();
    for rule in spec.rules.iter().flatten() {
        let Some(host) = rule.host.as_deref().filter(|h| !h.is_empty()) else {
            tracing::debug!(ingress = %owner, "Skipping rule without host");
            continue;
        };

        let secret_refs: Vec<ObjectRef> = tls
            .iter()
            .filter(|entry| {
                entry
                    .hosts
                    .iter()
                    .flatten()
                    .any(|h| h.eq_ignore_ascii_case(host))
            })
            .filter_map(|entry| entry.secret_name.as_ref())
            .map(|secret| ObjectRef::new(&owner.namespace, secret))
            .collect();

        for path in rule.http.iter().flat_map(|http| &http.paths) {
            let Some(declaration) = flatten_path(&owner, host, path) else {
                continue;
            };
            declarations.push(RoutingDeclaration {
                secret_refs: secret_refs.clone(),
                ownership_marker: ownership_marker.clone(),
                annotations: annotations.clone(),
                ..declaration
            });
        }
    }

    declarations
}

fn flatten_path(owner: &ObjectRef, host: &str, path: &HTTPIngressPath) -> Option<RoutingDeclaration> {
    let Some(route) = path.path.as_deref() else {
        tracing::debug!(ingress = %owner, host, "Skipping path rule without path");
        return None;
    };
    let path_type = match PathType::from_str(&path.path_type) {
        Ok(path_type) => path_type,
        Err(e) => {
            tracing::warn!(ingress = %owner, host, path = route, "Skipping path rule: {}", e);
            return None;
        }
    };

    Some(RoutingDeclaration {
        owner: owner.clone(),
        host: host.to_string(),
        path: route.to_string(),
        path_type,
        secret_refs: Vec::new(),
        service: path
            .backend
            .service
            .as_ref()
            .and_then(|service| service_ref(owner, service)),
        ownership_marker: None,
        annotations: Default::default(),
    })
}

fn service_ref(owner: &ObjectRef, backend: &IngressServiceBackend) -> Option<ServiceRef> {
    let port = backend.port.as_ref()?;
    let port = match (port.number, &port.name) {
        (Some(number), _) => ServicePort::Number(u16::try_from(number).ok()?),
        (None, Some(name)) => ServicePort::Name(name.clone()),
        (None, None) => return None,
    };
    Some(ServiceRef {
        object: ObjectRef::new(&owner.namespace, &backend.name),
        port,
    })
}

/// Certificate material and issued hostnames of a TLS secret.
pub fn secret_data(secret: &Secret) -> SecretData {
    let data = secret.data.as_ref();
    let field = |key: &str| data.and_then(|d| d.get(key)).map(|bytes| bytes.0.clone());

    SecretData {
        object: ObjectRef::new(
            secret
                .namespace()
                .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
            secret.name_any(),
        ),
        cert_pem: field(TLS_CERT_KEY),
        key_pem: field(TLS_KEY_KEY),
        valid_hostnames: secret.annotations().get(ALT_NAMES_ANNOTATION).map(|names| {
            names
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(String::from)
                .collect()
        }),
    }
}

/// Cluster IP and port a reference to `service` forwards to.
pub fn service_address(service: &Service, reference: &ServiceRef) -> ClusterResult<ServiceAddress> {
    let invalid = |reason: String| ClusterError::Invalid {
        kind: "Service",
        object: reference.object.clone(),
        reason,
    };
    let spec = service
        .spec
        .as_ref()
        .ok_or_else(|| invalid("no spec".to_string()))?;

    let ip = match spec.cluster_ip.as_deref() {
        None | Some("") => return Err(invalid("no cluster IP assigned".to_string())),
        Some("None") => return Err(invalid("headless services are not supported".to_string())),
        Some(raw) => raw
            .parse::<IpAddr>()
            .map_err(|e| invalid(format!("cluster IP {raw:?}: {e}")))?,
    };

    let port = match &reference.port {
        ServicePort::Number(number) => *number,
        ServicePort::Name(name) => spec
            .ports
            .iter()
            .flatten()
            .find(|port| port.name.as_deref() == Some(name.as_str()))
            .and_then(|port| u16::try_from(port.port).ok())
            .ok_or_else(|| invalid(format!("no port named {name:?}")))?,
    };

    Ok(ServiceAddress { ip, port })
}

pub fn load_balancer_addresses(service: &Service) -> Vec<ReachableAddress> {
    service
        .status
        .as_ref()
        .and_then(|status| status.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .into_iter()
        .flatten()
        .filter(|ingress| ingress.ip.is_some() || ingress.hostname.is_some())
        .map(|ingress| ReachableAddress {
            ip: ingress.ip.clone(),
            hostname: ingress.hostname.clone(),
        })
        .collect()
}
