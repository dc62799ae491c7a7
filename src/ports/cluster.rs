//! Cluster-facing port: where routing intent, secrets and service addresses
//! come from, and where the controller reports its reachable address.

use std::{collections::BTreeMap, fmt, net::IpAddr};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::core::matcher::PathType;

/// Errors reported by a [`ClusterSource`]
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ClusterError {
    /// The cluster API rejected or failed the call
    #[error("Cluster API error: {0}")]
    Api(String),

    /// The referenced object does not exist
    #[error("{kind} {object} not found")]
    NotFound { kind: &'static str, object: ObjectRef },

    /// The object exists but cannot be used as referenced
    #[error("Invalid {kind} {object}: {reason}")]
    Invalid {
        kind: &'static str,
        object: ObjectRef,
        reason: String,
    },
}

/// Result type alias for cluster operations
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Namespaced reference to a cluster object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef {
    pub namespace: String,
    pub name: String,
}

impl ObjectRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A service port, either by number or by the name declared on the service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ServicePort {
    Number(u16),
    Name(String),
}

impl fmt::Display for ServicePort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(number) => write!(f, "{number}"),
            Self::Name(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceRef {
    pub object: ObjectRef,
    pub port: ServicePort,
}

/// One path rule of a routing declaration, flattened together with everything
/// needed to resolve it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingDeclaration {
    /// The declaring object (status is published back to it)
    pub owner: ObjectRef,
    pub host: String,
    pub path: String,
    pub path_type: PathType,
    /// Secrets whose certificates may serve `host`, in declaration order
    pub secret_refs: Vec<ObjectRef>,
    pub service: Option<ServiceRef>,
    /// Ingress class this declaration is addressed to, if any
    pub ownership_marker: Option<String>,
    pub annotations: BTreeMap<String, String>,
}

/// Certificate material read from a secret.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SecretData {
    pub object: ObjectRef,
    pub cert_pem: Option<Vec<u8>>,
    pub key_pem: Option<Vec<u8>>,
    /// Hostnames the certificate was issued for; `None` means any host
    pub valid_hostnames: Option<Vec<String>>,
}

impl fmt::Debug for SecretData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretData")
            .field("object", &self.object)
            .field("has_cert", &self.cert_pem.is_some())
            .field("has_key", &self.key_pem.is_some())
            .field("valid_hostnames", &self.valid_hostnames)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceAddress {
    pub ip: IpAddr,
    pub port: u16,
}

/// An address under which this controller is reachable from outside.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReachableAddress {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

/// ClusterSource defines the port (interface) to the cluster API
#[async_trait]
pub trait ClusterSource: Send + Sync + 'static {
    /// List every routing rule in the cluster, regardless of owner.
    async fn list_routing_declarations(&self) -> ClusterResult<Vec<RoutingDeclaration>>;

    async fn fetch_secret(&self, secret: &ObjectRef) -> ClusterResult<SecretData>;

    /// Resolve a service reference to the address traffic is forwarded to.
    async fn resolve_service_address(&self, service: &ServiceRef) -> ClusterResult<ServiceAddress>;

    /// Externally visible addresses of the controller's own service. Empty when
    /// none are assigned yet.
    async fn reachable_addresses(&self) -> ClusterResult<Vec<ReachableAddress>>;

    /// Record `addresses` in the status of the declaring object.
    async fn publish_status(
        &self,
        owner: &ObjectRef,
        addresses: &[ReachableAddress],
    ) -> ClusterResult<()>;
}
