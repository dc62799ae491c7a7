//! kingress - a Kubernetes ingress controller and TLS-terminating reverse proxy.
//!
//! The controller watches `Ingress` objects addressed to its ingress class and
//! keeps an in-memory routing table built from them. Plaintext and TLS
//! listeners route each request through that table:
//!
//! - the most specific `(host, path, pathType)` rule wins
//! - TLS certificates are chosen per handshake from the SNI hostname, and a
//!   handshake with no matching certificate is refused
//! - plaintext requests to secured routes are redirected to HTTPS
//! - a chain of plugins may answer a request before it reaches its service
//! - every response carries an opaque session cookie
//! - WebSocket upgrades are spliced through to the service
//!
//! The routing table is rebuilt on a fixed interval and swapped in atomically.
//! A lookup that fails during a rebuild leaves the affected rule with the
//! certificate or service address it had before.
//!
//! # Architecture
//! **Ports** (traits for the cluster, the session store and the backend HTTP
//! client) are kept apart from **adapters** (Kubernetes, in-memory sessions,
//! hyper). Routing, dispatch and reconciliation live in `core` and only talk to
//! ports, so they can be driven by test doubles.
//!
//! # Error Handling
//! Startup and wiring return `eyre::Result<T>`; components expose their own
//! `thiserror` error types.
pub mod config;
pub mod controller;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

pub use crate::{
    adapters::{HttpClientAdapter, KubeCluster, MemorySessionStore},
    controller::{IngressController, default_plugins},
    ports::{cluster::ClusterSource, http_client::HttpClient, session_store::SessionStore},
    utils::GracefulShutdown,
};
