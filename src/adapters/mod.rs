pub mod basic_auth;
pub mod http_client;
pub mod kube_cluster;
pub mod listener;
pub mod memory_session_store;
pub mod tls;

/// Re-export commonly used types from adapters
pub use basic_auth::BasicAuthPlugin;
pub use http_client::HttpClientAdapter;
pub use kube_cluster::KubeCluster;
pub use memory_session_store::MemorySessionStore;
pub use tls::SniCertResolver;
