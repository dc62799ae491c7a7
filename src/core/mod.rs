pub mod annotations;
pub mod backend;
pub mod certificate;
pub mod dispatcher;
pub mod matcher;
pub mod plugin;
pub mod reconciler;
pub mod request;
pub mod routing;
pub mod session;

pub use backend::{Backend, BackendAddress, BackendContext};
pub use dispatcher::Dispatcher;
pub use matcher::{PathType, RequestMatcher};
pub use plugin::{Plugin, PluginChain, PluginRequest};
pub use reconciler::{Reconciler, ReconcilerSettings};
pub use routing::{RoutingEntry, RoutingTable, SharedRoutingTable};
