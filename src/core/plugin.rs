//! Request interceptors that run between routing and the backend.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::core::{annotations::RouteMetadata, backend::Backend, request::Request};

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum PluginError {
    #[error("Plugin '{plugin}' failed to initialize: {reason}")]
    Initialize { plugin: String, reason: String },

    #[error("Plugin '{plugin}' failed while handling a request: {reason}")]
    Request { plugin: String, reason: String },
}

/// What a plugin sees of a request.
pub struct PluginRequest<'a> {
    pub request: &'a mut Request,
    /// Metadata of the matched route; `None` when nothing matched
    pub route: Option<&'a RouteMetadata>,
    /// The backend the request will be handed to if no plugin responds
    pub backend: &'a Backend,
}

/// A request interceptor.
///
/// A plugin may queue response headers, change the headers forwarded to the
/// backend, change session data, or answer the request itself, which ends the
/// chain.
#[async_trait]
pub trait Plugin: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Called once at startup, before any request is served.
    async fn initialize(&self) -> eyre::Result<()> {
        Ok(())
    }

    async fn on_request(&self, ctx: &mut PluginRequest<'_>) -> eyre::Result<()>;
}

/// Ordered list of plugins run for every request.
#[derive(Clone, Default)]
pub struct PluginChain {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginChain {
    pub fn new(plugins: Vec<Arc<dyn Plugin>>) -> Self {
        Self { plugins }
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.plugins.iter().map(|plugin| plugin.name()).collect()
    }

    pub async fn initialize(&self) -> Result<(), PluginError> {
        for plugin in &self.plugins {
            plugin
                .initialize()
                .await
                .map_err(|e| PluginError::Initialize {
                    plugin: plugin.name().to_string(),
                    reason: format!("{e:#}"),
                })?;
            tracing::info!(plugin = plugin.name(), "Plugin initialized");
        }
        Ok(())
    }

    /// Run plugins in order until one of them responds.
    pub async fn run(&self, ctx: &mut PluginRequest<'_>) -> Result<(), PluginError> {
        for plugin in &self.plugins {
            plugin
                .on_request(ctx)
                .await
                .map_err(|e| PluginError::Request {
                    plugin: plugin.name().to_string(),
                    reason: format!("{e:#}"),
                })?;
            if ctx.request.has_responded() {
                tracing::debug!(
                    plugin = plugin.name(),
                    host = %ctx.request.hostname(),
                    path = %ctx.request.path(),
                    "Plugin answered the request"
                );
                break;
            }
        }
        Ok(())
    }
}
