//! Assembles the controller from its ports and runs it.

use std::sync::Arc;

use eyre::{Context, Result, eyre};

use crate::{
    adapters::{basic_auth::BasicAuthPlugin, listener, tls::build_server_config},
    config::ControllerConfig,
    core::{
        backend::BackendContext,
        dispatcher::Dispatcher,
        plugin::{Plugin, PluginChain},
        reconciler::{Reconciler, ReconcilerSettings},
        routing::{RoutingTable, SharedRoutingTable, shared_routing_table},
        session::SessionCookie,
    },
    ports::{cluster::ClusterSource, http_client::HttpClient, session_store::SessionStore},
    utils::graceful_shutdown::{GracefulShutdown, ShutdownReason},
};

/// Plugins enabled by configuration, in the order they run.
pub fn default_plugins(config: &ControllerConfig) -> PluginChain {
    let mut plugins: Vec<Arc<dyn Plugin>> = Vec::new();
    if config.plugins.basic_auth {
        plugins.push(Arc::new(BasicAuthPlugin::new()));
    }
    PluginChain::new(plugins)
}

pub struct IngressController {
    config: ControllerConfig,
    cluster: Arc<dyn ClusterSource>,
    sessions: Arc<dyn SessionStore>,
    http_client: Arc<dyn HttpClient>,
    plugins: Arc<PluginChain>,
    routing: SharedRoutingTable,
}

impl IngressController {
    pub fn new(
        config: ControllerConfig,
        cluster: Arc<dyn ClusterSource>,
        sessions: Arc<dyn SessionStore>,
        http_client: Arc<dyn HttpClient>,
        plugins: PluginChain,
    ) -> Self {
        Self {
            config,
            cluster,
            sessions,
            http_client,
            plugins: Arc::new(plugins),
            routing: shared_routing_table(RoutingTable::empty()),
        }
    }

    pub fn routing_table(&self) -> SharedRoutingTable {
        self.routing.clone()
    }

    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(
            self.routing.clone(),
            self.plugins.clone(),
            self.sessions.clone(),
            SessionCookie::new(&self.config.session.cookie_name),
            BackendContext {
                http_client: self.http_client.clone(),
                proxy_timeout: self.config.proxy.timeout,
            },
        )
        .with_dummy_hosts(&self.config.dummy_hosts)
    }

    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(
            self.cluster.clone(),
            self.routing.clone(),
            ReconcilerSettings {
                ingress_class: self.config.cluster.ingress_class.clone(),
                interval: self.config.reconcile.interval,
                call_timeout: self.config.reconcile.call_timeout,
            },
        )
    }

    /// Prepare the session store and plugins and build the first routing
    /// table. Any failure here is fatal.
    pub async fn initialize(&self) -> Result<()> {
        self.sessions
            .initialize()
            .await
            .context("Failed to initialize session store")?;
        self.plugins
            .initialize()
            .await
            .context("Failed to initialize plugins")?;

        let report = self
            .reconciler()
            .reconcile_once()
            .await
            .context("Initial reconciliation failed")?;
        tracing::info!(
            rules = report.rules,
            plugins = ?self.plugins.names(),
            "Controller initialized"
        );
        Ok(())
    }

    /// Serve both listeners and keep reconciling until shutdown. Returns an
    /// error when a listener could not start or stopped on its own.
    pub async fn run(&self, shutdown: Arc<GracefulShutdown>) -> Result<()> {
        let http = listener::bind(&self.config.http_addr).await?;
        let https = listener::bind(&self.config.https_addr).await?;
        let tls_config = build_server_config(self.routing.clone())?;
        let dispatcher = Arc::new(self.dispatcher());

        let signals = shutdown.clone();
        tokio::spawn(async move { signals.run_signal_handler().await });

        let reconciler = self.reconciler();
        let token = shutdown.shutdown_token();
        let mut tasks = vec![tokio::spawn(async move {
            reconciler.run(token).await;
            Ok(())
        })];

        let listeners = [
            (
                "http",
                tokio::spawn(listener::serve_http(
                    http,
                    dispatcher.clone(),
                    shutdown.shutdown_token(),
                )),
            ),
            (
                "https",
                tokio::spawn(listener::serve_https(
                    https,
                    dispatcher,
                    tls_config,
                    shutdown.shutdown_token(),
                )),
            ),
        ];
        for (name, handle) in listeners {
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                let result = match handle.await {
                    Ok(result) => result,
                    Err(e) => Err(eyre!("{name} listener task failed: {e}")),
                };
                if !shutdown.is_shutdown_initiated() {
                    let reason = match &result {
                        Ok(()) => format!("{name} listener stopped"),
                        Err(e) => format!("{name} listener failed: {e:#}"),
                    };
                    shutdown.trigger_shutdown(ShutdownReason::Fatal(reason));
                }
                result
            }));
        }

        tracing::info!(
            http = %self.config.http_addr,
            https = %self.config.https_addr,
            "Controller running"
        );

        let reason = shutdown.wait_for_shutdown_signal().await;
        shutdown.drain(tasks).await;

        match reason {
            ShutdownReason::Fatal(reason) => Err(eyre!(reason)),
            reason => {
                tracing::info!(reason = %reason, "Controller stopped");
                Ok(())
            }
        }
    }
}
