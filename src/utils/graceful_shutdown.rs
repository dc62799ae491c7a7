use std::{fmt, time::Duration};

use futures_util::future::join_all;
use tokio::{signal, sync::watch, task::JoinHandle, time::timeout};

/// Why the controller is stopping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGINT (Ctrl+C)
    Interrupt,
    /// SIGTERM, e.g. from the kubelet
    Terminate,
    /// Requested from inside the process
    Requested,
    /// A component the controller cannot run without stopped
    Fatal(String),
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interrupt => f.write_str("interrupt"),
            Self::Terminate => f.write_str("terminate"),
            Self::Requested => f.write_str("requested"),
            Self::Fatal(reason) => write!(f, "fatal: {reason}"),
        }
    }
}

/// Coordinates shutdown across listeners and the reconciliation loop.
///
/// The first reason recorded wins. Tokens created at any time observe it,
/// including ones that start waiting after shutdown began.
pub struct GracefulShutdown {
    state: watch::Sender<Option<ShutdownReason>>,
    /// How long running tasks get to finish once shutdown began
    drain_timeout: Duration,
}

impl GracefulShutdown {
    pub fn new() -> Self {
        Self::with_drain_timeout(Duration::from_secs(30))
    }

    pub fn with_drain_timeout(drain_timeout: Duration) -> Self {
        let (state, _) = watch::channel(None);
        Self {
            state,
            drain_timeout,
        }
    }

    pub fn is_shutdown_initiated(&self) -> bool {
        self.state.borrow().is_some()
    }

    /// Record `reason` unless shutdown already began. Returns whether this
    /// call started the shutdown.
    pub fn trigger_shutdown(&self, reason: ShutdownReason) -> bool {
        let started = self.state.send_if_modified(|state| {
            if state.is_some() {
                return false;
            }
            *state = Some(reason.clone());
            true
        });
        if started {
            tracing::info!(reason = %reason, "Shutdown initiated");
        } else {
            tracing::debug!(reason = %reason, "Shutdown already in progress");
        }
        started
    }

    /// Wait for SIGINT or SIGTERM and start shutdown.
    pub async fn run_signal_handler(&self) {
        tracing::info!("Listening for SIGINT and SIGTERM");

        let reason = tokio::select! {
            result = signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!("Failed to listen for SIGINT: {}", e);
                    std::future::pending::<()>().await;
                }
                ShutdownReason::Interrupt
            }
            _ = wait_for_sigterm() => ShutdownReason::Terminate,
        };
        self.trigger_shutdown(reason);
    }

    /// Wait until shutdown began, from a signal or any other trigger.
    pub async fn wait_for_shutdown_signal(&self) -> ShutdownReason {
        self.shutdown_token().wait_for_shutdown().await
    }

    pub fn shutdown_token(&self) -> ShutdownToken {
        ShutdownToken {
            receiver: self.state.subscribe(),
        }
    }

    /// Wait for `tasks` to finish, giving up after the drain timeout.
    /// Returns whether every task finished in time.
    pub async fn drain(&self, tasks: Vec<JoinHandle<eyre::Result<()>>>) -> bool {
        let count = tasks.len();
        match timeout(self.drain_timeout, join_all(tasks)).await {
            Ok(results) => {
                for result in results {
                    match result {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => tracing::warn!("Task ended with error: {:#}", e),
                        Err(e) => tracing::warn!("Task panicked or was cancelled: {}", e),
                    }
                }
                tracing::info!(tasks = count, "All tasks stopped");
                true
            }
            Err(_) => {
                tracing::warn!(
                    tasks = count,
                    "Tasks still running after {:?}, exiting anyway",
                    self.drain_timeout
                );
                false
            }
        }
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::error!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}

/// Handed to long-running tasks so they can stop when shutdown begins.
#[derive(Clone)]
pub struct ShutdownToken {
    receiver: watch::Receiver<Option<ShutdownReason>>,
}

impl ShutdownToken {
    pub fn is_shutdown_initiated(&self) -> bool {
        self.receiver.borrow().is_some()
    }

    pub async fn wait_for_shutdown(&mut self) -> ShutdownReason {
        match self.receiver.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or(ShutdownReason::Requested),
            Err(_) => ShutdownReason::Fatal("shutdown coordinator dropped".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_reason_wins() {
        let shutdown = GracefulShutdown::new();
        assert!(!shutdown.is_shutdown_initiated());

        assert!(shutdown.trigger_shutdown(ShutdownReason::Terminate));
        assert!(!shutdown.trigger_shutdown(ShutdownReason::Requested));
        assert!(shutdown.is_shutdown_initiated());
        assert_eq!(
            shutdown.wait_for_shutdown_signal().await,
            ShutdownReason::Terminate
        );
    }

    #[tokio::test]
    async fn test_token_created_after_trigger_observes_shutdown() {
        let shutdown = GracefulShutdown::new();
        shutdown.trigger_shutdown(ShutdownReason::Requested);

        let mut token = shutdown.shutdown_token();
        assert!(token.is_shutdown_initiated());
        assert_eq!(token.wait_for_shutdown().await, ShutdownReason::Requested);
    }

    #[tokio::test]
    async fn test_cloned_tokens_are_woken() {
        let shutdown = GracefulShutdown::new();
        let mut first = shutdown.shutdown_token();
        let mut second = first.clone();

        let waiter = tokio::spawn(async move { first.wait_for_shutdown().await });
        tokio::task::yield_now().await;
        shutdown.trigger_shutdown(ShutdownReason::Fatal("listener".to_string()));

        assert_eq!(
            waiter.await.unwrap(),
            ShutdownReason::Fatal("listener".to_string())
        );
        assert_eq!(
            second.wait_for_shutdown().await,
            ShutdownReason::Fatal("listener".to_string())
        );
    }

    #[tokio::test]
    async fn test_dropped_coordinator_releases_tokens() {
        let shutdown = GracefulShutdown::new();
        let mut token = shutdown.shutdown_token();
        drop(shutdown);
        assert!(matches!(
            token.wait_for_shutdown().await,
            ShutdownReason::Fatal(_)
        ));
    }

    #[tokio::test]
    async fn test_drain() {
        let shutdown = GracefulShutdown::with_drain_timeout(Duration::from_millis(50));
        let quick = tokio::spawn(async { Ok(()) });
        assert!(shutdown.drain(vec![quick]).await);

        let stuck = tokio::spawn(async {
            std::future::pending::<()>().await;
            Ok(())
        });
        assert!(!shutdown.drain(vec![stuck]).await);
    }
}
