use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

/// Session payload: an arbitrary JSON object.
pub type SessionData = Map<String, Value>;

/// Custom error type for session store operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SessionStoreError {
    /// The backing store could not be reached or refused the operation
    #[error("Session store unavailable: {0}")]
    Unavailable(String),

    /// Stored data could not be encoded or decoded
    #[error("Session data encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Result type alias for session store operations
pub type SessionStoreResult<T> = Result<T, SessionStoreError>;

/// SessionStore defines the port (interface) for persisting session data.
///
/// Implementations own their concurrency; concurrent writes to one id are
/// last-write-wins.
#[async_trait]
pub trait SessionStore: Send + Sync + 'static {
    /// One-time setup before the first request is served.
    async fn initialize(&self) -> SessionStoreResult<()> {
        Ok(())
    }

    async fn get(&self, id: &str) -> SessionStoreResult<Option<SessionData>>;

    async fn set(&self, id: &str, data: &SessionData) -> SessionStoreResult<()>;

    async fn delete(&self, id: &str) -> SessionStoreResult<()>;
}
