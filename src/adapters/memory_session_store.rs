use async_trait::async_trait;
use scc::HashMap;

use crate::ports::session_store::{SessionData, SessionStore, SessionStoreResult};

/// Process-local session store.
///
/// Sessions live as long as the process and are not shared between replicas.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: HashMap<String, SessionData>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn initialize(&self) -> SessionStoreResult<()> {
        tracing::info!("Using in-memory session store; sessions are lost on restart");
        Ok(())
    }

    async fn get(&self, id: &str) -> SessionStoreResult<Option<SessionData>> {
        Ok(self
            .sessions
            .get_async(id)
            .await
            .map(|entry| entry.get().clone()))
    }

    async fn set(&self, id: &str, data: &SessionData) -> SessionStoreResult<()> {
        self.sessions.upsert_async(id.to_string(), data.clone()).await;
        Ok(())
    }

    async fn delete(&self, id: &str) -> SessionStoreResult<()> {
        self.sessions.remove_async(id).await;
        Ok(())
    }
}
