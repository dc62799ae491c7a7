//! Cookie-keyed client sessions.
//!
//! A session is loaded before any plugin runs and persisted at most once, when
//! the request is first responded to. The store is only written when the data
//! changed since it was loaded; the cookie is re-issued on every response.

use std::sync::Arc;

use hyper::header::{COOKIE, HeaderMap, HeaderValue};
use uuid::Uuid;

use crate::ports::session_store::{SessionData, SessionStore, SessionStoreResult};

/// Prefix the browser enforces `Secure`, `Path=/` and no `Domain` for.
pub const SECURE_COOKIE_PREFIX: &str = "__Host-";
pub const DEFAULT_COOKIE_NAME: &str = "kingress_sessionid";

/// Naming policy for the session cookie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCookie {
    base_name: String,
}

impl SessionCookie {
    pub fn new(base_name: impl Into<String>) -> Self {
        Self {
            base_name: base_name.into(),
        }
    }

    pub fn name(&self, is_secure: bool) -> String {
        if is_secure {
            format!("{SECURE_COOKIE_PREFIX}{}", self.base_name)
        } else {
            self.base_name.clone()
        }
    }

    /// Find this cookie's value among all `Cookie` headers.
    pub fn find_in(&self, headers: &HeaderMap, is_secure: bool) -> Option<String> {
        let name = self.name(is_secure);
        headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value.trim().trim_matches('"').to_string())
            .filter(|value| is_valid_session_id(value))
    }
}

impl Default for SessionCookie {
    fn default() -> Self {
        Self::new(DEFAULT_COOKIE_NAME)
    }
}

fn is_valid_session_id(id: &str) -> bool {
    !id.is_empty() && id.len() <= 128 && id.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
}

pub struct Session {
    store: Arc<dyn SessionStore>,
    cookie: SessionCookie,
    id: String,
    data: SessionData,
    /// Serialized data as loaded, used to detect changes
    loaded: String,
}

impl Session {
    /// Load the session named by the request cookie, or start a fresh one when
    /// the cookie is missing or the store does not know the id.
    pub async fn load(
        store: Arc<dyn SessionStore>,
        cookie: SessionCookie,
        headers: &HeaderMap,
        is_secure: bool,
    ) -> SessionStoreResult<Self> {
        let existing = match cookie.find_in(headers, is_secure) {
            Some(id) => store.get(&id).await?.map(|data| (id, data)),
            None => None,
        };

        let (id, data) = match existing {
            Some(found) => found,
            None => (Uuid::new_v4().to_string(), SessionData::new()),
        };
        let loaded = serde_json::to_string(&data)?;

        Ok(Self {
            store,
            cookie,
            id,
            data,
            loaded,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn data(&self) -> &SessionData {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut SessionData {
        &mut self.data
    }

    /// Whether the data differs from what was loaded.
    pub fn is_dirty(&self) -> bool {
        serde_json::to_string(&self.data).map_or(true, |current| current != self.loaded)
    }

    /// Write the data back if it changed. Returns whether a write happened.
    pub async fn persist(&mut self) -> SessionStoreResult<bool> {
        let current = serde_json::to_string(&self.data)?;
        if current == self.loaded {
            return Ok(false);
        }
        self.store.set(&self.id, &self.data).await?;
        self.loaded = current;
        Ok(true)
    }

    /// The `Set-Cookie` value naming this session.
    pub fn set_cookie_header(&self, is_secure: bool) -> HeaderValue {
        let mut cookie = format!(
            "{}={}; Path=/; HttpOnly; SameSite=Lax",
            self.cookie.name(is_secure),
            self.id
        );
        if is_secure {
            cookie.push_str("; Secure");
        }
        HeaderValue::from_str(&cookie).unwrap_or_else(|_| HeaderValue::from_static(""))
    }

    /// Persist (logging rather than failing on store errors) and return the
    /// cookie to send.
    pub async fn save(&mut self, is_secure: bool) -> HeaderValue {
        match self.persist().await {
            Ok(true) => tracing::trace!(session = %self.id, "Session data saved"),
            Ok(false) => {}
            Err(e) => tracing::warn!(session = %self.id, "Failed to save session data: {}", e),
        }
        self.set_cookie_header(is_secure)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("cookie", &self.cookie)
            .field("dirty", &self.is_dirty())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::adapters::memory_session_store::MemorySessionStore;

    fn headers_with_cookie(cookie: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_str(cookie).unwrap());
        headers
    }

    #[test]
    fn test_cookie_name_depends_on_security() {
        let cookie = SessionCookie::new("sid");
        assert_eq!(cookie.name(false), "sid");
        assert_eq!(cookie.name(true), "__Host-sid");
    }

    #[test]
    fn test_find_cookie_among_others() {
        let cookie = SessionCookie::new("sid");
        let headers = headers_with_cookie("theme=dark; sid=abc-123; other=1");
        assert_eq!(cookie.find_in(&headers, false).as_deref(), Some("abc-123"));
        assert_eq!(cookie.find_in(&headers, true), None);
    }

    #[test]
    fn test_rejects_malformed_ids() {
        let cookie = SessionCookie::new("sid");
        let headers = headers_with_cookie("sid=../../etc");
        assert_eq!(cookie.find_in(&headers, false), None);
    }

    #[tokio::test]
    async fn test_missing_cookie_mints_fresh_id() {
        let store = Arc::new(MemorySessionStore::new());
        let session = Session::load(store, SessionCookie::default(), &HeaderMap::new(), false)
            .await
            .unwrap();
        assert!(Uuid::parse_str(session.id()).is_ok());
        assert!(session.data().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_id_mints_fresh_id() {
        let store = Arc::new(MemorySessionStore::new());
        let headers = headers_with_cookie("kingress_sessionid=unknown-id");
        let session = Session::load(store, SessionCookie::default(), &headers, false)
            .await
            .unwrap();
        assert_ne!(session.id(), "unknown-id");
    }

    #[tokio::test]
    async fn test_known_id_loads_data() {
        let store = Arc::new(MemorySessionStore::new());
        let mut data = SessionData::new();
        data.insert("user".to_string(), json!("alice"));
        store.set("known-id", &data).await.unwrap();

        let headers = headers_with_cookie("__Host-kingress_sessionid=known-id");
        let session = Session::load(store, SessionCookie::default(), &headers, true)
            .await
            .unwrap();
        assert_eq!(session.id(), "known-id");
        assert_eq!(session.data()["user"], json!("alice"));
        assert!(!session.is_dirty());
    }

    #[tokio::test]
    async fn test_unchanged_data_is_not_written() {
        let store = Arc::new(MemorySessionStore::new());
        let mut session = Session::load(store.clone(), SessionCookie::default(), &HeaderMap::new(), false)
            .await
            .unwrap();
        assert!(!session.persist().await.unwrap());
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn test_changed_data_is_written_once() {
        let store = Arc::new(MemorySessionStore::new());
        let mut session = Session::load(store.clone(), SessionCookie::default(), &HeaderMap::new(), false)
            .await
            .unwrap();
        session.data_mut().insert("n".to_string(), json!(1));
        assert!(session.is_dirty());
        assert!(session.persist().await.unwrap());
        assert!(!session.persist().await.unwrap());
        assert_eq!(store.get(session.id()).await.unwrap().unwrap()["n"], json!(1));
    }

    #[tokio::test]
    async fn test_set_cookie_attributes() {
        let store = Arc::new(MemorySessionStore::new());
        let mut session = Session::load(store, SessionCookie::new("sid"), &HeaderMap::new(), true)
            .await
            .unwrap();
        let header = session.save(true).await;
        let value = header.to_str().unwrap();
        assert!(value.starts_with(&format!("__Host-sid={}", session.id())));
        assert!(value.contains("Path=/"));
        assert!(value.contains("HttpOnly"));
        assert!(value.contains("SameSite=Lax"));
        assert!(value.ends_with("; Secure"));

        let plain = session.set_cookie_header(false);
        assert!(!plain.to_str().unwrap().contains("Secure"));
    }
}
