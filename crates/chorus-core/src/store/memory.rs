//! In-memory session store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::StoreError;
use crate::types::Session;

use super::{SessionStore, check_version};

/// Process-local store, used for tests and ephemeral runs
#[derive(Clone, Default)]
pub struct MemoryStore {
    sessions: Arc<RwLock<HashMap<String, Session>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn load(&self, id: &str) -> Result<Option<Session>, StoreError> {
        let mut sessions = self.sessions.write().await;
        let now = Utc::now();
        Ok(sessions.get_mut(id).map(|session| {
            let pruned = session.profile.prune(now);
            if pruned > 0 {
                debug!("Pruned {} expired profile entries from session {}", pruned, id);
            }
            session.clone()
        }))
    }

    async fn save(&self, session: &Session) -> Result<u64, StoreError> {
        let mut sessions = self.sessions.write().await;
        check_version(
            &session.id,
            session.version,
            sessions.get(&session.id).map(|s| s.version),
        )?;

        let mut stored = session.clone();
        stored.version += 1;
        let version = stored.version;
        sessions.insert(stored.id.clone(), stored);
        debug!("Saved session {} at version {}", session.id, version);
        Ok(version)
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.sessions.write().await.remove(id).is_some())
    }

    async fn purge_expired(
        &self,
        now: DateTime<Utc>,
        idle_before: Option<DateTime<Utc>>,
    ) -> Result<usize, StoreError> {
        let mut sessions = self.sessions.write().await;
        let mut removed = 0;
        if let Some(cutoff) = idle_before {
            let before = sessions.len();
            sessions.retain(|_, s| s.updated_at > cutoff);
            removed += before - sessions.len();
        }
        for session in sessions.values_mut() {
            removed += session.profile.prune(now);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ProfileWrite;
    use serde_json::json;

    #[tokio::test]
    async fn test_save_and_load() {
        let store = MemoryStore::new();
        let mut session = Session::new("s1", "faq", Utc::now());
        session.version = store.save(&session).await.unwrap();
        assert_eq!(session.version, 1);

        let loaded = store.load("s1").await.unwrap().unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.persona, "faq");
        assert!(store.load("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_save_conflicts() {
        let store = MemoryStore::new();
        let session = Session::new("s1", "faq", Utc::now());
        store.save(&session).await.unwrap();

        let first = store.load("s1").await.unwrap().unwrap();
        let second = first.clone();
        store.save(&first).await.unwrap();

        let err = store.save(&second).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { expected: 1, found: 2, .. }));
    }

    #[tokio::test]
    async fn test_new_session_conflicts_with_existing() {
        let store = MemoryStore::new();
        store.save(&Session::new("s1", "faq", Utc::now())).await.unwrap();
        let err = store.save(&Session::new("s1", "faq", Utc::now())).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_delete() {
        let store = MemoryStore::new();
        store.save(&Session::new("s1", "faq", Utc::now())).await.unwrap();
        assert!(store.delete("s1").await.unwrap());
        assert!(!store.delete("s1").await.unwrap());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let mut old = Session::new("old", "faq", now);
        old.updated_at = now - chrono::Duration::hours(10);
        store.save(&old).await.unwrap();

        let mut fresh = Session::new("fresh", "faq", now);
        fresh.profile.apply(
            ProfileWrite::new("k", json!("v")),
            Some(std::time::Duration::from_secs(1)),
            now,
        );
        store.save(&fresh).await.unwrap();

        let removed = store
            .purge_expired(now + chrono::Duration::seconds(2), Some(now - chrono::Duration::hours(4)))
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.len().await, 1);
    }
}
