//! Durable session storage

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::types::Session;

pub mod memory;
pub mod profile;
pub mod scratch;
pub mod sqlite;

pub use memory::MemoryStore;
pub use profile::{Expiry, ProfileEntry, ProfileMap, ProfileSnapshot, ProfileWrite};
pub use scratch::{DelegationRecord, ScratchBuffer};
pub use sqlite::SqliteStore;

/// Backing store for sessions.
///
/// `save` is atomic per session and uses `Session::version` as an optimistic
/// concurrency token: the write only succeeds if the stored version still
/// equals the version the caller loaded (0 for a session never stored). On
/// success the new version is returned.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, id: &str) -> Result<Option<Session>, StoreError>;

    async fn save(&self, session: &Session) -> Result<u64, StoreError>;

    /// Remove a session, returning whether it existed
    async fn delete(&self, id: &str) -> Result<bool, StoreError>;

    /// Remove expired profile entries everywhere and sessions idle since before `idle_before`
    async fn purge_expired(
        &self,
        now: DateTime<Utc>,
        idle_before: Option<DateTime<Utc>>,
    ) -> Result<usize, StoreError>;
}

pub(crate) fn check_version(id: &str, expected: u64, found: Option<u64>) -> Result<(), StoreError> {
    let found = found.unwrap_or(0);
    if found != expected {
        return Err(StoreError::Conflict {
            session_id: id.to_string(),
            expected,
            found,
        });
    }
    Ok(())
}
