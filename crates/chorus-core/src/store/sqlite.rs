//! SQLite session store

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::types::{Session, SessionMeta, TranscriptTurn};

use super::profile::{ProfileEntry, ProfileMap};
use super::{SessionStore, check_version};

/// SQLite-backed store (thread-safe via Arc<Mutex>)
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database and its schema
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())?;
        info!("Opening session database at {:?}", path.as_ref());
        Self::init(conn)
    }

    /// Throwaway in-memory database
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute("PRAGMA foreign_keys = ON", [])?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                persona TEXT NOT NULL,
                transcript TEXT NOT NULL,
                meta TEXT NOT NULL,
                version INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS profile_entries (
                session_id TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                expires_at TEXT,
                owner TEXT,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (session_id, key),
                FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_profile_expires ON profile_entries(expires_at)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_sessions_updated ON sessions(updated_at)",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

fn lock(conn: &Mutex<Connection>) -> MutexGuard<'_, Connection> {
    conn.lock().unwrap_or_else(|poisoned| {
        warn!("Database mutex was poisoned, recovering");
        poisoned.into_inner()
    })
}

/// Fixed-width UTC timestamps so text comparison in SQL orders correctly
fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Backend(format!("bad timestamp '{raw}': {e}")))
}

fn joined<T>(result: Result<Result<T, StoreError>, tokio::task::JoinError>) -> Result<T, StoreError> {
    result.map_err(|e| StoreError::Backend(format!("spawn_blocking task panicked: {e}")))?
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn load(&self, id: &str) -> Result<Option<Session>, StoreError> {
        let conn = Arc::clone(&self.conn);
        let id = id.to_owned();

        joined(
            tokio::task::spawn_blocking(move || -> Result<Option<Session>, StoreError> {
                let conn = lock(&conn);
                let now = ts(Utc::now());

                let pruned = conn.execute(
                    "DELETE FROM profile_entries WHERE session_id = ?1
                     AND expires_at IS NOT NULL AND expires_at <= ?2",
                    params![&id, &now],
                )?;
                if pruned > 0 {
                    debug!("Pruned {} expired profile entries from session {}", pruned, id);
                }

                let row = conn
                    .query_row(
                        "SELECT persona, transcript, meta, version, created_at, updated_at
                         FROM sessions WHERE id = ?1",
                        params![&id],
                        |row| {
                            Ok((
                                row.get::<_, String>(0)?,
                                row.get::<_, String>(1)?,
                                row.get::<_, String>(2)?,
                                row.get::<_, i64>(3)?,
                                row.get::<_, String>(4)?,
                                row.get::<_, String>(5)?,
                            ))
                        },
                    )
                    .optional()?;

                let Some((persona, transcript, meta, version, created_at, updated_at)) = row else {
                    return Ok(None);
                };

                let transcript: Vec<TranscriptTurn> = serde_json::from_str(&transcript)?;
                let meta: SessionMeta = serde_json::from_str(&meta)?;

                let mut stmt = conn.prepare(
                    "SELECT key, value, expires_at, owner, updated_at
                     FROM profile_entries WHERE session_id = ?1",
                )?;
                let rows = stmt.query_map(params![&id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                })?;

                let mut profile = ProfileMap::default();
                for row in rows {
                    let (key, value, expires_at, owner, entry_updated) = row?;
                    profile.insert_raw(
                        key,
                        ProfileEntry {
                            value: serde_json::from_str(&value)?,
                            expires_at: expires_at.as_deref().map(parse_ts).transpose()?,
                            owner,
                            updated_at: parse_ts(&entry_updated)?,
                        },
                    );
                }

                Ok(Some(Session {
                    id,
                    persona,
                    transcript,
                    profile,
                    meta,
                    version: version as u64,
                    created_at: parse_ts(&created_at)?,
                    updated_at: parse_ts(&updated_at)?,
                }))
            })
            .await,
        )
    }

    async fn save(&self, session: &Session) -> Result<u64, StoreError> {
        let conn = Arc::clone(&self.conn);
        let session = session.clone();

        joined(
            tokio::task::spawn_blocking(move || -> Result<u64, StoreError> {
                let transcript = serde_json::to_string(&session.transcript)?;
                let meta = serde_json::to_string(&session.meta)?;
                let now = Utc::now();

                let mut conn = lock(&conn);
                let tx = conn.transaction()?;

                let stored: Option<i64> = tx
                    .query_row(
                        "SELECT version FROM sessions WHERE id = ?1",
                        params![&session.id],
                        |row| row.get(0),
                    )
                    .optional()?;
                check_version(&session.id, session.version, stored.map(|v| v as u64))?;

                let version = session.version + 1;
                tx.execute(
                    "INSERT INTO sessions (id, persona, transcript, meta, version, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT(id) DO UPDATE SET
                        persona = excluded.persona,
                        transcript = excluded.transcript,
                        meta = excluded.meta,
                        version = excluded.version,
                        created_at = excluded.created_at,
                        updated_at = excluded.updated_at",
                    params![
                        &session.id,
                        &session.persona,
                        transcript,
                        meta,
                        version as i64,
                        ts(session.created_at),
                        ts(session.updated_at),
                    ],
                )?;

                tx.execute(
                    "DELETE FROM profile_entries WHERE session_id = ?1",
                    params![&session.id],
                )?;
                {
                    let mut insert = tx.prepare(
                        "INSERT INTO profile_entries (session_id, key, value, expires_at, owner, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    )?;
                    for (key, entry) in session.profile.entries() {
                        if entry.is_expired(now) {
                            continue;
                        }
                        insert.execute(params![
                            &session.id,
                            key,
                            serde_json::to_string(&entry.value)?,
                            entry.expires_at.map(ts),
                            entry.owner.as_deref(),
                            ts(entry.updated_at),
                        ])?;
                    }
                }

                tx.commit()?;
                debug!("Saved session {} at version {}", session.id, version);
                Ok(version)
            })
            .await,
        )
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let conn = Arc::clone(&self.conn);
        let id = id.to_owned();

        joined(
            tokio::task::spawn_blocking(move || -> Result<bool, StoreError> {
                let conn = lock(&conn);
                let removed = conn.execute("DELETE FROM sessions WHERE id = ?1", params![&id])?;
                if removed > 0 {
                    info!("Deleted session {}", id);
                }
                Ok(removed > 0)
            })
            .await,
        )
    }

    async fn purge_expired(
        &self,
        now: DateTime<Utc>,
        idle_before: Option<DateTime<Utc>>,
    ) -> Result<usize, StoreError> {
        let conn = Arc::clone(&self.conn);

        joined(
            tokio::task::spawn_blocking(move || -> Result<usize, StoreError> {
                let conn = lock(&conn);
                let mut removed = 0;
                if let Some(cutoff) = idle_before {
                    removed += conn.execute(
                        "DELETE FROM sessions WHERE updated_at <= ?1",
                        params![ts(cutoff)],
                    )?;
                }
                removed += conn.execute(
                    "DELETE FROM profile_entries WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                    params![ts(now)],
                )?;
                debug!("Purged {} expired sessions/profile entries", removed);
                Ok(removed)
            })
            .await,
        )
    }
}
