//! SQLite-backed event store.
//!
//! Rows are keyed by the dedup key, so re-inserting an already stored event is a no-op.

use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use crate::event_log::{DedupKey, LogFilter};
use crate::models::Event;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("payload encoding: {0}")]
    Payload(#[from] serde_json::Error),
}

pub struct Store {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS events (
    dedup_key    TEXT PRIMARY KEY,
    timestamp_ms INTEGER NOT NULL,
    user_agent   TEXT,
    payload      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS events_timestamp ON events (timestamp_ms);
CREATE INDEX IF NOT EXISTS events_user_agent ON events (user_agent);
";

impl Store {
    /// Open (or create) the database at `path`. `:memory:` opens a private in-memory store.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = if path.as_os_str() == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };
        conn.execute_batch(SCHEMA)?;
        tracing::debug!(path = %path.display(), "event store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert events, skipping keys already stored. Returns the number of new rows.
    pub fn insert(&self, events: &[Event]) -> Result<usize, StoreError> {
        let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO events (dedup_key, timestamp_ms, user_agent, payload)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for event in events {
                let payload = serde_json::to_string(event)?;
                inserted += stmt.execute(params![
                    DedupKey::of(event).to_string(),
                    event.timestamp_ms(),
                    event.user_agent,
                    payload,
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Events matching `filter`, newest first, at most `limit` rows.
    pub fn fetch(&self, filter: &LogFilter, limit: usize) -> Result<Vec<Event>, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stmt = conn.prepare_cached(
            "SELECT payload FROM events
             WHERE (?1 IS NULL OR user_agent = ?1)
               AND (?2 IS NULL OR timestamp_ms >= ?2)
               AND (?3 IS NULL OR timestamp_ms <= ?3)
             ORDER BY timestamp_ms DESC
             LIMIT ?4",
        )?;
        let rows = stmt.query_map(
            params![
                filter.user_agent,
                filter.start_time.map(|t| t.timestamp_millis()),
                filter.end_time.map(|t| t.timestamp_millis()),
                i64::try_from(limit).unwrap_or(i64::MAX),
            ],
            |row| row.get::<_, String>(0),
        )?;

        let mut events = Vec::new();
        for payload in rows {
            events.push(serde_json::from_str(&payload?)?);
        }
        Ok(events)
    }

    /// Every stored event, in no particular order.
    pub fn load_all(&self) -> Result<Vec<Event>, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stmt = conn.prepare("SELECT payload FROM events")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut events = Vec::new();
        for payload in rows {
            events.push(serde_json::from_str(&payload?)?);
        }
        Ok(events)
    }

    pub fn user_agents(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stmt = conn.prepare(
            "SELECT DISTINCT user_agent FROM events WHERE user_agent IS NOT NULL ORDER BY user_agent",
        )?;
        let agents = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(agents)
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}
