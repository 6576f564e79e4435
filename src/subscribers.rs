//! subscriber registry: the set of recipients that receive alert broadcasts.
//!
//! persisted next to the readings so registrations survive restarts.
//! membership is a set keyed by recipient id; adding twice is a no-op and
//! nothing expires on its own.

use crate::error::StoreError;
use crate::store::{lock, open_connection};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::path::Path;
use std::sync::Mutex;

const SUBSCRIBERS_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS subscribers (
    recipient TEXT PRIMARY KEY,
    created_at INTEGER NOT NULL
);
";

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Subscriber {
    /// opaque channel identifier (chat id, webhook key, ...)
    pub recipient: String,
    pub created_at: DateTime<Utc>,
}

pub struct SubscriberRegistry {
    conn: Mutex<Connection>,
}

impl SubscriberRegistry {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = open_connection(path)?;
        conn.execute_batch(SUBSCRIBERS_SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// register a recipient. returns false when it was already present.
    pub fn add(&self, recipient: &str) -> Result<bool, StoreError> {
        let conn = lock(&self.conn);
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO subscribers (recipient, created_at) VALUES (?1, ?2)",
            params![recipient, Utc::now().timestamp_millis()],
        )?;
        if inserted > 0 {
            tracing::info!(recipient, "[SUBSCRIBERS] Registered");
        }
        Ok(inserted > 0)
    }

    /// returns false when the recipient was not registered
    pub fn remove(&self, recipient: &str) -> Result<bool, StoreError> {
        let conn = lock(&self.conn);
        let removed = conn.execute("DELETE FROM subscribers WHERE recipient = ?1", params![recipient])?;
        if removed > 0 {
            tracing::info!(recipient, "[SUBSCRIBERS] Removed");
        }
        Ok(removed > 0)
    }

    /// all recipients, in registration order
    pub fn list(&self) -> Result<Vec<Subscriber>, StoreError> {
        let conn = lock(&self.conn);
        let mut stmt = conn.prepare_cached(
            "SELECT recipient, created_at FROM subscribers ORDER BY created_at ASC, rowid ASC",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;

        let mut subscribers = Vec::new();
        for row in rows {
            let (recipient, ts) = row?;
            let created_at = DateTime::from_timestamp_millis(ts).ok_or(StoreError::BadTimestamp(ts))?;
            subscribers.push(Subscriber { recipient, created_at });
        }
        Ok(subscribers)
    }
}
