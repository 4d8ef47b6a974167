//! Trust score persistence keyed by `(agent_id, source address)`.

use std::net::IpAddr;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use knock_proto::now_unix;
use rusqlite::{params, Connection, OptionalExtension};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("score database: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

pub trait ScoreStore: Send + Sync {
    /// Current score; identities never seen before score 0.
    fn get(&self, agent_id: u64, address: IpAddr) -> Result<u64, StoreError>;

    fn increment(&self, agent_id: u64, address: IpAddr) -> Result<(), StoreError>;
}

/// SQLite-backed store. Scores grow by one per successful knock and never
/// decay; the admission engine caps what they buy.
pub struct SqliteScoreStore {
    conn: Mutex<Connection>,
}

impl SqliteScoreStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::with_connection(Connection::open(path)?)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS trust_scores (
                agent_id   INTEGER NOT NULL,
                address    TEXT NOT NULL,
                score      INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (agent_id, address)
            )",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// SQLite integers are signed; agent ids keep their bit pattern.
fn agent_key(agent_id: u64) -> i64 {
    agent_id as i64
}

impl ScoreStore for SqliteScoreStore {
    fn get(&self, agent_id: u64, address: IpAddr) -> Result<u64, StoreError> {
        let score: Option<i64> = self
            .conn()
            .query_row(
                "SELECT score FROM trust_scores WHERE agent_id = ?1 AND address = ?2",
                params![agent_key(agent_id), address.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(score.map_or(0, |s| s.max(0) as u64))
    }

    fn increment(&self, agent_id: u64, address: IpAddr) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO trust_scores (agent_id, address, score, updated_at)
             VALUES (?1, ?2, 1, ?3)
             ON CONFLICT(agent_id, address)
             DO UPDATE SET score = score + 1, updated_at = excluded.updated_at",
            params![agent_key(agent_id), address.to_string(), now_unix()],
        )?;
        Ok(())
    }
}
