use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use tracing::debug;

use waypoint_core::error::{Result, WaypointError};
use waypoint_core::traits::CheckpointPersistence;
use waypoint_core::types::{CheckpointData, ExecutionStatus};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS checkpoints (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        checkpoint_id TEXT NOT NULL UNIQUE,
        execution_id TEXT NOT NULL,
        step_id TEXT NOT NULL,
        step_name TEXT NOT NULL,
        status TEXT NOT NULL,
        can_resume INTEGER NOT NULL,
        state_json TEXT NOT NULL,
        metadata_json TEXT NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_cp_execution
        ON checkpoints(execution_id, checkpoint_id);

    CREATE INDEX IF NOT EXISTS idx_cp_created
        ON checkpoints(created_at);";

const SELECT_COLUMNS: &str = "SELECT checkpoint_id, execution_id, step_id, step_name, can_resume,
            state_json, metadata_json, created_at
     FROM checkpoints";

/// Persistent checkpoint store backed by SQLite.
///
/// Rows are append-only. Listing order follows insertion order, which for a
/// single writer matches the UUIDv7 order of the checkpoint ids.
pub struct SqliteCheckpointStore {
    conn: Mutex<Connection>,
}

/// Raw column values before JSON decoding.
struct Row {
    checkpoint_id: String,
    execution_id: String,
    step_id: String,
    step_name: String,
    can_resume: bool,
    state_json: String,
    metadata_json: String,
    created_at: String,
}

impl SqliteCheckpointStore {
    /// Open or create the checkpoint database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                WaypointError::Database(format!("Failed to create checkpoint directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(|e| {
            WaypointError::Database(format!("Failed to open checkpoint store: {}", e))
        })?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| WaypointError::Database(e.to_string()))?;

        Self::init(conn, &path.display().to_string())
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| WaypointError::Database(e.to_string()))?;
        Self::init(conn, ":memory:")
    }

    fn init(conn: Connection, location: &str) -> Result<Self> {
        conn.execute_batch(SCHEMA).map_err(|e| {
            WaypointError::Database(format!("Failed to initialize checkpoint schema: {}", e))
        })?;
        debug!(location, "Checkpoint store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn query(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<CheckpointData>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| WaypointError::Database(e.to_string()))?;
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| WaypointError::Database(format!("Failed to prepare query: {}", e)))?;

        let rows = stmt
            .query_map(params, |row| {
                Ok(Row {
                    checkpoint_id: row.get(0)?,
                    execution_id: row.get(1)?,
                    step_id: row.get(2)?,
                    step_name: row.get(3)?,
                    can_resume: row.get::<_, i64>(4)? != 0,
                    state_json: row.get(5)?,
                    metadata_json: row.get(6)?,
                    created_at: row.get(7)?,
                })
            })
            .map_err(|e| WaypointError::Database(e.to_string()))?;

        let mut out = vec![];
        for row in rows {
            let row = row.map_err(|e| WaypointError::Database(e.to_string()))?;
            out.push(decode(row)?);
        }
        Ok(out)
    }
}

fn decode(row: Row) -> Result<CheckpointData> {
    let created_at = DateTime::parse_from_rfc3339(&row.created_at)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            WaypointError::Database(format!(
                "Bad timestamp on checkpoint {}: {}",
                row.checkpoint_id, e
            ))
        })?;
    Ok(CheckpointData {
        checkpoint_id: row.checkpoint_id,
        execution_id: row.execution_id,
        created_at,
        state: serde_json::from_str(&row.state_json)?,
        step_id: row.step_id,
        step_name: row.step_name,
        can_resume: row.can_resume,
        metadata: serde_json::from_str(&row.metadata_json)?,
    })
}

/// Fixed-width UTC timestamp so string comparison matches time order.
fn timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl CheckpointPersistence for SqliteCheckpointStore {
    fn save(&self, cp: &CheckpointData) -> Result<()> {
        let state_json = serde_json::to_string(&cp.state)?;
        let metadata_json = serde_json::to_string(&cp.metadata)?;
        let conn = self
            .conn
            .lock()
            .map_err(|e| WaypointError::Database(e.to_string()))?;
        conn.execute(
            "INSERT INTO checkpoints (checkpoint_id, execution_id, step_id, step_name, status,
                                      can_resume, state_json, metadata_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                cp.checkpoint_id,
                cp.execution_id,
                cp.step_id,
                cp.step_name,
                cp.state.status.as_str(),
                cp.can_resume as i64,
                state_json,
                metadata_json,
                timestamp(&cp.created_at),
            ],
        )
        .map_err(|e| WaypointError::Database(format!("Failed to save checkpoint: {}", e)))?;
        Ok(())
    }

    fn load(&self, checkpoint_id: &str) -> Result<Option<CheckpointData>> {
        let sql = format!("{} WHERE checkpoint_id = ?1", SELECT_COLUMNS);
        Ok(self.query(&sql, params![checkpoint_id])?.into_iter().next())
    }

    fn list(
        &self,
        execution_id: &str,
        status: Option<ExecutionStatus>,
    ) -> Result<Vec<CheckpointData>> {
        match status {
            Some(status) => {
                let sql = format!(
                    "{} WHERE execution_id = ?1 AND status = ?2 ORDER BY seq ASC",
                    SELECT_COLUMNS
                );
                self.query(&sql, params![execution_id, status.as_str()])
            }
            None => {
                let sql = format!("{} WHERE execution_id = ?1 ORDER BY seq ASC", SELECT_COLUMNS);
                self.query(&sql, params![execution_id])
            }
        }
    }

    fn delete(&self, checkpoint_id: &str) -> Result<bool> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| WaypointError::Database(e.to_string()))?;
        let deleted = conn
            .execute(
                "DELETE FROM checkpoints WHERE checkpoint_id = ?1",
                params![checkpoint_id],
            )
            .map_err(|e| WaypointError::Database(format!("Failed to delete checkpoint: {}", e)))?;
        Ok(deleted > 0)
    }

    fn delete_execution(&self, execution_id: &str) -> Result<usize> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| WaypointError::Database(e.to_string()))?;
        conn.execute(
            "DELETE FROM checkpoints WHERE execution_id = ?1",
            params![execution_id],
        )
        .map_err(|e| WaypointError::Database(format!("Failed to delete checkpoints: {}", e)))
    }

    fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| WaypointError::Database(e.to_string()))?;
        conn.execute(
            "DELETE FROM checkpoints WHERE created_at < ?1",
            params![timestamp(&cutoff)],
        )
        .map_err(|e| WaypointError::Database(format!("Failed to clean old checkpoints: {}", e)))
    }
}
