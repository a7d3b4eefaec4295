//! SQLite-backed machine store.
//!
//! Each machine is kept as a JSON document alongside a few queryable
//! columns. The event log is append-only.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kiln_id::MachineId;
use rusqlite::{params, Connection};
use thiserror::Error;
use tracing::debug;

use crate::event::MachineEvent;
use crate::machine::{Machine, MachineField};
use crate::providers::{PersistenceClient, PersistenceError};

/// Errors from state store operations.
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid record: {0}")]
    Invalid(String),

    #[error("store task failed: {0}")]
    Task(String),
}

impl From<StateStoreError> for PersistenceError {
    fn from(e: StateStoreError) -> Self {
        match e {
            StateStoreError::Serialization(e) => PersistenceError::Serialization(e),
            other => PersistenceError::Storage(other.to_string()),
        }
    }
}

/// One entry of the machine event log.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    /// Position in the log, increasing across all machines.
    pub seq: i64,
    pub machine_id: MachineId,
    pub event: MachineEvent,
    pub recorded_at: DateTime<Utc>,
}

/// SQLite state store.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StateStoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::with_connection(conn)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StateStoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StateStoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS machines (
                machine_id TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                desired_state TEXT NOT NULL,
                document TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_machines_state ON machines(state);

            CREATE TABLE IF NOT EXISTS machine_events (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                machine_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                recorded_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_machine_events_machine ON machine_events(machine_id);
            "#,
        )?;

        debug!("State store schema initialized");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or update a machine.
    pub fn upsert_machine(&self, machine: &Machine) -> Result<(), StateStoreError> {
        let document = serde_json::to_string(machine)?;
        self.conn().execute(
            r#"
            INSERT INTO machines (machine_id, state, desired_state, document, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(machine_id) DO UPDATE SET
                state = excluded.state,
                desired_state = excluded.desired_state,
                document = excluded.document,
                updated_at = excluded.updated_at
            "#,
            params![
                machine.id.to_string(),
                machine.state.as_str(),
                machine.desired_state.as_str(),
                document,
                machine.created_at.to_rfc3339(),
                machine.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// All machines, oldest first.
    pub fn list_machines(&self) -> Result<Vec<Machine>, StateStoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT document FROM machines ORDER BY created_at")?;
        let documents = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        documents
            .iter()
            .map(|doc| serde_json::from_str(doc).map_err(Into::into))
            .collect()
    }

    pub fn append(&self, machine_id: MachineId, event: &MachineEvent) -> Result<i64, StateStoreError> {
        let payload = serde_json::to_string(event)?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO machine_events (machine_id, event_type, payload, recorded_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                machine_id.to_string(),
                event.kind(),
                payload,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// The event log of one machine, in append order.
    pub fn events_for(&self, machine_id: MachineId) -> Result<Vec<EventRecord>, StateStoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT seq, payload, recorded_at FROM machine_events WHERE machine_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt
            .query_map(params![machine_id.to_string()], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(seq, payload, recorded_at)| {
                let recorded_at = DateTime::parse_from_rfc3339(&recorded_at)
                    .map_err(|e| StateStoreError::Invalid(format!("recorded_at: {e}")))?
                    .with_timezone(&Utc);
                Ok(EventRecord {
                    seq,
                    machine_id,
                    event: serde_json::from_str(&payload)?,
                    recorded_at,
                })
            })
            .collect()
    }

    /// Run a store operation on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T, StateStoreError>
    where
        T: Send + 'static,
        F: FnOnce(&SqliteStore) -> Result<T, StateStoreError> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| StateStoreError::Task(e.to_string()))?
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl PersistenceClient for SqliteStore {
    async fn save(
        &self,
        machine: &Machine,
        changed: &[MachineField],
    ) -> Result<(), PersistenceError> {
        debug!(machine_id = %machine.id, ?changed, "Saving machine");
        let machine = machine.clone();
        self.blocking(move |store| store.upsert_machine(&machine))
            .await
            .map_err(Into::into)
    }

    async fn load_machines(&self) -> Result<Vec<Machine>, PersistenceError> {
        self.blocking(|store| store.list_machines())
            .await
            .map_err(Into::into)
    }

    async fn append_event(
        &self,
        machine_id: MachineId,
        event: &MachineEvent,
    ) -> Result<(), PersistenceError> {
        let event = event.clone();
        self.blocking(move |store| store.append(machine_id, &event).map(|_| ()))
            .await
            .map_err(Into::into)
    }
}
