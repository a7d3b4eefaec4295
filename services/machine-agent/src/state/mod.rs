//! Local state persistence.
//!
//! SQLite storage for machine records and their event log, so the agent
//! can pick machines back up after a restart.

mod store;

pub use store::{EventRecord, SqliteStore, StateStoreError};
