//! StateStore: redb-backed persistence of autoscaler status.
//!
//! Values are JSON-serialized into redb's `&[u8]` value columns. The store
//! supports both on-disk and in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(STATUSES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Overwrite the status of an autoscaler.
    pub fn put_status(&self, status: &Status) -> StateResult<()> {
        let value = serde_json::to_vec(status).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(STATUSES).map_err(map_err!(Table))?;
            table
                .insert(status.autoscaler.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(autoscaler = %status.autoscaler, "status stored");
        Ok(())
    }

    /// Get the status of an autoscaler by name.
    pub fn get_status(&self, autoscaler: &str) -> StateResult<Option<Status>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(STATUSES).map_err(map_err!(Table))?;
        match table.get(autoscaler).map_err(map_err!(Read))? {
            Some(guard) => {
                let status: Status =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(status))
            }
            None => Ok(None),
        }
    }

    /// List all statuses, ordered by autoscaler name.
    pub fn list_statuses(&self) -> StateResult<Vec<Status>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(STATUSES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let status: Status =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(status);
        }
        Ok(results)
    }

    /// Delete the status of an autoscaler. Returns true if it existed.
    pub fn delete_status(&self, autoscaler: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(STATUSES).map_err(map_err!(Table))?;
            existed = table.remove(autoscaler).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%autoscaler, existed, "status deleted");
        Ok(existed)
    }
}
