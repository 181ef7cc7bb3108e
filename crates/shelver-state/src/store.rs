//! StateStore — redb-backed persistence for Shelver.
//!
//! Holds the idle watcher's access-log cursor and the audit outbox (events
//! appended locally but not yet mirrored remotely). All values are
//! JSON-serialized into redb's `&[u8]` value columns. The store supports
//! both on-disk and in-memory backends (the latter for testing).

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

const OUTBOX_HIGH_WATER: &str = "outbox_high_water";

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

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(CURSORS).map_err(map_err!(Table))?;
        txn.open_table(OUTBOX).map_err(map_err!(Table))?;
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Cursors ────────────────────────────────────────────────────

    /// Persist the read cursor for a watched log.
    pub fn put_cursor(&self, log_key: &str, cursor: &LogCursor) -> StateResult<()> {
        let value = serde_json::to_vec(cursor).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(CURSORS).map_err(map_err!(Table))?;
            table
                .insert(log_key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get the last persisted cursor for a watched log.
    pub fn get_cursor(&self, log_key: &str) -> StateResult<Option<LogCursor>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CURSORS).map_err(map_err!(Table))?;
        match table.get(log_key).map_err(map_err!(Read))? {
            Some(guard) => {
                let cursor: LogCursor =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(cursor))
            }
            None => Ok(None),
        }
    }

    // ── Outbox ─────────────────────────────────────────────────────

    /// Queue an appended event for remote mirroring.
    ///
    /// Re-enqueueing the same sequence number overwrites the entry. The
    /// queued high-water mark moves in the same transaction.
    pub fn enqueue_outbox(&self, event: &AuditEvent) -> StateResult<()> {
        let value = serde_json::to_vec(event).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(OUTBOX).map_err(map_err!(Table))?;
            table
                .insert(event.seq, value.as_slice())
                .map_err(map_err!(Write))?;

            let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
            let queued = meta
                .get(OUTBOX_HIGH_WATER)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value())
                .unwrap_or(0);
            if event.seq > queued {
                meta.insert(OUTBOX_HIGH_WATER, event.seq)
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(seq = event.seq, id = %event.id, "event queued for mirroring");
        Ok(())
    }

    /// Highest sequence number ever queued, delivered or not. Zero for a
    /// fresh store.
    pub fn outbox_high_water(&self) -> StateResult<u64> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let meta = txn.open_table(META).map_err(map_err!(Table))?;
        Ok(meta
            .get(OUTBOX_HIGH_WATER)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value())
            .unwrap_or(0))
    }

    /// Oldest pending events first, at most `limit`.
    pub fn list_outbox(&self, limit: usize) -> StateResult<Vec<AuditEvent>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(OUTBOX).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))?.take(limit) {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let event: AuditEvent =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(event);
        }
        Ok(results)
    }

    /// Drop a delivered event. Returns true if it was pending.
    pub fn remove_outbox(&self, seq: u64) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(OUTBOX).map_err(map_err!(Table))?;
            existed = table.remove(seq).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// Number of events still awaiting delivery.
    pub fn outbox_len(&self) -> StateResult<usize> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(OUTBOX).map_err(map_err!(Table))?;
        let mut count = 0;
        for entry in table.iter().map_err(map_err!(Read))? {
            entry.map_err(map_err!(Read))?;
            count += 1;
        }
        Ok(count)
    }
}
