//! redb table definitions for the Shelver state store.
//!
//! Values are JSON-serialized domain types.

use redb::TableDefinition;

/// Access-log read cursors keyed by the watched log path.
pub const CURSORS: TableDefinition<&str, &[u8]> = TableDefinition::new("cursors");

/// Audit events awaiting remote mirroring, keyed by event sequence number.
pub const OUTBOX: TableDefinition<u64, &[u8]> = TableDefinition::new("outbox");

/// Bookkeeping counters, e.g. the highest sequence number ever queued.
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");
