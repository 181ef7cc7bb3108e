//! shelver-audit — the controller's durable record of what happened.
//!
//! # Architecture
//!
//! ```text
//! state machine / idle watcher
//!   └── AuditLog::append(event)
//!         ├── assign seq, write JSON line, fsync    (events.jsonl)
//!         ├── rotate when max_bytes is exceeded     (events.jsonl.1 ...)
//!         ├── enqueue in the redb outbox            (StateStore)
//!         └── wake the forwarder
//!
//! AuditForwarder (background task)
//!   ├── drain outbox oldest-first
//!   ├── ObjectStore::put_object(container, "{prefix}/{id}.json")
//!   └── on failure: keep the entry, back off 1s → 60s, retry
//! ```
//!
//! The local log is the source of truth. The remote copy is a mirror and
//! forwarding failures never reach the lifecycle state machine. Because
//! the object key is the event id, a retried delivery overwrites the same
//! object instead of creating a duplicate.

pub mod error;
pub mod forwarder;
pub mod log;

pub use error::{AuditError, AuditResult};
pub use forwarder::{AuditForwarder, Backoff, DrainReport};
pub use log::{AuditLog, AuditLogOptions};
