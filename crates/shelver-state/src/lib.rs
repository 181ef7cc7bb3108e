//! shelver-state — domain model and embedded state store for Shelver.
//!
//! The domain types describe the single managed instance
//! ([`InstanceRecord`]), the immutable audit trail ([`AuditEvent`]), and the
//! transient traffic observations parsed from the proxy log.
//!
//! The [`StateStore`] is backed by [redb](https://docs.rs/redb) and holds
//! the only on-disk state besides the audit log itself: the idle watcher's
//! read cursor and the audit outbox awaiting remote mirroring.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
