//! shelver-lifecycle — the authoritative model of the managed instance.
//!
//! A single task, the [`LifecycleMachine`], owns the [`InstanceRecord`]
//! and applies every event one at a time from one ordered intake:
//!
//! ```text
//!  LifecycleHandle ─┐  (unshelve / shelve requests, status reads)
//!  IdleWatcher ─────┤  (activity, idle warning, idle timeout)
//!  Reconciler ──────┼──► mpsc intake ──► LifecycleMachine ──► watch snapshot
//!  gateway tasks ───┤                          │
//!  readiness probe ─┘                          └──► AuditLog (write-ahead)
//! ```
//!
//! Slow work (compute calls, readiness polling) runs in spawned tasks.
//! Their completions re-enter through the intake tagged with the episode
//! they were issued under; completions from an episode the machine has
//! since left are discarded.
//!
//! [`InstanceRecord`]: shelver_state::InstanceRecord

pub mod error;
pub mod handle;
pub mod machine;
pub mod reconciler;

pub use error::LifecycleError;
pub use handle::{LifecycleHandle, StatusView};
pub use machine::{LifecycleMachine, LifecycleSettings};
pub use reconciler::{Reconciler, drift};
