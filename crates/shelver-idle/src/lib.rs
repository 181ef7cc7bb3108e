//! shelver-idle — turns the reverse proxy's access log into an idle signal.
//!
//! ```text
//! access.log ──LogTailer::poll()──► complete lines
//!                                     │ parse_line()
//!                                     ▼
//!                          ActivityObservation (label, status filter)
//!                                     │
//!                     IdleWatcher ────┼──► IdleSink::activity()
//!                                     └──► IdleSink::idle_warning() / idle_timeout()
//! ```
//!
//! The watcher never mutates lifecycle state. It reads a snapshot through
//! the [`IdleSink`] and submits events back through it, which lets tests
//! drive it with a fake sink and a paused clock.
//!
//! Rotation or truncation of the log, and a missing log file, open a
//! grace window during which no idle timeout fires: an observability gap
//! is not a traffic gap.

pub mod error;
pub mod parse;
pub mod tail;
pub mod watcher;

pub use error::{WatchError, WatchResult};
pub use parse::{ParseError, parse_line};
pub use tail::{LogTailer, TailBatch};
pub use watcher::{IdleSink, IdleWatcher, IdleWatcherConfig, WatchedInstance};
