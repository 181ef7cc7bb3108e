//! shelver-core — shared building blocks for the Shelver controller.
//!
//! Holds the `shelver.toml` configuration model, the human duration
//! syntax used throughout it (`"500ms"`, `"10s"`, `"30m"`, `"1h"`), and
//! the [`Clock`] abstraction every timed component reads "now" from.

pub mod clock;
pub mod config;
pub mod duration;

pub use clock::{Clock, SharedClock, SystemClock, TokioClock};
pub use config::{
    ApiConfig, AuditConfig, ComputeConfig, ConfigError, IdleConfig, InstanceConfig, MirrorConfig,
    MirrorKind, ReadinessConfig, ReconcileConfig, ShelverConfig, StateConfig,
};
pub use duration::parse_duration;
