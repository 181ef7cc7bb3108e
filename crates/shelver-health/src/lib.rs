//! shelver-health — readiness probing for an unshelved instance.
//!
//! After the compute plane reports the instance started, the workload
//! still needs time to boot. The [`ReadinessProber`] polls a health
//! endpoint until it answers or a mandatory deadline passes:
//!
//! ```text
//! ReadinessProber::await_ready()
//!   ├── attempt 1 ── Probe::probe() → ProbeResult
//!   ├── sleep(interval)
//!   ├── attempt 2 ...
//!   └── Ready { attempts } | TimedOut { attempts, last_detail }
//! ```
//!
//! Each attempt is independent: connection refusals, per-attempt timeouts,
//! and non-success responses all just mean "not yet". TLS verification
//! can be switched off per target for self-signed workloads.

pub mod checker;
pub mod fake;
pub mod prober;

pub use checker::{HttpProbe, Probe, ProbeError, ProbeResult};
pub use prober::{ProbeOutcome, ReadinessProber};
