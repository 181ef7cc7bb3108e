//! Readiness polling loop with a mandatory deadline.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::checker::{Probe, ProbeResult};

/// How a readiness episode ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Ready {
        attempts: u32,
        elapsed: Duration,
    },
    TimedOut {
        attempts: u32,
        last_detail: Option<String>,
    },
}

/// Polls a [`Probe`] every `interval` until it succeeds or `deadline`
/// elapses. Dropping the future abandons the episode.
#[derive(Clone)]
pub struct ReadinessProber {
    probe: Arc<dyn Probe>,
    interval: Duration,
    deadline: Duration,
}

impl ReadinessProber {
    pub fn new(probe: Arc<dyn Probe>, interval: Duration, deadline: Duration) -> Self {
        Self {
            probe,
            interval,
            deadline,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    pub async fn await_ready(&self) -> ProbeOutcome {
        let started = Instant::now();
        let deadline_at = started + self.deadline;
        let mut attempts = 0u32;
        let mut last_detail = None;

        loop {
            let attempt_at = Instant::now();
            attempts += 1;

            // A slow attempt must not carry the episode past its deadline.
            let remaining = deadline_at.saturating_duration_since(attempt_at);
            let result = tokio::time::timeout(remaining, self.probe.probe())
                .await
                .unwrap_or_else(|_| ProbeResult::Failed("timed out".to_string()));

            if result.is_healthy() {
                let elapsed = started.elapsed();
                info!(attempts, ?elapsed, "workload ready");
                return ProbeOutcome::Ready { attempts, elapsed };
            }

            last_detail = result.detail().or(last_detail);
            debug!(attempts, detail = ?last_detail, "workload not ready yet");

            let next_at = attempt_at + self.interval;
            if next_at >= deadline_at || Instant::now() >= deadline_at {
                warn!(attempts, deadline = ?self.deadline, detail = ?last_detail, "readiness deadline elapsed");
                return ProbeOutcome::TimedOut {
                    attempts,
                    last_detail,
                };
            }
            tokio::time::sleep_until(next_at).await;
        }
    }
}
