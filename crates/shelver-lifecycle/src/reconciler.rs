//! Periodic correction of the record against compute-plane ground truth.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use shelver_gateway::{ComputeGateway, PowerState, with_timeout};
use shelver_state::LifecycleStatus;

use crate::error::LifecycleError;
use crate::handle::LifecycleHandle;

/// The status the record should move to given `power`, or `None` when
/// they agree on the active/shelved axis or the power state is unknown.
pub fn drift(status: LifecycleStatus, power: &PowerState) -> Option<LifecycleStatus> {
    use LifecycleStatus::*;
    match (power, status) {
        (PowerState::Unknown(_), _) => None,
        (PowerState::Active, Active | IdleCountdown) => None,
        (PowerState::Active, Shelved | Unshelving | Shelving | Error) => Some(Active),
        (PowerState::Shelved, Shelved) => None,
        (PowerState::Shelved, Active | IdleCountdown | Unshelving | Shelving | Error) => Some(Shelved),
    }
}

/// Reads instance status on a fixed interval and submits it to the
/// state machine. Never issues start or shelve calls.
pub struct Reconciler {
    compute: Arc<dyn ComputeGateway>,
    handle: LifecycleHandle,
    status_timeout: Duration,
}

impl Reconciler {
    pub fn new(compute: Arc<dyn ComputeGateway>, handle: LifecycleHandle, status_timeout: Duration) -> Self {
        Self {
            compute,
            handle,
            status_timeout,
        }
    }

    /// One pass. A failed status query skips the pass.
    pub async fn run_once(&self) -> Result<Option<LifecycleStatus>, LifecycleError> {
        let power = match with_timeout(
            "instance_status",
            self.status_timeout,
            self.compute.instance_status(),
        )
        .await
        {
            Ok(power) => power,
            Err(e) => {
                warn!(error = %e, "reconciliation skipped, compute status unavailable");
                return Ok(None);
            }
        };

        debug!(%power, "compute plane status");
        self.handle.reconcile(power).await
    }

    pub async fn run(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "reconciler started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.run_once().await {
                        warn!(error = %e, "reconciliation failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("reconciler shutting down");
                    break;
                }
            }
        }
    }
}
