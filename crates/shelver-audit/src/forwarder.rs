//! Background mirroring of the audit outbox to durable remote storage.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{Notify, watch};
use tracing::{debug, info, warn};

use shelver_gateway::{ObjectStore, with_timeout};
use shelver_state::{AuditEvent, StateStore};

use crate::error::AuditResult;

/// Events pulled from the outbox per pass.
const BATCH: usize = 64;

/// Upper bound between passes even without a wakeup.
const IDLE_PASS: Duration = Duration::from_secs(60);

/// Exponential backoff: doubles on each failure up to a cap, resets on success.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            current: base,
            failures: 0,
        }
    }

    /// Record a failure and return how long to wait before retrying.
    pub fn fail(&mut self) -> Duration {
        let wait = self.current;
        self.failures += 1;
        self.current = (self.current * 2).min(self.max);
        wait
    }

    pub fn reset(&mut self) {
        self.current = self.base;
        self.failures = 0;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}

/// Outcome of one drain pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: usize,
    /// A put failed; the pass stopped at that event.
    pub failed: bool,
}

/// Drains the outbox into an [`ObjectStore`].
///
/// Events are delivered oldest first and removed from the outbox only
/// after the store acknowledged them, so a crash between the put and the
/// removal leads to a redelivery of the same key, which the store treats
/// as an overwrite.
pub struct AuditForwarder {
    outbox: StateStore,
    target: Arc<dyn ObjectStore>,
    container: String,
    prefix: String,
    timeout: Duration,
    notify: Arc<Notify>,
    backoff: Backoff,
}

impl AuditForwarder {
    pub fn new(
        outbox: StateStore,
        target: Arc<dyn ObjectStore>,
        container: impl Into<String>,
        prefix: impl Into<String>,
        timeout: Duration,
        notify: Arc<Notify>,
    ) -> Self {
        Self {
            outbox,
            target,
            container: container.into(),
            prefix: prefix.into().trim_matches('/').to_string(),
            timeout,
            notify,
            backoff: Backoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Remote key for an event: `{prefix}/{id}.json`.
    pub fn object_key(&self, event: &AuditEvent) -> String {
        if self.prefix.is_empty() {
            format!("{}.json", event.id)
        } else {
            format!("{}/{}.json", self.prefix, event.id)
        }
    }

    /// Deliver pending events until the outbox is empty or a put fails.
    pub async fn drain_once(&mut self) -> AuditResult<DrainReport> {
        let mut report = DrainReport::default();
        loop {
            let batch = self.outbox.list_outbox(BATCH)?;
            if batch.is_empty() {
                return Ok(report);
            }

            for event in batch {
                let key = self.object_key(&event);
                let mut payload = serde_json::to_vec(&event)?;
                payload.push(b'\n');

                let result = with_timeout(
                    "put_object",
                    self.timeout,
                    self.target
                        .put_object(&self.container, &key, Bytes::from(payload)),
                )
                .await;

                match result {
                    Ok(()) => {
                        self.outbox.remove_outbox(event.seq)?;
                        report.delivered += 1;
                        debug!(seq = event.seq, %key, "audit event mirrored");
                    }
                    Err(e) => {
                        warn!(
                            seq = event.seq,
                            %key,
                            error = %e,
                            "audit event mirroring failed, will retry"
                        );
                        report.failed = true;
                        return Ok(report);
                    }
                }
            }
        }
    }

    /// Run until shutdown, draining on every wakeup and retrying with
    /// backoff after failures.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            container = %self.container,
            prefix = %self.prefix,
            "audit forwarder started"
        );

        loop {
            let wait = match self.drain_once().await {
                Ok(report) if report.failed => {
                    let wait = self.backoff.fail();
                    debug!(
                        failures = self.backoff.consecutive_failures(),
                        retry_in = ?wait,
                        "audit forwarder backing off"
                    );
                    Some(wait)
                }
                Ok(report) => {
                    if report.delivered > 0 {
                        debug!(delivered = report.delivered, "audit outbox drained");
                    }
                    self.backoff.reset();
                    None
                }
                Err(e) => {
                    warn!(error = %e, "audit outbox unreadable");
                    Some(self.backoff.fail())
                }
            };

            match wait {
                Some(wait) => {
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = shutdown.changed() => break,
                    }
                }
                None => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep(IDLE_PASS) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }

        info!("audit forwarder stopped");
    }
}
