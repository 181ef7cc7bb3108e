//! Control surface over the state machine.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

use shelver_audit::AuditLog;
use shelver_gateway::PowerState;
use shelver_idle::{IdleSink, WatchedInstance};
use shelver_state::{Actor, AuditEvent, InstanceRecord, LifecycleStatus};

use crate::error::LifecycleError;
use crate::machine::Intent;

/// What the UI shows: the record, recent audit events, and when the
/// instance will be shelved if no traffic arrives.
#[derive(Debug, Clone, Serialize)]
pub struct StatusView {
    pub instance: InstanceRecord,
    pub recent_events: Vec<AuditEvent>,
    pub idle_timeout_secs: u64,
    pub next_auto_shelve_at: Option<DateTime<Utc>>,
}

/// Cheap, cloneable access to the lifecycle state machine.
///
/// Reads come from the latest published snapshot and never wait on the
/// machine. Requests are queued on the intake and answered once applied.
#[derive(Clone)]
pub struct LifecycleHandle {
    intake: mpsc::Sender<Intent>,
    snapshot: watch::Receiver<InstanceRecord>,
    audit: Arc<AuditLog>,
    idle_timeout: Duration,
    recent: usize,
}

impl LifecycleHandle {
    pub(crate) fn new(
        intake: mpsc::Sender<Intent>,
        snapshot: watch::Receiver<InstanceRecord>,
        audit: Arc<AuditLog>,
        idle_timeout: Duration,
        recent: usize,
    ) -> Self {
        Self {
            intake,
            snapshot,
            audit,
            idle_timeout,
            recent,
        }
    }

    /// Latest published record.
    pub fn record(&self) -> InstanceRecord {
        self.snapshot.borrow().clone()
    }

    /// Receiver notified on every applied event.
    pub fn subscribe(&self) -> watch::Receiver<InstanceRecord> {
        self.snapshot.clone()
    }

    pub fn status(&self) -> StatusView {
        let instance = self.record();
        let next_auto_shelve_at = match (instance.status.is_running(), instance.last_activity_at) {
            (true, Some(last)) => chrono::Duration::from_std(self.idle_timeout)
                .ok()
                .map(|timeout| last + timeout),
            _ => None,
        };
        StatusView {
            instance,
            recent_events: self.audit.recent(self.recent),
            idle_timeout_secs: self.idle_timeout.as_secs(),
            next_auto_shelve_at,
        }
    }

    /// The newest `limit` audit events, oldest first.
    pub fn recent_events(&self, limit: usize) -> Vec<AuditEvent> {
        self.audit.recent(limit)
    }

    /// Ask for the instance to be started. A no-op unless it is shelved or
    /// in error; the returned record reflects the request either way.
    ///
    /// Fails with [`LifecycleError::Audit`] when the request could not be
    /// recorded; no start call is made in that case.
    pub async fn request_unshelve(&self, actor: Actor) -> Result<InstanceRecord, LifecycleError> {
        self.ask(|reply| Intent::Unshelve { actor, reply }).await?
    }

    /// Ask for the instance to be shelved. A no-op when already shelved or
    /// shelving. While a start call is in flight the request is queued
    /// (`shelve_queued`) and applied once the start settles.
    pub async fn request_shelve(&self, actor: Actor) -> Result<InstanceRecord, LifecycleError> {
        self.ask(|reply| Intent::Shelve { actor, reply }).await?
    }

    /// Submit compute-plane ground truth. Returns the corrected status if
    /// the record had drifted.
    pub async fn reconcile(&self, power: PowerState) -> Result<Option<LifecycleStatus>, LifecycleError> {
        self.ask(|reply| Intent::Reconcile { power, reply }).await
    }

    async fn ask<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Intent) -> Result<T, LifecycleError> {
        let (tx, rx) = oneshot::channel();
        self.intake
            .send(make(tx))
            .await
            .map_err(|_| LifecycleError::Closed)?;
        rx.await.map_err(|_| LifecycleError::Closed)
    }

    async fn submit(&self, intent: Intent) {
        if self.intake.send(intent).await.is_err() {
            debug!("lifecycle intake closed, dropping watcher event");
        }
    }
}

#[async_trait]
impl IdleSink for LifecycleHandle {
    fn instance(&self) -> WatchedInstance {
        let record = self.snapshot.borrow();
        WatchedInstance {
            status: record.status,
            episode: record.episode,
            last_activity_at: record.last_activity_at,
        }
    }

    async fn activity(&self, at: DateTime<Utc>) {
        self.submit(Intent::Activity { at }).await;
    }

    async fn idle_warning(&self, episode: u64, shelve_at: DateTime<Utc>) {
        self.submit(Intent::IdleWarning { episode, shelve_at }).await;
    }

    async fn idle_timeout(&self, episode: u64, last_activity_at: DateTime<Utc>) {
        self.submit(Intent::IdleTimeout {
            episode,
            last_activity_at,
        })
        .await;
    }
}
