//! The single-writer lifecycle state machine.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use shelver_audit::{AuditLog, AuditResult};
use shelver_core::SharedClock;
use shelver_gateway::{ComputeGateway, GatewayResult, PowerState, with_timeout};
use shelver_health::{ProbeOutcome, ReadinessProber};
use shelver_state::{
    Actor, AuditEvent, AuditKind, ErrorDetail, ErrorKind, InstanceRecord, LifecycleStatus,
    Operation,
};

use crate::error::LifecycleError;
use crate::handle::LifecycleHandle;
use crate::reconciler::drift;

const INTAKE_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub instance_id: String,
    /// Bound on each start and shelve call.
    pub compute_timeout: Duration,
    pub idle_timeout: Duration,
    /// Audit events included in status views.
    pub recent: usize,
}

/// Everything the machine applies, from every source.
#[derive(Debug)]
pub(crate) enum Intent {
    Unshelve {
        actor: Actor,
        reply: oneshot::Sender<Result<InstanceRecord, LifecycleError>>,
    },
    Shelve {
        actor: Actor,
        reply: oneshot::Sender<Result<InstanceRecord, LifecycleError>>,
    },
    Activity {
        at: DateTime<Utc>,
    },
    IdleWarning {
        episode: u64,
        shelve_at: DateTime<Utc>,
    },
    IdleTimeout {
        episode: u64,
        last_activity_at: DateTime<Utc>,
    },
    Reconcile {
        power: PowerState,
        reply: oneshot::Sender<Option<LifecycleStatus>>,
    },
    StartFinished {
        episode: u64,
        result: GatewayResult<()>,
    },
    ProbeFinished {
        episode: u64,
        outcome: ProbeOutcome,
    },
    ShelveFinished {
        episode: u64,
        result: GatewayResult<()>,
    },
}

/// Owns the [`InstanceRecord`]; see the crate docs for the data flow.
pub struct LifecycleMachine {
    record: InstanceRecord,
    settings: LifecycleSettings,
    compute: Arc<dyn ComputeGateway>,
    prober: ReadinessProber,
    audit: Arc<AuditLog>,
    clock: SharedClock,
    intake: mpsc::Sender<Intent>,
    rx: mpsc::Receiver<Intent>,
    snapshot: watch::Sender<InstanceRecord>,
    probe_task: Option<JoinHandle<()>>,
    /// Shelve requested while the start call was in flight.
    queued_shelve: Option<Actor>,
}

impl LifecycleMachine {
    /// Build the machine and its control handle.
    ///
    /// The starting status is the last one recorded in the audit log
    /// (`Shelved` for an empty log). Running statuses restart their idle
    /// budget now; a restored `Unshelving` resumes probing once [`run`]
    /// starts. Anything else is left for the reconciler to confirm.
    ///
    /// [`run`]: LifecycleMachine::run
    pub fn new(
        settings: LifecycleSettings,
        compute: Arc<dyn ComputeGateway>,
        prober: ReadinessProber,
        audit: Arc<AuditLog>,
        clock: SharedClock,
    ) -> (Self, LifecycleHandle) {
        let now = clock.now();
        let status = audit.last_status().unwrap_or(LifecycleStatus::Shelved);
        let mut record = InstanceRecord::new(settings.instance_id.clone(), status, now);
        if status.is_running() {
            record.last_activity_at = Some(now);
        }
        if status == LifecycleStatus::Unshelving {
            record.operation = Some(Operation::Probing);
        }

        let (intake, rx) = mpsc::channel(INTAKE_CAPACITY);
        let (snapshot, snapshot_rx) = watch::channel(record.clone());
        let handle = LifecycleHandle::new(
            intake.clone(),
            snapshot_rx,
            audit.clone(),
            settings.idle_timeout,
            settings.recent,
        );

        let machine = Self {
            record,
            settings,
            compute,
            prober,
            audit,
            clock,
            intake,
            rx,
            snapshot,
            probe_task: None,
            queued_shelve: None,
        };
        (machine, handle)
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            instance = %self.record.instance_id,
            status = %self.record.status,
            "lifecycle state machine started"
        );

        if self.record.status == LifecycleStatus::Unshelving {
            info!("resuming readiness probe interrupted by restart");
            self.spawn_probe();
        }

        loop {
            tokio::select! {
                Some(intent) = self.rx.recv() => self.apply(intent),
                _ = shutdown.changed() => break,
            }
        }

        if let Some(task) = self.probe_task.take() {
            task.abort();
        }
        info!("lifecycle state machine stopped");
    }

    fn apply(&mut self, intent: Intent) {
        match intent {
            Intent::Unshelve { actor, reply } => {
                let result = self.on_unshelve(actor).map(|()| self.record.clone());
                let _ = reply.send(result);
            }
            Intent::Shelve { actor, reply } => {
                let result = self.on_shelve(actor).map(|()| self.record.clone());
                let _ = reply.send(result);
            }
            Intent::Activity { at } => self.on_activity(at),
            Intent::IdleWarning { episode, shelve_at } => self.on_idle_warning(episode, shelve_at),
            Intent::IdleTimeout {
                episode,
                last_activity_at,
            } => self.on_idle_timeout(episode, last_activity_at),
            Intent::Reconcile { power, reply } => {
                let corrected = self.on_reconcile(&power);
                let _ = reply.send(corrected);
            }
            Intent::StartFinished { episode, result } => self.on_start_finished(episode, result),
            Intent::ProbeFinished { episode, outcome } => self.on_probe_finished(episode, outcome),
            Intent::ShelveFinished { episode, result } => self.on_shelve_finished(episode, result),
        }
        self.snapshot.send_replace(self.record.clone());
    }

    // ── Requests ───────────────────────────────────────────────

    fn on_unshelve(&mut self, actor: Actor) -> Result<(), LifecycleError> {
        let previous = self.record.status;
        if !matches!(previous, LifecycleStatus::Shelved | LifecycleStatus::Error) {
            debug!(status = %previous, ?actor, "unshelve request is a no-op");
            return Ok(());
        }

        let kind = match actor {
            Actor::Public => AuditKind::PublicWakeRequested,
            _ => AuditKind::ManualUnshelveRequested,
        };
        self.audit(kind, actor, Some(LifecycleStatus::Unshelving), json!({ "from": previous }))?;
        self.record.last_error = None;
        self.enter(LifecycleStatus::Unshelving);
        self.record.operation = Some(Operation::Starting);
        info!(?actor, from = %previous, "unshelve accepted");

        let episode = self.record.episode;
        let compute = self.compute.clone();
        let intake = self.intake.clone();
        let limit = self.settings.compute_timeout;
        tokio::spawn(async move {
            let result = with_timeout("start_instance", limit, compute.start_instance()).await;
            let _ = intake.send(Intent::StartFinished { episode, result }).await;
        });
        Ok(())
    }

    fn on_shelve(&mut self, actor: Actor) -> Result<(), LifecycleError> {
        let status = self.record.status;
        if matches!(status, LifecycleStatus::Shelved | LifecycleStatus::Shelving) {
            debug!(%status, ?actor, "shelve request is a no-op");
            return Ok(());
        }
        if self.record.operation == Some(Operation::Starting) {
            if self.queued_shelve.is_none() {
                info!(?actor, "shelve queued until the start call settles");
                self.queued_shelve = Some(actor);
                self.record.shelve_queued = true;
            }
            return Ok(());
        }
        self.begin_shelve(AuditKind::ManualShelveRequested, actor)
    }

    /// Record the shelve request, then issue the call. Nothing changes when
    /// the request cannot be recorded.
    fn begin_shelve(&mut self, kind: AuditKind, actor: Actor) -> Result<(), LifecycleError> {
        let previous = self.record.status;
        self.audit(kind, actor, Some(LifecycleStatus::Shelving), json!({ "from": previous }))?;

        if let Some(task) = self.probe_task.take() {
            debug!("abandoning readiness probe");
            task.abort();
        }
        self.record.last_error = None;
        self.enter(LifecycleStatus::Shelving);
        self.record.operation = Some(Operation::Shelving);
        info!(?actor, from = %previous, "shelve accepted");

        let episode = self.record.episode;
        let compute = self.compute.clone();
        let intake = self.intake.clone();
        let limit = self.settings.compute_timeout;
        tokio::spawn(async move {
            let result = with_timeout("shelve_instance", limit, compute.shelve_instance()).await;
            let _ = intake.send(Intent::ShelveFinished { episode, result }).await;
        });
        Ok(())
    }

    // ── Idle watcher events ────────────────────────────────────

    fn on_activity(&mut self, at: DateTime<Utc>) {
        if !self.record.observe_activity(at) {
            return;
        }
        if self.record.status == LifecycleStatus::IdleCountdown {
            self.enter(LifecycleStatus::Active);
            let _ = self.audit(
                AuditKind::ActivityResumed,
                Actor::IdleWatcher,
                Some(LifecycleStatus::Active),
                json!({ "at": at }),
            );
            info!(%at, "traffic resumed, idle countdown cancelled");
        }
    }

    fn on_idle_warning(&mut self, episode: u64, shelve_at: DateTime<Utc>) {
        if episode != self.record.episode || self.record.status != LifecycleStatus::Active {
            debug!(episode, "discarding stale idle warning");
            return;
        }
        self.enter(LifecycleStatus::IdleCountdown);
        let _ = self.audit(
            AuditKind::IdleCountdownStarted,
            Actor::IdleWatcher,
            Some(LifecycleStatus::IdleCountdown),
            json!({ "shelve_at": shelve_at }),
        );
        info!(%shelve_at, "idle countdown started");
    }

    fn on_idle_timeout(&mut self, episode: u64, last_activity_at: DateTime<Utc>) {
        let newer_activity = self
            .record
            .last_activity_at
            .is_some_and(|seen| seen > last_activity_at);
        if episode != self.record.episode || !self.record.status.is_running() || newer_activity {
            debug!(episode, "discarding stale idle timeout");
            return;
        }

        let detected = self.audit(
            AuditKind::IdleTimeoutDetected,
            Actor::IdleWatcher,
            None,
            json!({
                "last_activity_at": last_activity_at,
                "idle_timeout_secs": self.settings.idle_timeout.as_secs(),
            }),
        );
        if detected.is_err() {
            warn!("idle timeout not acted on, audit log unavailable");
            return;
        }
        if let Err(e) = self.begin_shelve(AuditKind::AutoShelveRequested, Actor::Controller) {
            warn!(error = %e, "automatic shelve not issued");
        }
    }

    // ── Reconciliation ─────────────────────────────────────────

    fn on_reconcile(&mut self, power: &PowerState) -> Option<LifecycleStatus> {
        if let Some(operation) = self.record.operation {
            debug!(?operation, %power, "reconciliation deferred while an operation is in flight");
            return None;
        }

        let previous = self.record.status;
        let target = drift(previous, power)?;
        self.enter(target);
        if target.is_running() {
            self.record.last_activity_at = Some(self.clock.now());
        }
        let _ = self.audit(
            AuditKind::ReconciliationMismatch,
            Actor::Reconciler,
            Some(target),
            json!({ "from": previous, "observed": power.to_string() }),
        );
        warn!(from = %previous, to = %target, observed = %power, "record corrected to match compute plane");
        Some(target)
    }

    // ── Completions ────────────────────────────────────────────

    fn on_start_finished(&mut self, episode: u64, result: GatewayResult<()>) {
        if !self.is_current(episode, "start") {
            return;
        }
        let queued = self.queued_shelve.take();
        self.record.shelve_queued = false;
        match result {
            Ok(()) => {
                self.record.operation = Some(Operation::Probing);
                let _ = self.audit(AuditKind::UnshelveIssued, Actor::Controller, None, serde_json::Value::Null);
                if let Some(actor) = queued {
                    info!(?actor, "start settled, applying queued shelve");
                    match self.begin_shelve(AuditKind::ManualShelveRequested, actor) {
                        Ok(()) => return,
                        Err(e) => warn!(error = %e, "queued shelve refused, continuing unshelve"),
                    }
                }
                info!("unshelve issued, waiting for readiness");
                self.spawn_probe();
            }
            Err(e) => {
                if queued.is_some() {
                    info!("start failed, dropping queued shelve");
                }
                self.fail(ErrorKind::Gateway, e.to_string(), AuditKind::UnshelveFailed);
            }
        }
    }

    fn on_probe_finished(&mut self, episode: u64, outcome: ProbeOutcome) {
        if !self.is_current(episode, "readiness probe") {
            return;
        }
        self.probe_task = None;
        match outcome {
            ProbeOutcome::Ready { attempts, elapsed } => {
                self.enter(LifecycleStatus::Active);
                self.record.last_activity_at = Some(self.clock.now());
                let _ = self.audit(
                    AuditKind::InstanceActive,
                    Actor::Controller,
                    Some(LifecycleStatus::Active),
                    json!({ "attempts": attempts, "elapsed_ms": elapsed.as_millis() as u64 }),
                );
                info!(attempts, ?elapsed, "instance active");
            }
            ProbeOutcome::TimedOut {
                attempts,
                last_detail,
            } => {
                let message = format!(
                    "workload not ready after {attempts} attempts: {}",
                    last_detail.as_deref().unwrap_or("no response")
                );
                self.fail(ErrorKind::ProbeTimeout, message, AuditKind::ProbeTimedOut);
            }
        }
    }

    fn on_shelve_finished(&mut self, episode: u64, result: GatewayResult<()>) {
        if !self.is_current(episode, "shelve") {
            return;
        }
        match result {
            Ok(()) => {
                self.enter(LifecycleStatus::Shelved);
                let _ = self.audit(
                    AuditKind::InstanceShelved,
                    Actor::Controller,
                    Some(LifecycleStatus::Shelved),
                    serde_json::Value::Null,
                );
                info!("instance shelved");
            }
            Err(e) => self.fail(ErrorKind::Gateway, e.to_string(), AuditKind::ShelveFailed),
        }
    }

    // ── Helpers ────────────────────────────────────────────────

    fn spawn_probe(&mut self) {
        if let Some(task) = self.probe_task.take() {
            task.abort();
        }
        let episode = self.record.episode;
        let prober = self.prober.clone();
        let intake = self.intake.clone();
        self.probe_task = Some(tokio::spawn(async move {
            let outcome = prober.await_ready().await;
            let _ = intake.send(Intent::ProbeFinished { episode, outcome }).await;
        }));
    }

    fn is_current(&self, episode: u64, what: &str) -> bool {
        if episode == self.record.episode {
            return true;
        }
        debug!(
            episode,
            current = self.record.episode,
            what,
            "discarding stale completion"
        );
        false
    }

    fn enter(&mut self, status: LifecycleStatus) {
        self.record.transition(status, self.clock.now());
    }

    fn fail(&mut self, kind: ErrorKind, message: String, audit_kind: AuditKind) {
        if let Some(task) = self.probe_task.take() {
            task.abort();
        }
        self.enter(LifecycleStatus::Error);
        self.record.last_error = Some(ErrorDetail {
            kind,
            message: message.clone(),
            at: self.clock.now(),
        });
        let _ = self.audit(
            audit_kind,
            Actor::Controller,
            Some(LifecycleStatus::Error),
            json!({ "error": message }),
        );
        warn!(?audit_kind, error = %message, "lifecycle operation failed");
    }

    /// Append an event. Failures are logged here; request paths also
    /// refuse the transition, completions still apply theirs since the
    /// compute plane has already moved.
    fn audit(
        &self,
        kind: AuditKind,
        actor: Actor,
        status: Option<LifecycleStatus>,
        detail: serde_json::Value,
    ) -> AuditResult<AuditEvent> {
        let mut event = AuditEvent::new(kind, &self.record.instance_id, actor, self.clock.now())
            .with_detail(detail);
        if let Some(status) = status {
            event = event.with_status(status);
        }
        self.audit
            .append(event)
            .inspect_err(|e| error!(?kind, error = %e, "failed to append audit event"))
    }
}
