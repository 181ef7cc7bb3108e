//! Whole-controller scenarios: state machine, idle watcher, reconciler,
//! and audit log wired together against fake gateways and paused time.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use shelver_audit::{AuditForwarder, AuditLog, AuditLogOptions};
use shelver_core::{SharedClock, TokioClock};
use shelver_gateway::fake::{FakeCompute, MemoryObjectStore};
use shelver_gateway::{GatewayError, PowerState};
use shelver_health::ReadinessProber;
use shelver_health::fake::ScriptedProbe;
use shelver_idle::{IdleWatcher, IdleWatcherConfig, LogTailer};
use shelver_lifecycle::{LifecycleHandle, LifecycleMachine, LifecycleSettings, Reconciler};
use shelver_state::{Actor, AuditKind, InstanceRecord, LifecycleStatus, StateStore};

const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

struct Controller {
    dir: tempfile::TempDir,
    handle: LifecycleHandle,
    compute: Arc<FakeCompute>,
    probe: Arc<ScriptedProbe>,
    audit: Arc<AuditLog>,
    outbox: StateStore,
    clock: SharedClock,
    shutdown: watch::Sender<bool>,
}

fn t0() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

fn append(path: &Path, text: &str) {
    let mut f = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    f.write_all(text.as_bytes()).unwrap();
}

/// Start the state machine and idle watcher over a fresh directory.
fn controller(power: PowerState, probe: ScriptedProbe) -> Controller {
    let dir = tempfile::tempdir().unwrap();
    let access_log = dir.path().join("access.log");
    append(&access_log, "");

    let outbox = StateStore::open_in_memory().unwrap();
    let audit = Arc::new(
        AuditLog::open(
            AuditLogOptions {
                sync: false,
                ..AuditLogOptions::new(dir.path().join("events.jsonl"))
            },
            Some(outbox.clone()),
        )
        .unwrap(),
    );
    let compute = Arc::new(FakeCompute::new(power));
    let probe = Arc::new(probe);
    let clock: SharedClock = Arc::new(TokioClock::starting_at(t0()));

    let (machine, handle) = LifecycleMachine::new(
        LifecycleSettings {
            instance_id: "gpu".into(),
            compute_timeout: Duration::from_secs(600),
            idle_timeout: IDLE_TIMEOUT,
            recent: 50,
        },
        compute.clone(),
        ReadinessProber::new(probe.clone(), Duration::from_secs(2), Duration::from_secs(600)),
        audit.clone(),
        clock.clone(),
    );

    let watcher = IdleWatcher::new(
        IdleWatcherConfig {
            upstream_label: "gpu".into(),
            timeout: IDLE_TIMEOUT,
            poll_interval: Duration::from_secs(1),
            rotation_grace: Duration::from_secs(120),
            warning: None,
            ignore_statuses: Vec::new(),
        },
        LogTailer::open(&access_log, Some(outbox.clone())).unwrap(),
        Arc::new(handle.clone()),
        clock.clone(),
    );

    let (shutdown, rx) = watch::channel(false);
    tokio::spawn(machine.run(rx.clone()));
    tokio::spawn(watcher.run(rx));

    Controller {
        dir,
        handle,
        compute,
        probe,
        audit,
        outbox,
        clock,
        shutdown,
    }
}

async fn wait_for(handle: &LifecycleHandle, status: LifecycleStatus) -> InstanceRecord {
    let mut rx = handle.subscribe();
    let record = tokio::time::timeout(
        Duration::from_secs(3600),
        rx.wait_for(|r| r.status == status && r.operation.is_none()),
    )
    .await
    .expect("status not reached in time")
    .unwrap()
    .clone();
    record
}

fn kinds(audit: &AuditLog) -> Vec<AuditKind> {
    audit.read_all().unwrap().into_iter().map(|e| e.kind).collect()
}

#[tokio::test(start_paused = true)]
async fn unshelve_probe_idle_shelve_records_six_events() {
    let c = controller(PowerState::Shelved, ScriptedProbe::ready_after(2));

    let accepted = c.handle.request_unshelve(Actor::Operator).await.unwrap();
    assert_eq!(accepted.status, LifecycleStatus::Unshelving);

    let active = wait_for(&c.handle, LifecycleStatus::Active).await;
    assert_eq!(c.probe.attempts(), 3);
    let active_at = active.last_activity_at.expect("last activity set on activation");
    assert!(active_at >= t0() + chrono::Duration::seconds(4));

    let shelved = wait_for(&c.handle, LifecycleStatus::Shelved).await;
    assert!(shelved.last_transition_at >= active_at + chrono::Duration::seconds(60));
    assert_eq!(c.compute.start_calls(), 1);
    assert_eq!(c.compute.shelve_calls(), 1);

    assert_eq!(
        kinds(&c.audit),
        vec![
            AuditKind::ManualUnshelveRequested,
            AuditKind::UnshelveIssued,
            AuditKind::InstanceActive,
            AuditKind::IdleTimeoutDetected,
            AuditKind::AutoShelveRequested,
            AuditKind::InstanceShelved,
        ]
    );

    let events = c.audit.read_all().unwrap();
    let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(events[3].actor, Actor::IdleWatcher);
    assert_eq!(c.outbox.outbox_len().unwrap(), 6);

    c.shutdown.send(true).unwrap();
}

#[tokio::test(start_paused = true)]
async fn proxy_traffic_keeps_instance_active() {
    let c = controller(PowerState::Shelved, ScriptedProbe::ready_after(0));
    c.handle.request_unshelve(Actor::Operator).await.unwrap();
    wait_for(&c.handle, LifecycleStatus::Active).await;

    let log = c.dir.path().join("access.log");
    for _ in 0..4 {
        tokio::time::sleep(Duration::from_secs(30)).await;
        let ts = c.clock.now().timestamp();
        append(
            &log,
            &format!("{{\"ts\":{ts},\"status\":200,\"upstream\":{{\"name\":\"gpu\"}}}}\n"),
        );
    }
    tokio::time::sleep(Duration::from_secs(30)).await;

    // Two minutes past activation, traffic every 30s: still up.
    assert_eq!(c.handle.record().status, LifecycleStatus::Active);
    assert_eq!(c.compute.shelve_calls(), 0);

    // Traffic stops; the watcher shelves it.
    wait_for(&c.handle, LifecycleStatus::Shelved).await;
    assert_eq!(c.compute.shelve_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn manual_shelve_races_idle_timeout_without_double_shelve() {
    let c = controller(PowerState::Shelved, ScriptedProbe::ready_after(0));
    c.compute.set_delay(Duration::from_secs(5));
    c.handle.request_unshelve(Actor::Operator).await.unwrap();
    wait_for(&c.handle, LifecycleStatus::Active).await;

    // Shelve by hand just before the idle timeout would fire.
    tokio::time::sleep(Duration::from_secs(59)).await;
    let shelving = c.handle.request_shelve(Actor::Operator).await.unwrap();
    assert_eq!(shelving.status, LifecycleStatus::Shelving);

    wait_for(&c.handle, LifecycleStatus::Shelved).await;
    tokio::time::sleep(Duration::from_secs(120)).await;

    assert_eq!(c.compute.shelve_calls(), 1);
    let kinds = kinds(&c.audit);
    assert!(!kinds.contains(&AuditKind::AutoShelveRequested));
    assert_eq!(kinds.last(), Some(&AuditKind::InstanceShelved));
}

#[tokio::test(start_paused = true)]
async fn reconciler_corrects_drift_without_gateway_calls() {
    let c = controller(PowerState::Shelved, ScriptedProbe::ready_after(0));
    c.handle.request_unshelve(Actor::Operator).await.unwrap();
    wait_for(&c.handle, LifecycleStatus::Active).await;

    // Someone shelved the instance behind the controller's back.
    c.compute.set_power(PowerState::Shelved);
    let reconciler = Reconciler::new(c.compute.clone(), c.handle.clone(), Duration::from_secs(30));
    let corrected = reconciler.run_once().await.unwrap();
    assert_eq!(corrected, Some(LifecycleStatus::Shelved));

    let record = c.handle.record();
    assert_eq!(record.status, LifecycleStatus::Shelved);
    assert_eq!(kinds(&c.audit).last(), Some(&AuditKind::ReconciliationMismatch));
    assert_eq!(c.compute.start_calls(), 1);
    assert_eq!(c.compute.shelve_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn reconciler_skips_pass_when_status_unavailable() {
    let c = controller(PowerState::Active, ScriptedProbe::ready_after(0));
    c.compute
        .set_status_error(Some(GatewayError::failed("instance_status", "503")));

    let reconciler = Reconciler::new(c.compute.clone(), c.handle.clone(), Duration::from_secs(30));
    assert_eq!(reconciler.run_once().await.unwrap(), None);
    assert_eq!(c.handle.record().status, LifecycleStatus::Shelved);
    assert!(kinds(&c.audit).is_empty());
}

#[tokio::test(start_paused = true)]
async fn restart_restores_status_from_audit_log() {
    let c = controller(PowerState::Shelved, ScriptedProbe::ready_after(0));
    c.handle.request_unshelve(Actor::Operator).await.unwrap();
    wait_for(&c.handle, LifecycleStatus::Active).await;
    c.shutdown.send(true).unwrap();
    tokio::task::yield_now().await;

    let reopened = Arc::new(
        AuditLog::open(
            AuditLogOptions {
                sync: false,
                ..AuditLogOptions::new(c.dir.path().join("events.jsonl"))
            },
            None,
        )
        .unwrap(),
    );
    let (machine, handle) = LifecycleMachine::new(
        LifecycleSettings {
            instance_id: "gpu".into(),
            compute_timeout: Duration::from_secs(600),
            idle_timeout: IDLE_TIMEOUT,
            recent: 50,
        },
        c.compute.clone(),
        ReadinessProber::new(c.probe.clone(), Duration::from_secs(2), Duration::from_secs(60)),
        reopened.clone(),
        c.clock.clone(),
    );
    let (_tx, rx) = watch::channel(false);
    tokio::spawn(machine.run(rx));

    let record = handle.record();
    assert_eq!(record.status, LifecycleStatus::Active);
    assert!(record.last_activity_at.is_some());

    let reconciler = Reconciler::new(c.compute.clone(), handle.clone(), Duration::from_secs(30));
    assert_eq!(reconciler.run_once().await.unwrap(), None);
    assert_eq!(handle.status().recent_events.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn audit_trail_is_mirrored_with_stable_keys() {
    let c = controller(PowerState::Shelved, ScriptedProbe::ready_after(0));
    let remote = Arc::new(MemoryObjectStore::new());
    remote.fail_next(1);

    let forwarder = AuditForwarder::new(
        c.outbox.clone(),
        remote.clone(),
        "shelver-events",
        "gpu",
        Duration::from_secs(30),
        c.audit.notifier(),
    );
    tokio::spawn(forwarder.run(c.shutdown.subscribe()));

    c.handle.request_unshelve(Actor::Operator).await.unwrap();
    wait_for(&c.handle, LifecycleStatus::Active).await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    let events = c.audit.read_all().unwrap();
    assert_eq!(remote.object_count(), events.len());
    for event in &events {
        assert!(
            remote
                .get("shelver-events", &format!("gpu/{}.json", event.id))
                .is_some()
        );
    }
    assert_eq!(c.outbox.outbox_len().unwrap(), 0);
}
