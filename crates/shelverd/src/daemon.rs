//! Controller mode: wire every subsystem together and serve the API.
//!
//! Startup order:
//! 1. Open the state store (cursor + audit outbox) and the audit log
//! 2. Build the compute gateway and readiness prober
//! 3. Start the lifecycle state machine (restores the last status)
//! 4. Reconcile once against the compute plane before serving
//! 5. Start the idle watcher, reconciler loop, and audit forwarder
//! 6. Serve the control API until Ctrl-C

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{info, warn};

use shelver_audit::{AuditForwarder, AuditLog, AuditLogOptions};
use shelver_core::{MirrorConfig, MirrorKind, SharedClock, ShelverConfig, SystemClock};
use shelver_gateway::{
    CommandComputeGateway, ComputeGateway, DirectoryObjectStore, HttpObjectStore, ObjectStore,
};
use shelver_health::{HttpProbe, ReadinessProber};
use shelver_idle::{IdleWatcher, IdleWatcherConfig, LogTailer};
use shelver_lifecycle::{LifecycleMachine, LifecycleSettings, Reconciler};
use shelver_state::StateStore;

pub async fn run(config: ShelverConfig) -> anyhow::Result<()> {
    info!(instance = %config.instance.id, "Shelver daemon starting");

    // ── Persistent state ───────────────────────────────────────

    ensure_parent(&config.state.path)?;
    let store = StateStore::open(&config.state.path)
        .with_context(|| format!("opening state store {}", config.state.path.display()))?;
    info!(path = %config.state.path.display(), "state store opened");

    let audit = Arc::new(
        AuditLog::open(
            AuditLogOptions {
                path: config.audit.path.clone(),
                max_bytes: config.audit.max_bytes,
                max_files: config.audit.max_files,
                recent: config.audit.recent,
                sync: true,
            },
            outbox_for(config.audit.mirror.as_ref(), &store),
        )
        .with_context(|| format!("opening audit log {}", config.audit.path.display()))?,
    );

    // ── Gateways ───────────────────────────────────────────────

    let clock: SharedClock = Arc::new(SystemClock);
    let compute: Arc<dyn ComputeGateway> = Arc::new(CommandComputeGateway::new(
        config.compute.program.clone(),
        config.compute.args.clone(),
        config.instance.id.clone(),
    ));

    let probe = HttpProbe::new(
        config.readiness.url.clone(),
        config.readiness.verify_tls,
        config.readiness.attempt_timeout,
    )?;
    if !config.readiness.verify_tls {
        warn!(url = %config.readiness.url, "TLS verification disabled for readiness probe");
    }
    let prober = ReadinessProber::new(
        Arc::new(probe),
        config.readiness.interval,
        config.readiness.deadline,
    );

    // ── Lifecycle ──────────────────────────────────────────────

    let (machine, handle) = LifecycleMachine::new(
        LifecycleSettings {
            instance_id: config.instance.id.clone(),
            compute_timeout: config.compute.timeout,
            idle_timeout: config.idle.timeout,
            recent: config.audit.recent,
        },
        compute.clone(),
        prober,
        audit.clone(),
        clock.clone(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(machine.run(shutdown_rx.clone())));

    let reconciler = Reconciler::new(compute, handle.clone(), config.compute.status_timeout);
    match reconciler.run_once().await {
        Ok(Some(status)) => info!(%status, "startup reconciliation corrected the record"),
        Ok(None) => info!(status = %handle.record().status, "startup reconciliation complete"),
        Err(e) => warn!(error = %e, "startup reconciliation failed"),
    }
    tasks.push(tokio::spawn(
        reconciler.run(config.reconcile.interval, shutdown_rx.clone()),
    ));

    // ── Idle watcher ───────────────────────────────────────────

    let tailer = LogTailer::open(&config.idle.access_log, Some(store.clone()))?;
    let watcher = IdleWatcher::new(
        IdleWatcherConfig::from(&config.idle),
        tailer,
        Arc::new(handle.clone()),
        clock,
    );
    tasks.push(tokio::spawn(watcher.run(shutdown_rx.clone())));

    // ── Audit mirroring ────────────────────────────────────────

    match &config.audit.mirror {
        Some(mirror) => {
            let target = build_object_store(mirror)?;
            let forwarder = AuditForwarder::new(
                store.clone(),
                target,
                mirror.container.clone(),
                mirror.prefix.clone(),
                mirror.timeout,
                audit.notifier(),
            );
            tasks.push(tokio::spawn(forwarder.run(shutdown_rx.clone())));
        }
        None => info!("audit mirroring disabled"),
    }

    // ── API server ─────────────────────────────────────────────

    let router = shelver_api::build_router(handle);
    let addr = config.api.listen;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding control API on {addr}"))?;
    info!(%addr, "control API listening");

    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C, shutting down");
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });
    server.await?;

    for task in tasks {
        let _ = task.await;
    }

    info!("Shelver daemon stopped");
    Ok(())
}

fn build_object_store(mirror: &MirrorConfig) -> anyhow::Result<Arc<dyn ObjectStore>> {
    match mirror.kind {
        MirrorKind::Http => {
            let endpoint = mirror
                .endpoint
                .clone()
                .context("audit.mirror.endpoint is required for kind = \"http\"")?;
            let token = match &mirror.token_env {
                Some(var) => {
                    let token = std::env::var(var).ok();
                    if token.is_none() {
                        warn!(%var, "object store token variable is not set");
                    }
                    token
                }
                None => None,
            };
            info!(%endpoint, container = %mirror.container, "mirroring audit events over HTTP");
            Ok(Arc::new(HttpObjectStore::new(endpoint, token)?))
        }
        MirrorKind::Directory => {
            let directory = mirror
                .directory
                .clone()
                .context("audit.mirror.directory is required for kind = \"directory\"")?;
            info!(directory = %directory.display(), "mirroring audit events to directory");
            Ok(Arc::new(DirectoryObjectStore::new(directory)))
        }
    }
}

/// The outbox is only drained by the forwarder, so it is attached only
/// when a mirror is configured.
fn outbox_for(mirror: Option<&MirrorConfig>, store: &StateStore) -> Option<StateStore> {
    mirror.map(|_| store.clone())
}

fn ensure_parent(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn mirror(kind: MirrorKind) -> MirrorConfig {
        MirrorConfig {
            kind,
            container: "shelver-events".into(),
            prefix: "gpu".into(),
            endpoint: None,
            token_env: None,
            directory: None,
            timeout: Duration::from_secs(30),
        }
    }

    #[test]
    fn directory_mirror_requires_directory() {
        assert!(build_object_store(&mirror(MirrorKind::Directory)).is_err());

        let dir = tempfile::tempdir().unwrap();
        let config = MirrorConfig {
            directory: Some(dir.path().to_path_buf()),
            ..mirror(MirrorKind::Directory)
        };
        assert!(build_object_store(&config).is_ok());
    }

    #[test]
    fn http_mirror_requires_endpoint() {
        assert!(build_object_store(&mirror(MirrorKind::Http)).is_err());

        let config = MirrorConfig {
            endpoint: Some("https://swift.example.org/v1/AUTH_x".into()),
            ..mirror(MirrorKind::Http)
        };
        assert!(build_object_store(&config).is_ok());
    }

    #[test]
    fn outbox_attached_only_with_mirror() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(outbox_for(None, &store).is_none());

        let mirror = mirror(MirrorKind::Directory);
        assert!(outbox_for(Some(&mirror), &store).is_some());
    }

    #[test]
    fn unmirrored_log_leaves_outbox_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open_in_memory().unwrap();
        let log = AuditLog::open(
            AuditLogOptions {
                sync: false,
                ..AuditLogOptions::new(dir.path().join("events.jsonl"))
            },
            outbox_for(None, &store),
        )
        .unwrap();
        log.append(shelver_state::AuditEvent::new(
            shelver_state::AuditKind::InstanceShelved,
            "gpu",
            shelver_state::Actor::Controller,
            chrono::Utc::now(),
        ))
        .unwrap();
        assert_eq!(store.outbox_len().unwrap(), 0);
    }

    #[test]
    fn ensure_parent_creates_nested_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/state.redb");
        ensure_parent(&path).unwrap();
        assert!(dir.path().join("a/b").is_dir());
    }
}
