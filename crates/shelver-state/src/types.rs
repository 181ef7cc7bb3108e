//! Domain types for Shelver.
//!
//! These types represent the lifecycle of the managed instance, the audit
//! trail that records every transition, and the traffic observations the
//! idle watcher extracts from the reverse-proxy log. All persisted types
//! are serializable to/from JSON.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Compute-plane name of a managed instance.
pub type InstanceId = String;

// ── Lifecycle ──────────────────────────────────────────────────────

/// What the managed instance is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStatus {
    Shelved,
    Unshelving,
    Active,
    IdleCountdown,
    Shelving,
    Error,
}

impl LifecycleStatus {
    /// Running and serving traffic (idle detection applies).
    pub fn is_running(self) -> bool {
        matches!(self, Self::Active | Self::IdleCountdown)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Shelved => "shelved",
            Self::Unshelving => "unshelving",
            Self::Active => "active",
            Self::IdleCountdown => "idle_countdown",
            Self::Shelving => "shelving",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for LifecycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The outbound work currently outstanding for the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Compute-plane start (unshelve) call in flight.
    Starting,
    /// Readiness probe polling the health endpoint.
    Probing,
    /// Compute-plane shelve call in flight.
    Shelving,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A compute or storage call failed or timed out.
    Gateway,
    /// The workload never became ready before the probe deadline.
    ProbeTimeout,
}

/// Operator-visible description of the most recent failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: ErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// The authoritative lifecycle state of one managed instance.
///
/// Only the lifecycle state machine writes this; everyone else reads
/// published snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub instance_id: InstanceId,
    pub status: LifecycleStatus,
    /// Incremented on every status change. Completions issued under an
    /// older episode are stale.
    pub episode: u64,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub last_transition_at: DateTime<Utc>,
    pub last_error: Option<ErrorDetail>,
    pub operation: Option<Operation>,
    /// A shelve request is waiting for the in-flight start call to settle.
    #[serde(default)]
    pub shelve_queued: bool,
}

impl InstanceRecord {
    pub fn new(instance_id: impl Into<InstanceId>, status: LifecycleStatus, now: DateTime<Utc>) -> Self {
        Self {
            instance_id: instance_id.into(),
            status,
            episode: 0,
            last_activity_at: None,
            last_transition_at: now,
            last_error: None,
            operation: None,
            shelve_queued: false,
        }
    }

    /// Move to `status`, starting a new episode.
    pub fn transition(&mut self, status: LifecycleStatus, now: DateTime<Utc>) {
        self.status = status;
        self.episode += 1;
        self.last_transition_at = now;
        self.operation = None;
    }

    /// Record traffic at `at` if it is newer than what we have.
    /// Returns whether the record changed.
    pub fn observe_activity(&mut self, at: DateTime<Utc>) -> bool {
        match self.last_activity_at {
            Some(prev) if prev >= at => false,
            _ => {
                self.last_activity_at = Some(at);
                true
            }
        }
    }
}

// ── Audit ─────────────────────────────────────────────────────────

/// Who caused an audited fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Actor {
    /// Operator using the control panel.
    Operator,
    /// Anonymous visitor pressing the public wake button.
    Public,
    IdleWatcher,
    Reconciler,
    /// The controller itself (gateway and probe completions).
    Controller,
}

/// Type of an audited fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditKind {
    ManualUnshelveRequested,
    PublicWakeRequested,
    UnshelveIssued,
    UnshelveFailed,
    InstanceActive,
    ProbeTimedOut,
    IdleCountdownStarted,
    ActivityResumed,
    IdleTimeoutDetected,
    AutoShelveRequested,
    ManualShelveRequested,
    InstanceShelved,
    ShelveFailed,
    ReconciliationMismatch,
}

/// An immutable fact about something that happened to the instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Stable identifier, also the remote object key.
    pub id: Uuid,
    /// Position in the local log, assigned on append.
    #[serde(default)]
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: AuditKind,
    pub instance: InstanceId,
    pub actor: Actor,
    /// Lifecycle status after this fact, when it changed the status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<LifecycleStatus>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub detail: serde_json::Value,
}

impl AuditEvent {
    pub fn new(kind: AuditKind, instance: &str, actor: Actor, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            seq: 0,
            timestamp,
            kind,
            instance: instance.to_string(),
            actor,
            status: None,
            detail: serde_json::Value::Null,
        }
    }

    pub fn with_status(mut self, status: LifecycleStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }
}

// ── Traffic ───────────────────────────────────────────────────────

/// One parsed reverse-proxy access-log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityObservation {
    pub timestamp: DateTime<Utc>,
    pub upstream_label: String,
    pub status_code: u16,
}

/// Read position in the watched access log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogCursor {
    /// File identity (inode on unix, 0 where unavailable).
    pub inode: u64,
    /// Byte offset just past the last complete line consumed.
    pub offset: u64,
}
