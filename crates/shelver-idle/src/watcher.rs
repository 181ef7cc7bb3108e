//! Idle detection over the tailed access log.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use shelver_core::{IdleConfig, SharedClock};
use shelver_state::LifecycleStatus;

use crate::error::WatchResult;
use crate::parse::parse_line;
use crate::tail::LogTailer;

/// What the watcher needs to know about the managed instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedInstance {
    pub status: LifecycleStatus,
    pub episode: u64,
    pub last_activity_at: Option<DateTime<Utc>>,
}

/// Where the watcher reads instance state from and submits its events to.
///
/// The watcher has no write access to lifecycle state; implementations
/// forward these calls to the state machine's intake.
#[async_trait]
pub trait IdleSink: Send + Sync {
    fn instance(&self) -> WatchedInstance;

    /// Qualifying traffic was observed at `at`.
    async fn activity(&self, at: DateTime<Utc>);

    /// The idle budget of `episode` is about to run out at `shelve_at`.
    async fn idle_warning(&self, episode: u64, shelve_at: DateTime<Utc>);

    /// No qualifying traffic since `last_activity_at` for the full timeout.
    async fn idle_timeout(&self, episode: u64, last_activity_at: DateTime<Utc>);
}

#[derive(Debug, Clone)]
pub struct IdleWatcherConfig {
    pub upstream_label: String,
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub rotation_grace: Duration,
    pub warning: Option<Duration>,
    pub ignore_statuses: Vec<u16>,
}

impl From<&IdleConfig> for IdleWatcherConfig {
    fn from(config: &IdleConfig) -> Self {
        Self {
            upstream_label: config.upstream_label.clone(),
            timeout: config.timeout,
            poll_interval: config.poll_interval,
            rotation_grace: config.rotation_grace,
            warning: config.warning,
            ignore_statuses: config.ignore_statuses.clone(),
        }
    }
}

pub struct IdleWatcher {
    config: IdleWatcherConfig,
    tailer: LogTailer,
    sink: Arc<dyn IdleSink>,
    clock: SharedClock,
    started_at: DateTime<Utc>,
    /// Newest qualifying observation read from the log.
    last_seen: Option<DateTime<Utc>>,
    grace_until: Option<DateTime<Utc>>,
    fired_episode: Option<u64>,
    warned_episode: Option<u64>,
    missing: bool,
    malformed: u64,
}

impl IdleWatcher {
    pub fn new(
        config: IdleWatcherConfig,
        tailer: LogTailer,
        sink: Arc<dyn IdleSink>,
        clock: SharedClock,
    ) -> Self {
        let started_at = clock.now();
        Self {
            config,
            tailer,
            sink,
            clock,
            started_at,
            last_seen: None,
            grace_until: None,
            fired_episode: None,
            warned_episode: None,
            missing: false,
            malformed: 0,
        }
    }

    /// Lines skipped because they could not be parsed.
    pub fn malformed_lines(&self) -> u64 {
        self.malformed
    }

    pub fn in_grace(&self, now: DateTime<Utc>) -> bool {
        self.grace_until.is_some_and(|until| now < until)
    }

    /// Read new log lines, forward activity, and evaluate idleness.
    pub async fn poll_once(&mut self) -> WatchResult<()> {
        let now = self.clock.now();
        let batch = match self.tailer.poll() {
            Ok(batch) => batch,
            Err(e) => {
                self.open_grace(now);
                return Err(e);
            }
        };

        if batch.missing {
            if !self.missing {
                warn!(path = %self.tailer.path().display(), "access log missing, idle detection suspended");
            }
            self.missing = true;
            self.open_grace(now);
        } else if self.missing {
            info!(path = %self.tailer.path().display(), "access log available again");
            self.missing = false;
            self.open_grace(now);
        }
        if batch.rotated {
            self.open_grace(now);
        }

        if let Some(at) = self.newest_activity(&batch.lines)
            && self.last_seen.is_none_or(|prev| at > prev)
        {
            self.last_seen = Some(at);
            self.sink.activity(at).await;
        }

        self.evaluate(now).await;
        Ok(())
    }

    fn open_grace(&mut self, now: DateTime<Utc>) {
        let grace = chrono::Duration::from_std(self.config.rotation_grace).unwrap_or(chrono::Duration::zero());
        self.grace_until = Some(now + grace);
    }

    fn newest_activity(&mut self, lines: &[String]) -> Option<DateTime<Utc>> {
        let mut newest = None;
        for line in lines {
            let obs = match parse_line(line) {
                Ok(obs) => obs,
                Err(e) => {
                    self.malformed += 1;
                    debug!(error = %e, malformed = self.malformed, "skipping access log line");
                    continue;
                }
            };
            if obs.upstream_label != self.config.upstream_label
                || self.config.ignore_statuses.contains(&obs.status_code)
            {
                continue;
            }
            newest = newest.max(Some(obs.timestamp));
        }
        newest
    }

    async fn evaluate(&mut self, now: DateTime<Utc>) {
        let instance = self.sink.instance();
        if !instance.status.is_running() || self.fired_episode == Some(instance.episode) {
            return;
        }

        let reference = [instance.last_activity_at, self.last_seen, Some(self.started_at)]
            .into_iter()
            .flatten()
            .max()
            .unwrap_or(self.started_at);
        let idle_for = (now - reference).to_std().unwrap_or(Duration::ZERO);

        if self.in_grace(now) {
            debug!(?idle_for, "within observability grace window");
            return;
        }

        if idle_for >= self.config.timeout {
            info!(
                episode = instance.episode,
                last_activity_at = %reference,
                ?idle_for,
                "idle timeout detected"
            );
            self.fired_episode = Some(instance.episode);
            self.sink.idle_timeout(instance.episode, reference).await;
            return;
        }

        if let Some(warning) = self.config.warning
            && instance.status == LifecycleStatus::Active
            && self.warned_episode != Some(instance.episode)
            && idle_for + warning >= self.config.timeout
        {
            let timeout = chrono::Duration::from_std(self.config.timeout).unwrap_or(chrono::Duration::zero());
            let shelve_at = reference + timeout;
            debug!(episode = instance.episode, %shelve_at, "idle warning");
            self.warned_episode = Some(instance.episode);
            self.sink.idle_warning(instance.episode, shelve_at).await;
        }
    }

    /// Poll every `poll_interval` until shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            path = %self.tailer.path().display(),
            upstream = %self.config.upstream_label,
            timeout_secs = self.config.timeout.as_secs(),
            "idle watcher started"
        );

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        warn!(error = %e, "access log poll failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("idle watcher shutting down");
                    break;
                }
            }
        }
    }
}
