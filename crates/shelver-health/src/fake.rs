//! Scripted probe used by tests across the workspace.

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;

use crate::checker::{Probe, ProbeResult};

/// Reports `HTTP 503` for a number of attempts, then healthy.
#[derive(Debug)]
pub struct ScriptedProbe {
    failures_before_ready: Option<u32>,
    hang: bool,
    attempts: AtomicU32,
}

impl ScriptedProbe {
    pub fn ready_after(failures: u32) -> Self {
        Self {
            failures_before_ready: Some(failures),
            hang: false,
            attempts: AtomicU32::new(0),
        }
    }

    pub fn never_ready() -> Self {
        Self {
            failures_before_ready: None,
            hang: false,
            attempts: AtomicU32::new(0),
        }
    }

    /// Every attempt blocks forever.
    pub fn hanging() -> Self {
        Self {
            failures_before_ready: None,
            hang: true,
            attempts: AtomicU32::new(0),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Probe for ScriptedProbe {
    async fn probe(&self) -> ProbeResult {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if self.hang {
            std::future::pending::<()>().await;
        }
        match self.failures_before_ready {
            Some(failures) if attempt > failures => ProbeResult::Healthy,
            _ => ProbeResult::Unhealthy(503),
        }
    }
}
