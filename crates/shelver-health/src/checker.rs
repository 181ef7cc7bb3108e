//! Health check probe logic.
//!
//! Performs a single HTTP GET against the workload's health endpoint.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

/// Result of a single health probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeResult {
    /// The endpoint answered with a status below 400.
    Healthy,
    /// The endpoint answered, but with an error status.
    Unhealthy(u16),
    /// The probe could not be executed (connection error, TLS, timeout).
    Failed(String),
}

impl ProbeResult {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// Short human-readable reason for a non-healthy result.
    pub fn detail(&self) -> Option<String> {
        match self {
            Self::Healthy => None,
            Self::Unhealthy(status) => Some(format!("HTTP {status}")),
            Self::Failed(reason) => Some(reason.clone()),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to build probe client: {0}")]
    Client(#[from] reqwest::Error),
}

/// One readiness check attempt.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self) -> ProbeResult;
}

/// HTTP GET probe.
///
/// Redirects are followed; any final status below 400 counts as healthy.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>, verify_tls: bool, attempt_timeout: Duration) -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .timeout(attempt_timeout)
            .connect_timeout(attempt_timeout)
            .danger_accept_invalid_certs(!verify_tls)
            .user_agent(concat!("shelver-health/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn probe(&self) -> ProbeResult {
        match self.client.get(&self.url).send().await {
            Ok(resp) => {
                let status = resp.status();
                if status.as_u16() < 400 {
                    ProbeResult::Healthy
                } else {
                    debug!(%status, url = %self.url, "health probe returned error status");
                    ProbeResult::Unhealthy(status.as_u16())
                }
            }
            Err(e) => {
                debug!(error = %e, url = %self.url, "health probe request failed");
                let reason = if e.is_timeout() {
                    "timed out".to_string()
                } else if e.is_connect() {
                    format!("connection failed: {e}")
                } else {
                    e.to_string()
                };
                ProbeResult::Failed(reason)
            }
        }
    }
}
