//! Gateway errors and the bounded-call helper.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("{operation} failed: {message}")]
    Failed {
        operation: &'static str,
        message: String,
    },
}

impl GatewayError {
    pub fn failed(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Failed {
            operation,
            message: message.into(),
        }
    }
}

/// Run a gateway call with a hard deadline.
pub async fn with_timeout<T, F>(operation: &'static str, limit: Duration, fut: F) -> GatewayResult<T>
where
    F: Future<Output = GatewayResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(GatewayError::Timeout {
            operation,
            after: limit,
        }),
    }
}
