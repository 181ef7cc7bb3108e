//! Error types for the audit trail.

use thiserror::Error;

pub type AuditResult<T> = Result<T, AuditError>;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit log io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize audit event: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("audit outbox error: {0}")]
    Outbox(#[from] shelver_state::StateError),
}
