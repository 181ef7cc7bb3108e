use thiserror::Error;

use shelver_audit::AuditError;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("lifecycle state machine is not running")]
    Closed,

    /// The request's audit event could not be recorded, so nothing was done.
    #[error("request refused, audit log unavailable: {0}")]
    Audit(#[from] AuditError),
}
