use thiserror::Error;

/// Errors surfaced by the device-sharing subsystem.
///
/// `Infeasible` and `InvalidRequest` are expected scheduling outcomes and are
/// mapped to an unschedulable status by the filter path; the remaining
/// variants abort the current allocation attempt and leave no partial state.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("no device combination satisfies the request: {reason}")]
    Infeasible { reason: String },
    #[error("invalid device request: {message}")]
    InvalidRequest { message: String },
    #[error("no device pool registered for node {node}")]
    PoolNotFound { node: String },
    #[error("node {node} lock unavailable: {message}")]
    LockUnavailable { node: String, message: String },
    #[error("failed to persist allocation: {message}")]
    PersistenceFailure { message: String },
}
