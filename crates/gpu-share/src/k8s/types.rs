use thiserror::Error;

/// Errors from the Kubernetes boundary: annotation patches and reads.
#[derive(Debug, Error)]
pub enum KubernetesError {
    #[error("Failed to connect to Kubernetes API: {message}")]
    ConnectionFailed { message: String },
    #[error("Failed to patch annotations: {message}")]
    PatchFailed { message: String },
    #[error("Failed to read object: {message}")]
    ReadFailed { message: String },
    #[error("Kubernetes API call exceeded {timeout_secs}s")]
    Timeout { timeout_secs: u64 },
}
