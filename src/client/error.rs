//! Client-side error types
//!
//! None of these reach a caller of the coordinator: verification failures
//! become `loading` in the resolver, everything else becomes `loading` at the
//! coordinator boundary.

/// Failure of the remote verification call
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VerifyCallError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Verification server returned status {0}")]
    Status(u16),

    #[error("Invalid verification response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for VerifyCallError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            Self::Status(status.as_u16())
        } else {
            Self::Network(err.to_string())
        }
    }
}

/// Failure of the device billing restore query
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RestoreError {
    #[error("Billing layer unavailable: {0}")]
    Unavailable(String),

    #[error("Restore failed: {0}")]
    Failed(String),
}

/// Failure of the local key/value store
#[derive(Debug, thiserror::Error)]
pub enum LocalStoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Anything that can abort a resolution
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Verify(#[from] VerifyCallError),

    #[error(transparent)]
    Restore(#[from] RestoreError),

    #[error(transparent)]
    LocalStore(#[from] LocalStoreError),
}
