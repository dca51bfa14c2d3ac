use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache I/O failed on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode batch {sequence_id}: {source}")]
    Encode {
        sequence_id: u64,
        #[source]
        source: serde_json::Error,
    },
    #[error("batch {0} is not in the cache")]
    NotFound(u64),
    #[error("cache task stopped: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl CacheError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| CacheError::Io { path, source }
    }
}

/// Why a batch was not delivered.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ForwardError {
    /// Worth retrying later: the endpoint is unreachable or overloaded.
    #[error("transient delivery failure: {0}")]
    Transient(String),
    /// The endpoint will never accept this payload.
    #[error("batch rejected: {0}")]
    Permanent(String),
    /// Treated like [`ForwardError::Transient`].
    #[error("unexpected delivery failure: {0}")]
    Unknown(String),
}

impl ForwardError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, ForwardError::Permanent(_))
    }
}
