use thiserror::Error;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Journal backend unavailable: {0}")]
    Unavailable(String),

    #[error("Entity kind '{0}' is not registered")]
    UnknownEntityKind(String),

    #[error("Orchestration '{0}' is not registered")]
    UnknownOrchestration(String),

    #[error("Orchestration instance '{0}' not found")]
    InstanceNotFound(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Backpressure: {0}")]
    Backpressure(String),

    #[error("Runtime is shut down")]
    Closed,

    #[error("Corrupted journal: {0}")]
    Corrupted(String),

    #[error("Execution error: {0}")]
    Execution(String),
}

impl RuntimeError {
    /// Infrastructure failures that a retry may cure.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Unavailable(_) | Self::Backpressure(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

impl From<std::io::Error> for RuntimeError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for RuntimeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_and_unavailable_are_transient() {
        assert!(RuntimeError::Io("disk".into()).is_transient());
        assert!(RuntimeError::Unavailable("down".into()).is_transient());
        assert!(!RuntimeError::Corrupted("bad".into()).is_transient());
        assert!(!RuntimeError::Closed.is_transient());
    }
}
