use thiserror::Error;

/// Stable, string-coded error taxonomy surfaced across the crate boundary.
///
/// Every variant carries a `code()` distinct from any transport-level
/// (JSON-RPC) numeric code, so callers can match on it even after it has
/// crossed a wire.
#[derive(Debug, Error)]
pub enum AthenaeumError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("embedding provider error: {0}")]
    Embedding(String),

    #[error("corrupt entry in {path}: {reason}")]
    StacksCorrupt { path: String, reason: String },

    #[error("storage backend io error: {0}")]
    StacksIo(#[from] std::io::Error),

    #[error("stacks error: {0}")]
    Stacks(String),

    #[error("library error: {0}")]
    Library(String),

    #[error("operation timed out after {0}ms")]
    OperationTimeout(u64),
}

impl AthenaeumError {
    pub fn code(&self) -> &'static str {
        match self {
            AthenaeumError::Config(_) => "CONFIG_ERROR",
            AthenaeumError::Embedding(_) => "EMBEDDING_ERROR",
            AthenaeumError::StacksCorrupt { .. } => "STACKS_CORRUPT",
            AthenaeumError::StacksIo(_) => "STACKS_IO",
            AthenaeumError::Stacks(_) => "STACKS_ERROR",
            AthenaeumError::Library(_) => "LIBRARY_ERROR",
            AthenaeumError::OperationTimeout(_) => "OPERATION_TIMEOUT",
        }
    }
}

pub type Result<T> = std::result::Result<T, AthenaeumError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_is_stable_per_variant() {
        assert_eq!(AthenaeumError::Config("x".into()).code(), "CONFIG_ERROR");
        assert_eq!(
            AthenaeumError::Embedding("x".into()).code(),
            "EMBEDDING_ERROR"
        );
        assert_eq!(
            AthenaeumError::StacksCorrupt {
                path: "p".into(),
                reason: "r".into()
            }
            .code(),
            "STACKS_CORRUPT"
        );
        assert_eq!(AthenaeumError::OperationTimeout(60_000).code(), "OPERATION_TIMEOUT");
    }
}
