//! Core error types for TRELLIS.

/// Core result type
pub type CoreResult<T> = Result<T, CoreError>;

/// Core error type
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    /// Invalid encoding
    #[error("Invalid encoding: {reason}")]
    InvalidEncoding {
        /// What failed to decode
        reason: String,
    },

    /// Validation error
    #[error("Validation failed for {field}: {reason}")]
    Validation {
        /// Offending field
        field: String,
        /// Why it failed
        reason: String,
    },

    /// Not found
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Kind of entity
        kind: String,
        /// Entity id
        id: String,
    },

    /// Already exists
    #[error("{kind} already exists: {id}")]
    AlreadyExists {
        /// Kind of entity
        kind: String,
        /// Entity id
        id: String,
    },

    /// Required configuration key has no value in any source
    #[error("Missing required config key: {key}")]
    MissingConfig {
        /// The key
        key: String,
    },

    /// Configuration value exists but has the wrong shape
    #[error("Invalid config value for {key}: {reason}")]
    InvalidConfig {
        /// The key
        key: String,
        /// Decode failure
        reason: String,
    },

    /// A built-in key was read without a node context
    #[error("Built-in key {key} requested outside a node context")]
    BuiltinOutsideNode {
        /// The key
        key: String,
    },

    /// Cycle detected
    #[error("Cycle detected: {}", chain.join(" -> "))]
    CycleDetected {
        /// Names along the cycle
        chain: Vec<String>,
    },

    /// Cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// Internal error (for unexpected errors)
    #[error("Internal error: {message}")]
    Internal {
        /// Error message
        message: String,
    },
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidEncoding {
            reason: err.to_string(),
        }
    }
}

impl From<postcard::Error> for CoreError {
    fn from(err: postcard::Error) -> Self {
        Self::InvalidEncoding {
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::NotFound {
            kind: "Kernel".to_string(),
            id: "sort".to_string(),
        };
        assert_eq!(format!("{}", err), "Kernel not found: sort");
    }

    #[test]
    fn test_cycle_display() {
        let err = CoreError::CycleDetected {
            chain: vec!["a".to_string(), "b".to_string(), "a".to_string()],
        };
        assert_eq!(err.to_string(), "Cycle detected: a -> b -> a");
    }

    #[test]
    fn test_error_equality() {
        let err1 = CoreError::Cancelled;
        let err2 = CoreError::Cancelled;
        assert_eq!(err1, err2);

        let err3 = CoreError::MissingConfig {
            key: "limit".to_string(),
        };
        assert_ne!(err1, err3);
    }

    #[test]
    fn test_from_json_error() {
        let err: CoreError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, CoreError::InvalidEncoding { .. }));
    }
}
