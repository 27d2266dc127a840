//! Terminal graph statuses.

use serde::{Deserialize, Serialize};

/// Terminal state of a graph execution.
///
/// Every non-success variant names where the failure originated, so a
/// caller can tell a misbehaving kernel apart from a deadline or an
/// overloaded queue without parsing log lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GraphStatus {
    /// Every node finished
    Success,
    /// A kernel reported an error
    KernelError {
        /// Node that failed
        node: String,
        /// Error message
        message: String,
    },
    /// The graph deadline elapsed
    Timeout,
    /// The graph was cancelled by its caller or its peer
    Cancelled {
        /// Who cancelled
        origin: String,
    },
    /// A node could not be admitted to its task queue
    AdmissionRejected {
        /// Node that was dropped
        node: String,
    },
}

impl GraphStatus {
    /// Whether the graph completed without any failure
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Short label for logs and counters
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::KernelError { .. } => "kernel_error",
            Self::Timeout => "timeout",
            Self::Cancelled { .. } => "cancelled",
            Self::AdmissionRejected { .. } => "admission_rejected",
        }
    }
}

impl std::fmt::Display for GraphStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::KernelError { node, message } => {
                write!(f, "kernel error in {}: {}", node, message)
            }
            Self::Timeout => write!(f, "timeout"),
            Self::Cancelled { origin } => write!(f, "cancelled by {}", origin),
            Self::AdmissionRejected { node } => write!(f, "admission rejected for {}", node),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_labels() {
        assert_eq!(GraphStatus::Success.label(), "success");
        assert_eq!(GraphStatus::Timeout.label(), "timeout");
        assert!(GraphStatus::Success.is_success());
        assert!(!GraphStatus::Timeout.is_success());
    }

    #[test]
    fn test_status_display_names_origin() {
        let status = GraphStatus::KernelError {
            node: "scan".to_string(),
            message: "disk gone".to_string(),
        };
        assert_eq!(status.to_string(), "kernel error in scan: disk gone");
    }

    #[test]
    fn test_status_postcard() {
        let status = GraphStatus::Cancelled {
            origin: "peer".to_string(),
        };
        let bytes = postcard::to_allocvec(&status).unwrap();
        let back: GraphStatus = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(back, status);
    }
}
