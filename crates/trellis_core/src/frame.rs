//! Border frames: data crossing between a local graph and a forked sub-graph.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// One unit of border data.
///
/// Frames on the same port keep their send order; frames on different
/// ports are independent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BorderFrame {
    /// Border port key, shared by both sides of the fork
    pub port: String,
    /// Encoded payload (empty on a bare end-of-stream frame)
    pub payload: Bytes,
    /// No more frames follow on this port
    pub eof: bool,
}

impl BorderFrame {
    /// Create a data frame
    #[must_use]
    pub fn data(port: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            port: port.into(),
            payload: payload.into(),
            eof: false,
        }
    }

    /// Create an end-of-stream frame
    #[must_use]
    pub fn eof(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            payload: Bytes::new(),
            eof: true,
        }
    }

    /// Build the canonical port key for an edge cut by a fork
    #[must_use]
    pub fn port_key(from_node: &str, from_port: &str, to_node: &str, to_port: &str) -> String {
        format!("{}:{}->{}:{}", from_node, from_port, to_node, to_port)
    }
}
