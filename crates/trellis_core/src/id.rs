//! Identifiers for TRELLIS entities.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Graph identifier - identifies a single graph execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GraphId(Uuid);

impl GraphId {
    /// Create a new random GraphId
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from UUID bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Get as UUID
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for GraphId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for GraphId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "graph_{}", self.0)
    }
}

/// Node identifier - index of a node inside its graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(u32);

impl NodeId {
    /// Create from an index
    #[must_use]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Index into the graph's node table
    #[must_use]
    pub const fn index(&self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node_{}", self.0)
    }
}

/// Session identifier carried by every stream message.
///
/// The instance id names the issuing process, the query id is unique
/// within that process.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct SessionId {
    /// Issuing process
    pub instance_id: u64,
    /// Query within the process
    pub query_id: u64,
}

impl SessionId {
    /// Create a session id
    #[must_use]
    pub const fn new(instance_id: u64, query_id: u64) -> Self {
        Self {
            instance_id,
            query_id,
        }
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session_{}_{}", self.instance_id, self.query_id)
    }
}
