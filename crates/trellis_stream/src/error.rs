//! Error types for the streaming layer.

use trellis_runtime::GraphError;

/// Transport errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Peer name not known to the connector
    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connect timed out
    #[error("Connect timeout after {0}ms")]
    Timeout(u64),

    /// Peer refused the stream
    #[error("Stream refused: {0}")]
    Refused(String),

    /// Channel or socket closed
    #[error("Stream closed")]
    Closed,

    /// Message could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Streaming errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// Transport failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Sub-graph could not be started
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// A second graph definition arrived on a stream that already has one
    #[error("Stream for {session} already received a graph")]
    DuplicateGraph {
        /// Session of the stream
        session: String,
    },

    /// The peer reported an error
    #[error("Peer error: {0}")]
    Peer(String),

    /// Server no longer accepts streams
    #[error("Stream server stopped")]
    Stopped,

    /// No tokio runtime to run stream tasks on
    #[error("No tokio runtime: {0}")]
    NoRuntime(String),
}

/// Result alias for streaming operations
pub type StreamResult<T> = Result<T, StreamError>;
