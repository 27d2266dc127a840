//! Runtime error types.

use trellis_core::CoreError;
use trellis_resource::ResourceError;

/// Error raised by a kernel during config, init or compute
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KernelError {
    /// Configuration lookup failed
    #[error("Config error: {0}")]
    Config(#[from] CoreError),

    /// Resource lookup failed
    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),

    /// Resource not declared in `define`
    #[error("Resource {name} was not declared")]
    UndeclaredResource {
        /// Resource name
        name: String,
    },

    /// Port index out of range
    #[error("Port {port} out of range")]
    PortOutOfRange {
        /// Port index
        port: usize,
    },

    /// Async pipe not declared in `define`
    #[error("Async pipe {index} was not declared")]
    PipeNotDeclared {
        /// Pipe index
        index: usize,
    },

    /// The graph already returned its arena
    #[error("Graph arena already released")]
    PoolReleased,

    /// Item on a port had an unexpected type
    #[error("Unexpected data type on port {port}, expected {expected}")]
    UnexpectedType {
        /// Port index
        port: usize,
        /// Expected type id
        expected: String,
    },

    /// Border data could not be encoded or decoded
    #[error("Codec error: {0}")]
    Codec(String),

    /// Border send or receive failed
    #[error("Border error: {0}")]
    Border(String),

    /// Kernel-specific failure
    #[error("{0}")]
    Failed(String),
}

/// Async pipe error
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PipeError {
    /// Pipe saw EOF or was terminated
    #[error("Pipe closed")]
    Closed,
    /// Pipe holds `capacity` pending items
    #[error("Pipe full ({capacity} items)")]
    Full {
        /// Configured capacity
        capacity: usize,
    },
}

/// Task queue error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskQueueError {
    /// The wait queue is at `queue_max`
    #[error("Task queue {queue} full ({queue_max} waiting)")]
    QueueFull {
        /// Queue name
        queue: String,
        /// Configured maximum
        queue_max: usize,
    },

    /// The queue was stopped
    #[error("Task queue {queue} stopped")]
    Stopped {
        /// Queue name
        queue: String,
    },

    /// Invalid configuration
    #[error("Invalid task queue config for {queue}: {reason}")]
    InvalidConfig {
        /// Queue name
        queue: String,
        /// Reason
        reason: String,
    },

    /// Worker thread could not be spawned
    #[error("Failed to spawn worker for {queue}: {reason}")]
    Spawn {
        /// Queue name
        queue: String,
        /// OS error
        reason: String,
    },
}

/// Error building or launching a graph
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    /// Definition failed validation
    #[error("Invalid graph definition: {0}")]
    Definition(#[from] CoreError),

    /// Kernel name not registered
    #[error("Node {node} uses unknown kernel {kernel}")]
    UnknownKernel {
        /// Node name
        node: String,
        /// Kernel name
        kernel: String,
    },

    /// Edge references an undeclared port
    #[error("Node {node} has no port {port}")]
    UnknownPort {
        /// Node name
        node: String,
        /// Port name
        port: String,
    },

    /// Edge connects incompatible port types
    #[error("Edge {from} -> {to} connects {from_type} to {to_type}")]
    PortTypeMismatch {
        /// Producing port
        from: String,
        /// Consuming port
        to: String,
        /// Producing type id
        from_type: String,
        /// Consuming type id
        to_type: String,
    },

    /// `Kernel::config` failed
    #[error("Config of node {node} failed: {source}")]
    KernelConfig {
        /// Node name
        node: String,
        /// Kernel error
        source: KernelError,
    },

    /// `Kernel::init` failed
    #[error("Init of node {node} failed: {source}")]
    KernelInit {
        /// Node name
        node: String,
        /// Kernel error
        source: KernelError,
    },

    /// A declared resource could not be built
    #[error("Node {node} resource failure: {source}")]
    Resource {
        /// Node name
        node: String,
        /// Resource error
        source: ResourceError,
    },

    /// Remote domain used without a forker
    #[error("No sub-graph forker configured for peer {peer}")]
    NoForker {
        /// Peer name
        peer: String,
    },

    /// Definition shape the runtime does not run
    #[error("Unsupported graph: {reason}")]
    Unsupported {
        /// Reason
        reason: String,
    },

    /// Snapshot construction failed
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] ResourceError),

    /// Task queue setup failed
    #[error("Task queue error: {0}")]
    Queue(#[from] TaskQueueError),

    /// Timer service unavailable
    #[error("Timer error: {reason}")]
    Timer {
        /// Reason
        reason: String,
    },
}

/// Result alias for graph operations
pub type GraphResult<T> = Result<T, GraphError>;
