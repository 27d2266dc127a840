//! TRELLIS Core Types
//!
//! Pure types shared by every layer of the graph execution runtime:
//! identifiers, the serializable graph definition, terminal graph statuses,
//! border frames and the kernel configuration resolution chain.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod frame;
pub mod graph_def;
pub mod id;
pub mod status;

// Re-exports
pub use config::{BuiltinKeys, ConfigContext};
pub use error::{CoreError, CoreResult};
pub use frame::BorderFrame;
pub use graph_def::{Domain, EdgeDef, ErrorStrategy, GraphDef, NodeDef, PortAddr};
pub use id::{GraphId, NodeId, SessionId};
pub use status::GraphStatus;
