//! TRELLIS Streaming
//!
//! Runs parts of a graph on other processes. The caller side forks each
//! remote part over a persistent stream and relays border frames both
//! ways; the server side instantiates the received sub-graph on its own
//! engine and streams frames and the final status back.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod creator;
pub mod error;
pub mod message;
pub mod server;
pub mod stream;
pub mod transport;

pub use client::StreamForker;
pub use creator::{StreamCreator, StreamGuard};
pub use error::{StreamError, StreamResult, TransportError};
pub use message::{Control, StreamMessage};
pub use server::{StreamServer, StreamServerConfig};
pub use stream::StreamState;
pub use transport::{
    Channel, ChannelOutlet, Connector, LocalConnector, TcpConnector, pump, serve_tcp,
};
