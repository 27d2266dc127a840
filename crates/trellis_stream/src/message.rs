//! Wire messages.
//!
//! Every message carries the session it belongs to and the task queue the
//! sub-graph should run on. The first message of a stream also carries the
//! sub-graph definition; later ones carry border frames and control.

use crate::error::TransportError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use trellis_core::{BorderFrame, GraphDef, GraphStatus, SessionId};

/// Control signal riding on a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Control {
    /// Cancel the sub-graph
    Cancel,
    /// Sub-graph reached a terminal state
    Finished(GraphStatus),
    /// Stream failed before or while running
    Error(String),
}

/// One message on a stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMessage {
    /// Sub-graph definition; first message only
    pub graph: Option<GraphDef>,
    /// Session the stream serves
    pub session: SessionId,
    /// Border frames, in port order
    pub frames: Vec<BorderFrame>,
    /// Task queue requested for the sub-graph
    pub task_queue: String,
    /// Control signal
    pub control: Option<Control>,
}

impl StreamMessage {
    /// First message of a stream
    #[must_use]
    pub fn open(session: SessionId, graph: GraphDef, task_queue: impl Into<String>) -> Self {
        Self {
            graph: Some(graph),
            session,
            frames: Vec::new(),
            task_queue: task_queue.into(),
            control: None,
        }
    }

    /// Border frames
    #[must_use]
    pub fn frames(session: SessionId, frames: Vec<BorderFrame>) -> Self {
        Self {
            graph: None,
            session,
            frames,
            task_queue: String::new(),
            control: None,
        }
    }

    /// Control only
    #[must_use]
    pub fn control(session: SessionId, control: Control) -> Self {
        Self {
            graph: None,
            session,
            frames: Vec::new(),
            task_queue: String::new(),
            control: Some(control),
        }
    }

    /// Encode with postcard
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn encode(&self) -> Result<Bytes, TransportError> {
        postcard::to_allocvec(self)
            .map(Bytes::from)
            .map_err(|e| TransportError::Serialization(e.to_string()))
    }

    /// Decode a message produced by [`StreamMessage::encode`]
    ///
    /// # Errors
    ///
    /// Returns error if the bytes are not a message
    pub fn decode(bytes: &[u8]) -> Result<Self, TransportError> {
        postcard::from_bytes(bytes).map_err(|e| TransportError::Serialization(e.to_string()))
    }
}
