//! Server side of one stream.
//!
//! ```text
//! Idle --graph--> GraphReceived --started--> Running --outcome--> Finished
//!   |                   |                       |
//!   +-- peer gone ------+---- cancel -----------+--------------> Cancelled
//!   +-- duplicate graph, start failure ------------------------> PeerError
//! ```
//!
//! A stream holds its creator slot until the sub-graph it started reached a
//! terminal state, so stopping the server waits for cancelled sub-graphs to
//! unwind.

use crate::creator::StreamGuard;
use crate::error::StreamError;
use crate::message::{Control, StreamMessage};
use crate::transport::ChannelOutlet;
use std::sync::Arc;
use tokio::sync::mpsc;
use trellis_core::{BorderFrame, GraphDef, GraphStatus, SessionId};
use trellis_runtime::{Engine, GraphHandle, RunOptions, ScheduleItem};

/// Stream lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Waiting for the graph definition
    Idle,
    /// Definition received, sub-graph starting
    GraphReceived,
    /// Sub-graph running
    Running,
    /// Sub-graph finished and its status was sent
    Finished,
    /// Cancelled by the peer or by the peer going away
    Cancelled,
    /// Protocol violation or start failure
    PeerError,
}

impl StreamState {
    /// Whether no further transitions happen
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Cancelled | Self::PeerError)
    }
}

pub(crate) enum Event {
    Started(Result<GraphHandle, String>),
    Finished(GraphStatus),
}

pub(crate) struct ServerStream {
    state: StreamState,
    session: SessionId,
    engine: Arc<Engine>,
    async_mode: bool,
    outbound: mpsc::UnboundedSender<StreamMessage>,
    events: mpsc::UnboundedSender<Event>,
    handle: Option<GraphHandle>,
    held: Vec<BorderFrame>,
    starting: bool,
    graph_done: bool,
    cancel_requested: bool,
}

impl ServerStream {
    pub(crate) fn new(
        engine: Arc<Engine>,
        async_mode: bool,
        outbound: mpsc::UnboundedSender<StreamMessage>,
        events: mpsc::UnboundedSender<Event>,
    ) -> Self {
        Self {
            state: StreamState::Idle,
            session: SessionId::default(),
            engine,
            async_mode,
            outbound,
            events,
            handle: None,
            held: Vec::new(),
            starting: false,
            graph_done: false,
            cancel_requested: false,
        }
    }

    pub(crate) const fn state(&self) -> StreamState {
        self.state
    }

    /// Terminal and nothing left running
    pub(crate) fn is_done(&self) -> bool {
        self.state.is_terminal() && !self.starting && (self.handle.is_none() || self.graph_done)
    }

    fn reply(&self, control: Control) {
        if self
            .outbound
            .send(StreamMessage::control(self.session, control))
            .is_err()
        {
            tracing::debug!(session = %self.session, "Peer gone before reply");
        }
    }

    fn fail(&mut self, reason: String) {
        tracing::warn!(session = %self.session, reason = %reason, "Stream peer error");
        self.state = StreamState::PeerError;
        self.reply(Control::Error(reason));
        if let Some(handle) = &self.handle {
            handle.cancel_from("peer");
        }
    }

    /// Handle one arriving message
    ///
    /// # Errors
    ///
    /// Returns error if the message breaks the protocol
    pub(crate) fn notify_receive(&mut self, message: StreamMessage) -> Result<(), StreamError> {
        if self.state.is_terminal() {
            tracing::debug!(session = %message.session, state = ?self.state, "Message after stream end");
            return Ok(());
        }

        if let Some(def) = message.graph {
            if self.state != StreamState::Idle {
                self.fail("graph already received".to_string());
                return Err(StreamError::DuplicateGraph {
                    session: self.session.to_string(),
                });
            }
            self.session = message.session;
            self.state = StreamState::GraphReceived;
            tracing::debug!(
                session = %self.session,
                nodes = def.nodes.len(),
                queue = %message.task_queue,
                "Sub-graph received"
            );
            self.start(def, &message.task_queue);
        }

        for frame in message.frames {
            match &self.handle {
                Some(handle) => handle.border().deliver(frame),
                None => self.held.push(frame),
            }
        }

        if message.control == Some(Control::Cancel) {
            self.cancel();
        }
        Ok(())
    }

    fn start(&mut self, def: GraphDef, task_queue: &str) {
        let options = RunOptions::default()
            .with_session(self.session)
            .with_task_queue(task_queue)
            .with_default_outlet(Arc::new(ChannelOutlet::new(
                self.session,
                self.outbound.clone(),
            )));

        if !self.async_mode {
            let started = self.engine.run_graph(def, options).map_err(|e| e.to_string());
            self.on_started(started);
            return;
        }

        self.starting = true;
        let engine = Arc::clone(&self.engine);
        let events = self.events.clone();
        let rejected = self.events.clone();
        let queue = self.engine.queue(task_queue);
        let item = ScheduleItem::new(
            move || {
                let started = engine.run_graph(def, options).map_err(|e| e.to_string());
                let _ = events.send(Event::Started(started));
            },
            move || {
                let _ = rejected.send(Event::Started(Err("task queue rejected the sub-graph".to_string())));
            },
        );
        if let Err(e) = queue.push(item) {
            tracing::debug!(session = %self.session, queue = %queue.name(), error = %e, "Sub-graph not admitted");
        }
    }

    pub(crate) fn on_event(&mut self, event: Event) {
        match event {
            Event::Started(started) => self.on_started(started),
            Event::Finished(status) => self.on_finished(status),
        }
    }

    fn on_started(&mut self, started: Result<GraphHandle, String>) {
        self.starting = false;
        let handle = match started {
            Ok(handle) => handle,
            Err(reason) => {
                if !self.state.is_terminal() {
                    self.fail(reason);
                }
                return;
            }
        };

        for frame in self.held.drain(..) {
            handle.border().deliver(frame);
        }
        let waiter = handle.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let outcome = waiter.wait().await;
            let _ = events.send(Event::Finished(outcome.status));
        });

        if self.state.is_terminal() || self.cancel_requested {
            handle.cancel_from("peer");
        } else {
            self.state = StreamState::Running;
            tracing::info!(session = %self.session, graph = %handle.id(), "Sub-graph running");
        }
        self.handle = Some(handle);
    }

    fn on_finished(&mut self, status: GraphStatus) {
        self.graph_done = true;
        if self.state == StreamState::PeerError {
            return;
        }
        self.state = if self.cancel_requested {
            StreamState::Cancelled
        } else {
            StreamState::Finished
        };
        tracing::info!(session = %self.session, status = status.label(), "Sub-graph finished");
        self.reply(Control::Finished(status));
    }

    /// Cancel on the peer's behalf
    pub(crate) fn cancel(&mut self) {
        if self.cancel_requested {
            return;
        }
        self.cancel_requested = true;
        match &self.handle {
            Some(handle) => {
                handle.cancel_from("peer");
            }
            None if !self.starting => self.state = StreamState::Cancelled,
            None => {}
        }
    }

    /// Inbound side closed
    pub(crate) fn peer_gone(&mut self) {
        tracing::debug!(session = %self.session, state = ?self.state, "Peer closed stream");
        if !self.state.is_terminal() {
            self.cancel();
        }
    }

    /// Process messages and sub-graph events until the stream is done
    pub(crate) async fn run(
        mut self,
        mut inbound: mpsc::UnboundedReceiver<StreamMessage>,
        mut events: mpsc::UnboundedReceiver<Event>,
        guard: StreamGuard,
    ) {
        let mut inbound_open = true;
        while !self.is_done() {
            tokio::select! {
                message = inbound.recv(), if inbound_open => match message {
                    Some(message) => {
                        if let Err(e) = self.notify_receive(message) {
                            tracing::warn!(session = %self.session, error = %e, "Stream protocol error");
                        }
                    }
                    None => {
                        inbound_open = false;
                        self.peer_gone();
                    }
                },
                event = events.recv() => match event {
                    Some(event) => self.on_event(event),
                    None => break,
                },
            }
        }
        tracing::debug!(session = %self.session, state = ?self.state, "Stream closed");
        drop(guard);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use trellis_core::NodeDef;
    use trellis_runtime::EngineConfig;

    fn stream() -> (
        ServerStream,
        mpsc::UnboundedReceiver<StreamMessage>,
        mpsc::UnboundedReceiver<Event>,
    ) {
        let engine = Engine::new(EngineConfig::default()).unwrap();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();
        (ServerStream::new(engine, false, out_tx, ev_tx), out_rx, ev_rx)
    }

    fn graph() -> GraphDef {
        GraphDef::new()
            .with_node(NodeDef::new("a", "source").with_config(json!({ "values": [1] })))
            .with_node(NodeDef::new("b", "collect"))
            .with_edge("a", "out", "b", "in")
    }

    #[tokio::test]
    async fn test_graph_then_finish() {
        let (mut stream, mut out, mut events) = stream();
        let session = SessionId::new(5, 1);
        stream
            .notify_receive(StreamMessage::open(session, graph(), ""))
            .unwrap();
        assert_eq!(stream.state(), StreamState::Running);

        let event = events.recv().await.unwrap();
        stream.on_event(event);
        assert_eq!(stream.state(), StreamState::Finished);
        assert!(stream.is_done());

        let reply = out.recv().await.unwrap();
        assert_eq!(reply.session, session);
        assert_eq!(reply.control, Some(Control::Finished(GraphStatus::Success)));
    }

    #[tokio::test]
    async fn test_duplicate_graph_is_peer_error() {
        let (mut stream, mut out, _events) = stream();
        let session = SessionId::new(5, 2);
        stream
            .notify_receive(StreamMessage::open(session, graph(), ""))
            .unwrap();
        let err = stream
            .notify_receive(StreamMessage::open(session, graph(), ""))
            .unwrap_err();
        assert!(matches!(err, StreamError::DuplicateGraph { .. }));
        assert_eq!(stream.state(), StreamState::PeerError);

        let reply = out.recv().await.unwrap();
        assert!(matches!(reply.control, Some(Control::Error(_))));
    }

    #[tokio::test]
    async fn test_cancel_while_idle() {
        let (mut stream, _out, _events) = stream();
        stream
            .notify_receive(StreamMessage::control(SessionId::new(5, 3), Control::Cancel))
            .unwrap();
        assert_eq!(stream.state(), StreamState::Cancelled);
        assert!(stream.is_done());
    }

    #[tokio::test]
    async fn test_bad_graph_is_peer_error() {
        let (mut stream, mut out, _events) = stream();
        let def = GraphDef::new().with_node(NodeDef::new("a", "no_such_kernel"));
        stream
            .notify_receive(StreamMessage::open(SessionId::new(5, 4), def, ""))
            .unwrap();
        assert_eq!(stream.state(), StreamState::PeerError);
        assert!(stream.is_done());
        let reply = out.recv().await.unwrap();
        assert!(matches!(reply.control, Some(Control::Error(ref m)) if m.contains("no_such_kernel")));
    }
}
