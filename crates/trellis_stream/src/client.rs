//! Caller side: forks sub-graphs to peers over a [`Connector`].

use crate::message::{Control, StreamMessage};
use crate::transport::{ChannelOutlet, Connector};
use std::sync::Arc;
use tokio::runtime::Handle;
use trellis_runtime::{BorderOutlet, ForkRequest, GraphHandle, SubGraphForker};

/// Sub-graph forker speaking the stream protocol
pub struct StreamForker {
    connector: Arc<dyn Connector>,
    runtime: Handle,
}

impl StreamForker {
    /// Create a forker whose stream readers run on `runtime`
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>, runtime: Handle) -> Self {
        Self { connector, runtime }
    }
}

impl std::fmt::Debug for StreamForker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamForker").finish_non_exhaustive()
    }
}

impl SubGraphForker for StreamForker {
    fn fork(&self, request: ForkRequest) -> Result<Arc<dyn BorderOutlet>, String> {
        let ForkRequest {
            peer,
            task_queue,
            session,
            def,
            graph,
        } = request;
        let channel = self.connector.connect(&peer).map_err(|e| e.to_string())?;
        let sender = channel.sender;
        sender
            .send(StreamMessage::open(session, def, task_queue))
            .map_err(|_| format!("stream to {} closed", peer))?;

        let cancel = sender.clone();
        graph.on_cancel(move |status| {
            tracing::debug!(session = %session, status = status.label(), "Propagating cancel to peer");
            let _ = cancel.send(StreamMessage::control(session, Control::Cancel));
        });

        self.runtime
            .spawn(receive(peer.clone(), channel.receiver, graph));
        tracing::debug!(session = %session, peer = %peer, "Sub-graph forked");
        Ok(Arc::new(ChannelOutlet::new(session, sender)))
    }
}

/// Deliver returned frames until the peer finishes or the local graph does
async fn receive(
    peer: String,
    mut receiver: tokio::sync::mpsc::UnboundedReceiver<StreamMessage>,
    graph: GraphHandle,
) {
    let hub = graph.border();
    loop {
        tokio::select! {
            message = receiver.recv() => {
                let Some(message) = message else {
                    if graph.cancel_from(&peer) {
                        tracing::warn!(graph = %graph.id(), peer = %peer, "Peer closed stream early");
                    }
                    return;
                };
                for frame in message.frames {
                    hub.deliver(frame);
                }
                match message.control {
                    Some(Control::Finished(status)) => {
                        if !status.is_success() && graph.cancel_from(&peer) {
                            tracing::warn!(graph = %graph.id(), peer = %peer, status = %status, "Peer sub-graph failed");
                        }
                        return;
                    }
                    Some(Control::Error(reason)) => {
                        tracing::warn!(graph = %graph.id(), peer = %peer, reason = %reason, "Peer error");
                        graph.cancel_from(&peer);
                        return;
                    }
                    Some(Control::Cancel) | None => {}
                }
            }
            _ = graph.wait() => return,
        }
    }
}
