//! Splitting a graph across domains and forking the remote parts.
//!
//! Every edge that crosses a domain boundary is cut and replaced by a
//! `border_send` node on the producing side and a `border_recv` node on the
//! consuming side, both keyed by the same port key. The caller keeps the
//! local part; each remote peer gets the nodes placed on it as a standalone
//! definition whose senders reply through their default outlet.

use crate::border::BorderOutlet;
use crate::error::{GraphError, GraphResult};
use crate::graph::GraphHandle;
use crate::kernels::{BORDER_RECV, BORDER_SEND, PEER_KEY, PORT_KEY};
use indexmap::IndexMap;
use serde_json::Value;
use std::sync::Arc;
use trellis_core::{BorderFrame, Domain, GraphDef, NodeDef, SessionId};

/// The part of a graph placed on one peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubGraph {
    /// Peer the nodes run on
    pub peer: String,
    /// Task queue requested on the peer
    pub task_queue: String,
    /// Standalone definition for the peer, all nodes local to it
    pub def: GraphDef,
}

/// Result of [`split`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitGraph {
    /// Nodes that stay local, plus border nodes
    pub local: GraphDef,
    /// One entry per remote peer, in first-appearance order
    pub remotes: Vec<SubGraph>,
}

/// Everything a forker needs to start a sub-graph
#[derive(Debug, Clone)]
pub struct ForkRequest {
    /// Peer to run on
    pub peer: String,
    /// Task queue requested on the peer
    pub task_queue: String,
    /// Session of the calling graph
    pub session: SessionId,
    /// Sub-graph definition
    pub def: GraphDef,
    /// The calling graph; frames coming back go into its border hub
    pub graph: GraphHandle,
}

/// Starts sub-graphs on remote peers
pub trait SubGraphForker: Send + Sync {
    /// Start `request.def` on `request.peer` and return the outlet that
    /// carries frames to it. The forker also propagates cancellation of
    /// `request.graph` to the peer.
    ///
    /// # Errors
    ///
    /// Returns error if the peer cannot be reached
    fn fork(&self, request: ForkRequest) -> Result<Arc<dyn BorderOutlet>, String>;
}

fn sender(key: &str, peer: &str) -> NodeDef {
    NodeDef::new(format!("{}#send", key), BORDER_SEND)
        .with_attr(PORT_KEY, Value::from(key))
        .with_attr(PEER_KEY, Value::from(peer))
}

fn receiver(key: &str) -> NodeDef {
    NodeDef::new(format!("{}#recv", key), BORDER_RECV).with_attr(PORT_KEY, Value::from(key))
}

fn child_def(def: &GraphDef) -> GraphDef {
    GraphDef {
        nodes: Vec::new(),
        edges: Vec::new(),
        timeout_ms: def.timeout_ms,
        error_strategy: def.error_strategy,
        config: def.config.clone(),
    }
}

/// Split `def` into its local part and one part per remote peer
///
/// # Errors
///
/// Returns error if the definition is invalid or an edge joins two
/// different remote peers
pub fn split(def: &GraphDef) -> GraphResult<SplitGraph> {
    def.validate()?;
    let domains: IndexMap<&str, &Domain> =
        def.nodes.iter().map(|n| (n.name.as_str(), &n.domain)).collect();

    let mut local = child_def(def);
    let mut remotes: IndexMap<String, SubGraph> = IndexMap::new();
    for node in &def.nodes {
        match &node.domain {
            Domain::Local => local.nodes.push(node.clone()),
            Domain::Remote { peer, task_queue } => {
                let group = remotes.entry(peer.clone()).or_insert_with(|| SubGraph {
                    peer: peer.clone(),
                    task_queue: task_queue.clone(),
                    def: child_def(def),
                });
                let mut placed = node.clone();
                placed.domain = Domain::Local;
                group.def.nodes.push(placed);
            }
        }
    }

    for edge in &def.edges {
        let (Some(from), Some(to)) = (
            domains.get(edge.from.node.as_str()),
            domains.get(edge.to.node.as_str()),
        ) else {
            continue;
        };
        if from == to {
            let target = match from {
                Domain::Local => &mut local,
                Domain::Remote { peer, .. } => match remotes.get_mut(peer) {
                    Some(group) => &mut group.def,
                    None => continue,
                },
            };
            target.edges.push(edge.clone());
            continue;
        }

        let key = BorderFrame::port_key(&edge.from.node, &edge.from.port, &edge.to.node, &edge.to.port);
        match (from, to) {
            (Domain::Local, Domain::Remote { peer, .. }) => {
                let send = sender(&key, peer);
                local.edges.push(border_edge(&edge.from.node, &edge.from.port, &send.name, "in"));
                local.nodes.push(send);
                if let Some(group) = remotes.get_mut(peer) {
                    let recv = receiver(&key);
                    group.def.edges.push(border_edge(&recv.name, "out", &edge.to.node, &edge.to.port));
                    group.def.nodes.push(recv);
                }
            }
            (Domain::Remote { peer, .. }, Domain::Local) => {
                if let Some(group) = remotes.get_mut(peer) {
                    let send = sender(&key, "");
                    group.def.edges.push(border_edge(&edge.from.node, &edge.from.port, &send.name, "in"));
                    group.def.nodes.push(send);
                }
                let recv = receiver(&key);
                local.edges.push(border_edge(&recv.name, "out", &edge.to.node, &edge.to.port));
                local.nodes.push(recv);
            }
            _ => {
                return Err(GraphError::Unsupported {
                    reason: format!(
                        "edge {}:{} -> {}:{} joins two remote peers",
                        edge.from.node, edge.from.port, edge.to.node, edge.to.port
                    ),
                });
            }
        }
    }

    Ok(SplitGraph {
        local,
        remotes: remotes.into_values().collect(),
    })
}

fn border_edge(from_node: &str, from_port: &str, to_node: &str, to_port: &str) -> trellis_core::EdgeDef {
    trellis_core::EdgeDef {
        from: trellis_core::PortAddr::new(from_node, from_port),
        to: trellis_core::PortAddr::new(to_node, to_port),
    }
}
