//! Serializable graph definitions.
//!
//! A `GraphDef` is what a request compiles into and what travels, in part,
//! to a remote peer on the first frame of a stream. It names kernels and
//! wires their ports; the runtime turns it into live nodes.

use crate::error::{CoreError, CoreResult};
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};

/// Where a node executes
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Domain {
    /// The local worker pool
    #[default]
    Local,
    /// A remote peer reached through the streaming layer
    Remote {
        /// Peer address or name
        peer: String,
        /// Task queue the peer should schedule the sub-graph on
        task_queue: String,
    },
}

/// What happens when a kernel fails mid-execution
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorStrategy {
    /// Abort the failing node, close its outputs and let the rest finish
    #[default]
    AbortScope,
    /// Cancel the whole graph
    AbortGraph,
}

/// A node in a graph definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDef {
    /// Unique node name within the graph
    pub name: String,
    /// Registered kernel name
    pub kernel: String,
    /// Per-node attributes, values are JSON text
    pub attrs: IndexMap<String, String>,
    /// Binary attributes, values are postcard-encoded
    pub binary_attrs: IndexMap<String, Vec<u8>>,
    /// Integer attributes
    pub int_attrs: IndexMap<String, i64>,
    /// Node-level config block (JSON object text)
    pub config: Option<String>,
    /// Execution domain
    pub domain: Domain,
}

impl NodeDef {
    /// Create a local node running `kernel`
    #[must_use]
    pub fn new(name: impl Into<String>, kernel: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kernel: kernel.into(),
            attrs: IndexMap::new(),
            binary_attrs: IndexMap::new(),
            int_attrs: IndexMap::new(),
            config: None,
            domain: Domain::Local,
        }
    }

    /// Set a JSON attribute
    #[must_use]
    pub fn with_attr(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attrs.insert(key.into(), value.to_string());
        self
    }

    /// Set a binary attribute from any serializable value
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be encoded
    pub fn with_binary_attr<T: Serialize>(
        mut self,
        key: impl Into<String>,
        value: &T,
    ) -> CoreResult<Self> {
        self.binary_attrs
            .insert(key.into(), postcard::to_allocvec(value)?);
        Ok(self)
    }

    /// Set an integer attribute
    #[must_use]
    pub fn with_int_attr(mut self, key: impl Into<String>, value: i64) -> Self {
        self.int_attrs.insert(key.into(), value);
        self
    }

    /// Set the node-level config block
    #[must_use]
    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = Some(config.to_string());
        self
    }

    /// Run this node on a remote peer
    #[must_use]
    pub fn on_peer(mut self, peer: impl Into<String>, task_queue: impl Into<String>) -> Self {
        self.domain = Domain::Remote {
            peer: peer.into(),
            task_queue: task_queue.into(),
        };
        self
    }
}

/// A (node, port) address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortAddr {
    /// Node name
    pub node: String,
    /// Port name
    pub port: String,
}

impl PortAddr {
    /// Create a port address
    #[must_use]
    pub fn new(node: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            port: port.into(),
        }
    }
}

/// An edge from an output port to an input port
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EdgeDef {
    /// Producing output port
    pub from: PortAddr,
    /// Consuming input port
    pub to: PortAddr,
}

/// A complete graph definition
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphDef {
    /// Nodes, in declaration order
    pub nodes: Vec<NodeDef>,
    /// Edges between ports
    pub edges: Vec<EdgeDef>,
    /// Deadline for the whole graph in milliseconds, 0 uses the engine default
    pub timeout_ms: u64,
    /// Scope error policy
    pub error_strategy: ErrorStrategy,
    /// Secondary (graph-level) config block, JSON object text
    pub config: Option<String>,
}

impl GraphDef {
    /// Create an empty definition
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node
    #[must_use]
    pub fn with_node(mut self, node: NodeDef) -> Self {
        self.nodes.push(node);
        self
    }

    /// Add an edge
    #[must_use]
    pub fn with_edge(
        mut self,
        from_node: &str,
        from_port: &str,
        to_node: &str,
        to_port: &str,
    ) -> Self {
        self.edges.push(EdgeDef {
            from: PortAddr::new(from_node, from_port),
            to: PortAddr::new(to_node, to_port),
        });
        self
    }

    /// Set the deadline
    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Set the scope error policy
    #[must_use]
    pub fn with_error_strategy(mut self, strategy: ErrorStrategy) -> Self {
        self.error_strategy = strategy;
        self
    }

    /// Set the graph-level config block
    #[must_use]
    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = Some(config.to_string());
        self
    }

    /// Look up a node by name
    #[must_use]
    pub fn node(&self, name: &str) -> Option<&NodeDef> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Whether any node runs outside the local domain
    #[must_use]
    pub fn has_remote_nodes(&self) -> bool {
        self.nodes.iter().any(|n| n.domain != Domain::Local)
    }

    /// Validate the definition structure
    ///
    /// Checks that node names are unique, that every edge references a
    /// declared node, and that the nodes of each domain form a DAG.
    ///
    /// # Errors
    ///
    /// Returns error if the definition is invalid
    pub fn validate(&self) -> CoreResult<()> {
        let mut names = IndexSet::new();
        for node in &self.nodes {
            if !names.insert(node.name.as_str()) {
                return Err(CoreError::AlreadyExists {
                    kind: "Node".to_string(),
                    id: node.name.clone(),
                });
            }
        }

        for edge in &self.edges {
            for addr in [&edge.from, &edge.to] {
                if !names.contains(addr.node.as_str()) {
                    return Err(CoreError::NotFound {
                        kind: "Node".to_string(),
                        id: addr.node.clone(),
                    });
                }
            }
        }

        self.check_cycles()
    }

    /// Detect cycles among edges whose endpoints share a domain
    fn check_cycles(&self) -> CoreResult<()> {
        let domains: IndexMap<&str, &Domain> = self
            .nodes
            .iter()
            .map(|n| (n.name.as_str(), &n.domain))
            .collect();

        let mut successors: IndexMap<&str, Vec<&str>> = IndexMap::new();
        for edge in &self.edges {
            let from = edge.from.node.as_str();
            let to = edge.to.node.as_str();
            if domains.get(from) == domains.get(to) {
                successors.entry(from).or_default().push(to);
            }
        }

        // 0 = unvisited, 1 = on stack, 2 = done
        let mut marks: IndexMap<&str, u8> = IndexMap::new();
        for node in &self.nodes {
            let mut stack: Vec<&str> = Vec::new();
            Self::visit(node.name.as_str(), &successors, &mut marks, &mut stack)?;
        }
        Ok(())
    }

    fn visit<'a>(
        name: &'a str,
        successors: &IndexMap<&'a str, Vec<&'a str>>,
        marks: &mut IndexMap<&'a str, u8>,
        stack: &mut Vec<&'a str>,
    ) -> CoreResult<()> {
        match marks.get(name).copied().unwrap_or(0) {
            2 => return Ok(()),
            1 => {
                let start = stack.iter().position(|n| *n == name).unwrap_or(0);
                let mut chain: Vec<String> =
                    stack[start..].iter().map(|n| (*n).to_string()).collect();
                chain.push(name.to_string());
                return Err(CoreError::CycleDetected { chain });
            }
            _ => {}
        }

        marks.insert(name, 1);
        stack.push(name);
        if let Some(next) = successors.get(name) {
            for &succ in next {
                Self::visit(succ, successors, marks, stack)?;
            }
        }
        stack.pop();
        marks.insert(name, 2);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chain() -> GraphDef {
        GraphDef::new()
            .with_node(NodeDef::new("a", "source"))
            .with_node(NodeDef::new("b", "passthrough"))
            .with_node(NodeDef::new("c", "collect"))
            .with_edge("a", "out", "b", "in")
            .with_edge("b", "out", "c", "in")
    }

    #[test]
    fn test_validate_chain() {
        assert!(chain().validate().is_ok());
    }

    #[test]
    fn test_duplicate_node_rejected() {
        let def = chain().with_node(NodeDef::new("a", "source"));
        assert!(matches!(
            def.validate(),
            Err(CoreError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn test_dangling_edge_rejected() {
        let def = chain().with_edge("c", "out", "zz", "in");
        assert_eq!(
            def.validate(),
            Err(CoreError::NotFound {
                kind: "Node".to_string(),
                id: "zz".to_string()
            })
        );
    }

    #[test]
    fn test_cycle_reports_chain() {
        let def = chain().with_edge("c", "out", "a", "in");
        match def.validate() {
            Err(CoreError::CycleDetected { chain }) => {
                assert_eq!(chain.first(), chain.last());
                assert!(chain.contains(&"b".to_string()));
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_cross_domain_loop_allowed() {
        let def = GraphDef::new()
            .with_node(NodeDef::new("a", "passthrough"))
            .with_node(NodeDef::new("b", "passthrough").on_peer("peer-1", "default"))
            .with_edge("a", "out", "b", "in")
            .with_edge("b", "out", "a", "in");
        assert!(def.validate().is_ok());
        assert!(def.has_remote_nodes());
    }

    #[test]
    fn test_node_builders() {
        let node = NodeDef::new("a", "source")
            .with_attr("values", json!([1, 2]))
            .with_int_attr("limit", 3)
            .with_config(json!({"mode": "fast"}));
        assert_eq!(node.attrs.get("values").map(String::as_str), Some("[1,2]"));
        assert_eq!(node.int_attrs.get("limit"), Some(&3));
        assert!(node.config.is_some());
    }

    #[test]
    fn test_graph_def_postcard() {
        let def = chain()
            .with_timeout_ms(250)
            .with_error_strategy(ErrorStrategy::AbortGraph);
        let bytes = postcard::to_allocvec(&def).unwrap();
        let back: GraphDef = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(back, def);
    }
}
