//! Kernel contract.
//!
//! A kernel is instantiated once per node. The runtime calls, in order:
//! `define` to learn its ports, pipes and resource needs; `config` with
//! the node's resolved configuration; `init` with its resources and pipes;
//! then `compute` any number of times, never concurrently, until it
//! returns `Finished` or `Aborted`.

use crate::border::BorderHub;
use crate::data::{ANY_TYPE, Data, DataCodecs};
use crate::error::KernelError;
use crate::graph::Graph;
use crate::node::Node;
use crate::pipe::{ActivateStrategy, AsyncPipe, PipeSpec};
use crate::pool::{Pool, PoolLease};
use indexmap::IndexMap;
use std::any::Any;
use std::sync::Arc;
use trellis_core::{ConfigContext, GraphId, SessionId};
use trellis_resource::{ResourceError, ResourceMap};

/// Outcome of one `compute` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeStatus {
    /// Run again when inputs allow
    Continue,
    /// Done; outputs close
    Finished,
    /// Waiting on async pipes, run again when one becomes ready
    Suspended,
    /// Give up; handled like an error under the graph's error strategy
    Aborted,
}

/// A port declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSpec {
    /// Port name
    pub name: String,
    /// Type id, `*` accepts anything
    pub type_id: String,
}

/// What a kernel declares about itself
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelDef {
    inputs: Vec<PortSpec>,
    outputs: Vec<PortSpec>,
    resources: IndexMap<String, bool>,
    pipes: Vec<PipeSpec>,
}

impl KernelDef {
    /// Declare an input port
    pub fn input(&mut self, name: &str, type_id: &str) -> &mut Self {
        self.inputs.push(PortSpec {
            name: name.to_string(),
            type_id: type_id.to_string(),
        });
        self
    }

    /// Declare an output port
    pub fn output(&mut self, name: &str, type_id: &str) -> &mut Self {
        self.outputs.push(PortSpec {
            name: name.to_string(),
            type_id: type_id.to_string(),
        });
        self
    }

    /// Declare a resource dependency
    pub fn depend_on(&mut self, resource: &str, required: bool) -> &mut Self {
        self.resources.insert(resource.to_string(), required);
        self
    }

    /// Declare an async pipe
    pub fn async_pipe(&mut self, strategy: ActivateStrategy, capacity: usize) -> &mut Self {
        self.pipes.push(PipeSpec { strategy, capacity });
        self
    }

    /// Input ports
    #[must_use]
    pub fn inputs(&self) -> &[PortSpec] {
        &self.inputs
    }

    /// Output ports
    #[must_use]
    pub fn outputs(&self) -> &[PortSpec] {
        &self.outputs
    }

    /// Resource dependencies
    #[must_use]
    pub fn resources(&self) -> &IndexMap<String, bool> {
        &self.resources
    }

    /// Async pipes
    #[must_use]
    pub fn pipes(&self) -> &[PipeSpec] {
        &self.pipes
    }

    /// Index of an input port by name
    #[must_use]
    pub fn input_index(&self, name: &str) -> Option<usize> {
        self.inputs.iter().position(|p| p.name == name)
    }

    /// Index of an output port by name
    #[must_use]
    pub fn output_index(&self, name: &str) -> Option<usize> {
        self.outputs.iter().position(|p| p.name == name)
    }
}

/// Whether two port type ids can be wired together
#[must_use]
pub fn types_compatible(from: &str, to: &str) -> bool {
    from == ANY_TYPE || to == ANY_TYPE || from == to
}

/// A computation unit
pub trait Kernel: Send {
    /// Declare ports, pipes and resources
    fn define(&self, def: &mut KernelDef);

    /// Bind configuration
    ///
    /// # Errors
    ///
    /// Returns error if a required key is missing or malformed
    fn config(&mut self, _ctx: &ConfigContext<'_>) -> Result<(), KernelError> {
        Ok(())
    }

    /// Acquire resources and pipes
    ///
    /// # Errors
    ///
    /// Returns error if a resource is unavailable
    fn init(&mut self, _ctx: &mut InitContext<'_>) -> Result<(), KernelError> {
        Ok(())
    }

    /// Process available input
    ///
    /// # Errors
    ///
    /// Returns error on a kernel failure
    fn compute(&mut self, ctx: &mut ComputeContext<'_>) -> Result<ComputeStatus, KernelError>;
}

/// What `Kernel::init` can reach
pub struct InitContext<'a> {
    pub(crate) node_name: &'a str,
    pub(crate) declared: &'a IndexMap<String, bool>,
    pub(crate) resources: &'a ResourceMap,
    pub(crate) pipes: &'a [Arc<AsyncPipe>],
    pub(crate) border: &'a Arc<BorderHub>,
    pub(crate) codecs: &'a Arc<DataCodecs>,
    pub(crate) arena: &'a PoolLease,
    pub(crate) graph_id: GraphId,
    pub(crate) session: SessionId,
}

impl InitContext<'_> {
    /// Node name
    #[must_use]
    pub fn node_name(&self) -> &str {
        self.node_name
    }

    /// Graph id
    #[must_use]
    pub const fn graph_id(&self) -> GraphId {
        self.graph_id
    }

    /// Session
    #[must_use]
    pub const fn session(&self) -> SessionId {
        self.session
    }

    /// A declared resource
    ///
    /// # Errors
    ///
    /// Returns error if the resource was not declared, is absent, or has
    /// another type
    pub fn resource<T: Any + Send + Sync>(&self, name: &str) -> Result<Arc<T>, KernelError> {
        self.optional_resource(name)?
            .ok_or_else(|| {
                KernelError::Resource(ResourceError::NotFound {
                    name: name.to_string(),
                })
            })
    }

    /// A declared resource that may be absent
    ///
    /// # Errors
    ///
    /// Returns error if the resource was not declared, fails to build, or
    /// has another type
    pub fn optional_resource<T: Any + Send + Sync>(
        &self,
        name: &str,
    ) -> Result<Option<Arc<T>>, KernelError> {
        if !self.declared.contains_key(name) {
            return Err(KernelError::UndeclaredResource {
                name: name.to_string(),
            });
        }
        Ok(self.resources.get_optional::<T>(name)?)
    }

    /// A declared async pipe
    ///
    /// # Errors
    ///
    /// Returns error if fewer pipes were declared
    pub fn pipe(&self, index: usize) -> Result<Arc<AsyncPipe>, KernelError> {
        self.pipes
            .get(index)
            .cloned()
            .ok_or(KernelError::PipeNotDeclared { index })
    }

    /// The graph's border hub
    #[must_use]
    pub fn border(&self) -> &Arc<BorderHub> {
        self.border
    }

    /// Border codecs
    #[must_use]
    pub fn codecs(&self) -> &Arc<DataCodecs> {
        self.codecs
    }

    /// Run `f` on the arena this graph drew from the pool resource
    ///
    /// # Errors
    ///
    /// Returns error if the arena was already returned
    pub fn with_pool<R>(&self, f: impl FnOnce(&mut Pool) -> R) -> Result<R, KernelError> {
        self.arena.with(f).ok_or(KernelError::PoolReleased)
    }
}

/// What `Kernel::compute` can reach
pub struct ComputeContext<'a> {
    graph: &'a Graph,
    node: &'a Node,
    outputs: Vec<Vec<Data>>,
}

impl<'a> ComputeContext<'a> {
    pub(crate) fn new(graph: &'a Graph, node: &'a Node) -> Self {
        Self {
            graph,
            node,
            outputs: vec![Vec::new(); node.outputs.len()],
        }
    }

    pub(crate) fn into_outputs(self) -> Vec<Vec<Data>> {
        self.outputs
    }

    /// Node name
    #[must_use]
    pub fn node_name(&self) -> &str {
        &self.node.name
    }

    /// Graph id
    #[must_use]
    pub fn graph_id(&self) -> GraphId {
        self.graph.id()
    }

    /// Session
    #[must_use]
    pub fn session(&self) -> SessionId {
        self.graph.session()
    }

    /// Run `f` on the graph's arena. Allocations live until the graph
    /// finishes.
    ///
    /// # Errors
    ///
    /// Returns error if the graph already returned its arena
    pub fn with_pool<R>(&self, f: impl FnOnce(&mut Pool) -> R) -> Result<R, KernelError> {
        self.graph.arena().with(f).ok_or(KernelError::PoolReleased)
    }

    /// Whether the graph was cancelled; long computations should return
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.graph.is_cancelled()
    }

    /// Number of input ports
    #[must_use]
    pub fn input_count(&self) -> usize {
        self.node.inputs.len()
    }

    /// Number of output ports
    #[must_use]
    pub fn output_count(&self) -> usize {
        self.node.outputs.len()
    }

    /// Items pending on an input
    #[must_use]
    pub fn input_len(&self, port: usize) -> usize {
        self.node.inputs.get(port).map_or(0, |p| p.len())
    }

    /// The `index`-th pending item of an input, without consuming it
    #[must_use]
    pub fn peek(&self, port: usize, index: usize) -> Option<Data> {
        self.node.inputs.get(port).and_then(|p| p.peek(index))
    }

    /// Consume the oldest item of an input
    pub fn read(&mut self, port: usize) -> Option<Data> {
        self.node.inputs.get(port).and_then(|p| p.pop())
    }

    /// Consume every pending item of an input
    pub fn read_all(&mut self, port: usize) -> Vec<Data> {
        self.node
            .inputs
            .get(port)
            .map(|p| p.drain())
            .unwrap_or_default()
    }

    /// Consume the oldest item as a `T`
    ///
    /// # Errors
    ///
    /// Returns error if the item has another type
    pub fn read_as<T: Any + Send + Sync>(&mut self, port: usize) -> Result<Option<Arc<T>>, KernelError> {
        match self.read(port) {
            None => Ok(None),
            Some(item) => item
                .downcast::<T>()
                .map(Some)
                .map_err(|_| KernelError::UnexpectedType {
                    port,
                    expected: std::any::type_name::<T>().to_string(),
                }),
        }
    }

    /// Whether an input has no pending items and no open producers
    #[must_use]
    pub fn is_eof(&self, port: usize) -> bool {
        self.node.inputs.get(port).is_none_or(|p| p.is_eof())
    }

    /// Whether every input is at EOF
    #[must_use]
    pub fn inputs_done(&self) -> bool {
        self.node.inputs.iter().all(|p| p.is_eof())
    }

    /// Emit an item on an output
    ///
    /// # Errors
    ///
    /// Returns error if the port does not exist
    pub fn write(&mut self, port: usize, item: Data) -> Result<(), KernelError> {
        self.outputs
            .get_mut(port)
            .ok_or(KernelError::PortOutOfRange { port })?
            .push(item);
        Ok(())
    }

    /// A declared async pipe
    ///
    /// # Errors
    ///
    /// Returns error if fewer pipes were declared
    pub fn pipe(&self, index: usize) -> Result<&Arc<AsyncPipe>, KernelError> {
        self.node
            .pipes
            .get(index)
            .ok_or(KernelError::PipeNotDeclared { index })
    }

    /// Append an item to this node's slot of the graph result
    pub fn collect(&mut self, item: Data) {
        self.graph.collect(&self.node.name, item);
    }

    /// The graph's border hub
    #[must_use]
    pub fn border(&self) -> &Arc<BorderHub> {
        self.graph.border()
    }

    /// Border codecs
    #[must_use]
    pub fn codecs(&self) -> &Arc<DataCodecs> {
        self.graph.codecs()
    }
}

/// Kernel constructor
pub type KernelFactory = Arc<dyn Fn() -> Box<dyn Kernel> + Send + Sync>;

/// Kernel name to factory
#[derive(Clone, Default)]
pub struct KernelRegistry {
    factories: IndexMap<String, KernelFactory>,
}

impl KernelRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding the built-in kernels
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::kernels::register_builtins(&mut registry);
        registry
    }

    /// Register a kernel; a later registration of the same name wins
    pub fn register<K, F>(&mut self, name: &str, factory: F)
    where
        K: Kernel + 'static,
        F: Fn() -> K + Send + Sync + 'static,
    {
        self.factories.insert(
            name.to_string(),
            Arc::new(move || Box::new(factory()) as Box<dyn Kernel>),
        );
    }

    /// Instantiate a kernel
    #[must_use]
    pub fn create(&self, name: &str) -> Option<Box<dyn Kernel>> {
        self.factories.get(name).map(|factory| factory())
    }

    /// Whether a kernel is registered
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for KernelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.factories.keys()).finish()
    }
}
