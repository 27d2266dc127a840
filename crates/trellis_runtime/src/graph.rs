//! Live graphs.
//!
//! `Graph::build` turns a validated definition into nodes wired by port,
//! running every kernel's `define`, `config` and `init` along the way. A
//! built graph does nothing until `start`; from then on nodes run on the
//! graph's task queue whenever their readiness bits allow, and the graph
//! finalizes exactly once, when every node reached a terminal state.

use crate::bitmap::ReadyBitMap;
use crate::border::BorderHub;
use crate::data::{Data, DataCodecs};
use crate::error::{GraphError, GraphResult, KernelError};
use crate::kernel::{InitContext, Kernel, KernelDef, KernelRegistry, types_compatible};
use crate::node::{InputPort, Node, NodeState, OutputPort};
use crate::pipe::AsyncPipe;
use crate::pool::{PoolLease, PoolResource};
use crate::task_queue::TaskQueue;
use crate::timer::{TimerHandle, TimerService};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use trellis_core::{
    BuiltinKeys, ConfigContext, ErrorStrategy, GraphDef, GraphId, GraphStatus, NodeDef, NodeId,
    SessionId,
};
use trellis_resource::{CreatorRegistry, ResourceError, ResourceMap, ResourceScope};

type CancelHook = Box<dyn FnOnce(&GraphStatus) + Send>;
type FinishHook = Box<dyn FnOnce(&GraphOutcome) + Send>;

/// Terminal result of a graph
#[derive(Debug, Clone)]
pub struct GraphOutcome {
    /// Final status
    pub status: GraphStatus,
    /// Items collected by each node, keyed by node name
    pub outputs: IndexMap<String, Vec<Data>>,
    /// Total `compute` calls across nodes
    pub computes: u64,
}

impl GraphOutcome {
    /// Items collected by `node`
    #[must_use]
    pub fn output(&self, node: &str) -> &[Data] {
        self.outputs.get(node).map_or(&[], Vec::as_slice)
    }

    /// Items collected by `node` that are a `T`, cloned
    #[must_use]
    pub fn values<T: Clone + 'static>(&self, node: &str) -> Vec<T> {
        self.output(node)
            .iter()
            .filter_map(|item| item.downcast_ref::<T>().cloned())
            .collect()
    }
}

/// Reschedules one node when one of its pipes becomes ready
#[derive(Debug, Clone)]
pub(crate) struct NodeWaker {
    graph: Weak<Graph>,
    node: NodeId,
}

impl NodeWaker {
    pub(crate) fn wake(&self) {
        if let Some(graph) = self.graph.upgrade() {
            graph.try_schedule(self.node);
        }
    }
}

/// Everything `Graph::build` draws from the engine
pub(crate) struct BuildContext<'a> {
    pub(crate) kernels: &'a KernelRegistry,
    pub(crate) creators: &'a Arc<CreatorRegistry>,
    pub(crate) snapshot_resources: &'a Arc<ResourceMap>,
    pub(crate) codecs: Arc<DataCodecs>,
    pub(crate) pools: &'a Arc<PoolResource>,
    pub(crate) queue: Arc<TaskQueue>,
    pub(crate) session: SessionId,
}

struct Staged<'d> {
    def: &'d NodeDef,
    kernel: Box<dyn Kernel>,
    spec: KernelDef,
}

/// A running graph
pub struct Graph {
    id: GraphId,
    session: SessionId,
    pub(crate) nodes: Vec<Node>,
    names: IndexMap<String, NodeId>,
    pub(crate) cancelled: AtomicBool,
    pub(crate) remaining: AtomicUsize,
    pub(crate) first_error: Mutex<Option<GraphStatus>>,
    pub(crate) cancel_status: Mutex<Option<GraphStatus>>,
    pub(crate) outcome_tx: watch::Sender<Option<GraphOutcome>>,
    pub(crate) queue: Arc<TaskQueue>,
    pub(crate) error_strategy: ErrorStrategy,
    pub(crate) cancel_hooks: Mutex<Vec<CancelHook>>,
    pub(crate) finish_hooks: Mutex<Vec<FinishHook>>,
    pub(crate) timer: Mutex<Option<(Arc<TimerService>, TimerHandle)>>,
    resources: Arc<ResourceMap>,
    collected: Mutex<IndexMap<String, Vec<Data>>>,
    hub: Arc<BorderHub>,
    codecs: Arc<DataCodecs>,
    arena: PoolLease,
    pub(crate) finalized: AtomicBool,
}

impl Graph {
    /// Instantiate every node of `def`
    pub(crate) fn build(def: &GraphDef, ctx: BuildContext<'_>) -> GraphResult<Arc<Self>> {
        def.validate()?;
        let id = GraphId::new();
        let resources = ResourceMap::child(
            ctx.snapshot_resources,
            Arc::clone(ctx.creators),
            ResourceScope::Graph,
        )?;
        let hub = Arc::new(BorderHub::new());
        // Returned by finalize, or by drop when the build fails.
        let arena = PoolLease::draw(ctx.pools);

        let mut staged = Vec::with_capacity(def.nodes.len());
        let mut names = IndexMap::new();
        for (index, node_def) in def.nodes.iter().enumerate() {
            let mut kernel =
                ctx.kernels
                    .create(&node_def.kernel)
                    .ok_or_else(|| GraphError::UnknownKernel {
                        node: node_def.name.clone(),
                        kernel: node_def.kernel.clone(),
                    })?;
            let mut spec = KernelDef::default();
            kernel.define(&mut spec);

            let builtins = BuiltinKeys {
                node_name: node_def.name.clone(),
                kernel_name: node_def.kernel.clone(),
                graph_id: id,
                session: ctx.session,
            };
            let config_error = |source: KernelError| GraphError::KernelConfig {
                node: node_def.name.clone(),
                source,
            };
            let config = ConfigContext::for_node(node_def, def.config.as_deref(), builtins)
                .map_err(|e| config_error(e.into()))?;
            kernel.config(&config).map_err(config_error)?;

            names.insert(node_def.name.clone(), NodeId::new(index as u32));
            staged.push(Staged {
                def: node_def,
                kernel,
                spec,
            });
        }

        let mut targets: Vec<Vec<Vec<(NodeId, usize)>>> = staged
            .iter()
            .map(|s| vec![Vec::new(); s.spec.outputs().len()])
            .collect();
        let mut producers: Vec<Vec<usize>> = staged
            .iter()
            .map(|s| vec![0; s.spec.inputs().len()])
            .collect();
        for edge in &def.edges {
            let unknown = |node: &str| GraphError::Definition(trellis_core::CoreError::NotFound {
                kind: "Node".to_string(),
                id: node.to_string(),
            });
            let from = names.get(&edge.from.node).ok_or_else(|| unknown(&edge.from.node))?;
            let to = names.get(&edge.to.node).ok_or_else(|| unknown(&edge.to.node))?;
            let from_spec = &staged[from.index()].spec;
            let to_spec = &staged[to.index()].spec;

            let out_idx = from_spec
                .output_index(&edge.from.port)
                .ok_or_else(|| GraphError::UnknownPort {
                    node: edge.from.node.clone(),
                    port: edge.from.port.clone(),
                })?;
            let in_idx = to_spec
                .input_index(&edge.to.port)
                .ok_or_else(|| GraphError::UnknownPort {
                    node: edge.to.node.clone(),
                    port: edge.to.port.clone(),
                })?;
            let from_type = &from_spec.outputs()[out_idx].type_id;
            let to_type = &to_spec.inputs()[in_idx].type_id;
            if !types_compatible(from_type, to_type) {
                return Err(GraphError::PortTypeMismatch {
                    from: format!("{}:{}", edge.from.node, edge.from.port),
                    to: format!("{}:{}", edge.to.node, edge.to.port),
                    from_type: from_type.clone(),
                    to_type: to_type.clone(),
                });
            }
            targets[from.index()][out_idx].push((*to, in_idx));
            producers[to.index()][in_idx] += 1;
        }

        let mut nodes = Vec::with_capacity(staged.len());
        for (index, (stage, (node_targets, node_producers))) in staged
            .into_iter()
            .zip(targets.into_iter().zip(producers))
            .enumerate()
        {
            let Staged {
                def: node_def,
                mut kernel,
                spec,
            } = stage;
            let input_count = spec.inputs().len();
            let bitmap = Arc::new(ReadyBitMap::new(input_count, spec.pipes().len()));
            let inputs = spec
                .inputs()
                .iter()
                .zip(node_producers)
                .enumerate()
                .map(|(slot, (port, count))| {
                    InputPort::new(
                        port.name.clone(),
                        port.type_id.clone(),
                        slot,
                        count,
                        Arc::clone(&bitmap),
                    )
                })
                .collect();
            let outputs = spec
                .outputs()
                .iter()
                .zip(node_targets)
                .map(|(port, targets)| OutputPort {
                    name: port.name.clone(),
                    type_id: port.type_id.clone(),
                    targets,
                })
                .collect();
            let pipes: Vec<Arc<AsyncPipe>> = spec
                .pipes()
                .iter()
                .enumerate()
                .map(|(i, pipe)| Arc::new(AsyncPipe::new(*pipe, Arc::clone(&bitmap), input_count + i)))
                .collect();

            for (resource, required) in spec.resources() {
                match resources.get_ref(resource) {
                    Ok(_) => {}
                    Err(ResourceError::NotFound { name }) if !required && name == *resource => {}
                    Err(source) => {
                        return Err(GraphError::Resource {
                            node: node_def.name.clone(),
                            source,
                        });
                    }
                }
            }

            let mut init = InitContext {
                node_name: &node_def.name,
                declared: spec.resources(),
                resources: &resources,
                pipes: &pipes,
                border: &hub,
                codecs: &ctx.codecs,
                arena: &arena,
                graph_id: id,
                session: ctx.session,
            };
            kernel
                .init(&mut init)
                .map_err(|source| GraphError::KernelInit {
                    node: node_def.name.clone(),
                    source,
                })?;

            nodes.push(Node::new(
                NodeId::new(index as u32),
                node_def.name.clone(),
                node_def.kernel.clone(),
                kernel,
                inputs,
                outputs,
                pipes,
                spec.resources().clone(),
                bitmap,
            ));
        }

        let (outcome_tx, _) = watch::channel(None);
        let graph = Arc::new(Self {
            id,
            session: ctx.session,
            remaining: AtomicUsize::new(nodes.len()),
            nodes,
            names,
            cancelled: AtomicBool::new(false),
            first_error: Mutex::new(None),
            cancel_status: Mutex::new(None),
            outcome_tx,
            queue: ctx.queue,
            error_strategy: def.error_strategy,
            cancel_hooks: Mutex::new(Vec::new()),
            finish_hooks: Mutex::new(Vec::new()),
            timer: Mutex::new(None),
            resources,
            collected: Mutex::new(IndexMap::new()),
            hub,
            codecs: ctx.codecs,
            arena,
            finalized: AtomicBool::new(false),
        });

        for node in &graph.nodes {
            for pipe in &node.pipes {
                pipe.bind(NodeWaker {
                    graph: Arc::downgrade(&graph),
                    node: node.id,
                });
            }
        }

        tracing::debug!(
            graph = %id,
            session = %ctx.session,
            nodes = graph.nodes.len(),
            queue = %graph.queue.name(),
            "Graph built"
        );
        Ok(graph)
    }

    /// Arm the deadline and schedule every ready node
    pub(crate) fn start(self: &Arc<Self>, timers: &Arc<TimerService>, timeout: Duration) {
        if self.finalized.load(Ordering::SeqCst) {
            return;
        }
        if !timeout.is_zero() {
            let weak = Arc::downgrade(self);
            let handle = timers.add_timer(timeout, move |event| {
                if !event.is_timeout {
                    return;
                }
                if let Some(graph) = weak.upgrade() {
                    tracing::warn!(graph = %graph.id, "Graph deadline reached");
                    graph.cancel_with(GraphStatus::Timeout);
                }
            });
            *self.timer.lock() = Some((Arc::clone(timers), handle));
        }

        tracing::info!(graph = %self.id, session = %self.session, "Graph started");
        if self.nodes.is_empty() {
            self.finalize();
            return;
        }
        for node in &self.nodes {
            self.try_schedule(node.id);
        }
    }

    /// Graph id
    #[must_use]
    pub const fn id(&self) -> GraphId {
        self.id
    }

    /// Session
    #[must_use]
    pub const fn session(&self) -> SessionId {
        self.session
    }

    /// Whether cancellation started
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index())
    }

    pub(crate) fn node_by_name(&self, name: &str) -> Option<&Node> {
        self.names.get(name).and_then(|id| self.node(*id))
    }

    /// The graph-scope resource map
    #[must_use]
    pub fn resources(&self) -> &Arc<ResourceMap> {
        &self.resources
    }

    pub(crate) fn border(&self) -> &Arc<BorderHub> {
        &self.hub
    }

    pub(crate) fn codecs(&self) -> &Arc<DataCodecs> {
        &self.codecs
    }

    pub(crate) fn arena(&self) -> &PoolLease {
        &self.arena
    }

    pub(crate) fn collect(&self, node: &str, item: Data) {
        self.collected
            .lock()
            .entry(node.to_string())
            .or_default()
            .push(item);
    }

    pub(crate) fn take_collected(&self) -> IndexMap<String, Vec<Data>> {
        std::mem::take(&mut *self.collected.lock())
    }

    /// Register a hook run once when the graph is cancelled; runs at once if
    /// it already was
    pub fn on_cancel(&self, hook: impl FnOnce(&GraphStatus) + Send + 'static) {
        let mut hooks = self.cancel_hooks.lock();
        if self.is_cancelled() {
            drop(hooks);
            let status = self
                .cancel_status
                .lock()
                .clone()
                .unwrap_or(GraphStatus::Cancelled {
                    origin: "unknown".to_string(),
                });
            hook(&status);
            return;
        }
        hooks.push(Box::new(hook));
    }

    /// Register a hook run once with the outcome; runs at once if the graph
    /// already finished
    pub fn on_finish(&self, hook: impl FnOnce(&GraphOutcome) + Send + 'static) {
        let mut hooks = self.finish_hooks.lock();
        let done = self.outcome_tx.borrow().clone();
        match done {
            Some(outcome) => {
                drop(hooks);
                hook(&outcome);
            }
            None => hooks.push(Box::new(hook)),
        }
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("id", &self.id)
            .field("session", &self.session)
            .field("nodes", &self.nodes)
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Caller's view of a running graph
#[derive(Clone)]
pub struct GraphHandle {
    graph: Arc<Graph>,
    outcome: watch::Receiver<Option<GraphOutcome>>,
}

impl GraphHandle {
    pub(crate) fn new(graph: Arc<Graph>) -> Self {
        let outcome = graph.outcome_tx.subscribe();
        Self { graph, outcome }
    }

    pub(crate) fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    /// Graph id
    #[must_use]
    pub fn id(&self) -> GraphId {
        self.graph.id()
    }

    /// Session
    #[must_use]
    pub fn session(&self) -> SessionId {
        self.graph.session()
    }

    /// Wait for the outcome
    pub async fn wait(&self) -> GraphOutcome {
        let mut outcome = self.outcome.clone();
        let done = match outcome.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        };
        done.unwrap_or_else(|| GraphOutcome {
            status: GraphStatus::Cancelled {
                origin: "runtime".to_string(),
            },
            outputs: IndexMap::new(),
            computes: 0,
        })
    }

    /// The outcome, if the graph finished
    #[must_use]
    pub fn outcome(&self) -> Option<GraphOutcome> {
        self.outcome.borrow().clone()
    }

    /// The final status, if the graph finished
    #[must_use]
    pub fn status(&self) -> Option<GraphStatus> {
        self.outcome.borrow().as_ref().map(|o| o.status.clone())
    }

    /// Cancel on the caller's behalf
    pub fn cancel(&self) -> bool {
        self.cancel_from("caller")
    }

    /// Cancel, naming where the cancellation came from
    pub fn cancel_from(&self, origin: &str) -> bool {
        self.graph.cancel_with(GraphStatus::Cancelled {
            origin: origin.to_string(),
        })
    }

    /// Whether cancellation started
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.graph.is_cancelled()
    }

    /// State of a node
    #[must_use]
    pub fn node_state(&self, node: &str) -> Option<NodeState> {
        self.graph.node_by_name(node).map(Node::state)
    }

    /// `compute` calls made on a node
    #[must_use]
    pub fn compute_count(&self, node: &str) -> Option<u64> {
        self.graph.node_by_name(node).map(Node::compute_count)
    }

    /// A node's async pipe
    #[must_use]
    pub fn pipe(&self, node: &str, index: usize) -> Option<Arc<AsyncPipe>> {
        self.graph
            .node_by_name(node)
            .and_then(|n| n.pipes.get(index).cloned())
    }

    /// Node names in declaration order
    pub fn node_names(&self) -> impl Iterator<Item = &str> {
        self.graph.names.keys().map(String::as_str)
    }

    /// The graph's border hub
    #[must_use]
    pub fn border(&self) -> Arc<BorderHub> {
        Arc::clone(self.graph.border())
    }

    /// See [`Graph::on_cancel`]
    pub fn on_cancel(&self, hook: impl FnOnce(&GraphStatus) + Send + 'static) {
        self.graph.on_cancel(hook);
    }

    /// See [`Graph::on_finish`]
    pub fn on_finish(&self, hook: impl FnOnce(&GraphOutcome) + Send + 'static) {
        self.graph.on_finish(hook);
    }
}

impl std::fmt::Debug for GraphHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphHandle")
            .field("id", &self.graph.id())
            .field("finished", &self.outcome.borrow().is_some())
            .finish()
    }
}
