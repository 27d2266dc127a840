//! Execution engine.
//!
//! The engine owns the process-wide machinery (task queues, the timer
//! service, the pool resource and the process resource map) and the
//! current [`Snapshot`]: a kernel registry plus a creator registry with its
//! snapshot-scope resource map. Graphs are built against whichever snapshot
//! is current when they start and keep it alive until they finish.

use crate::border::BorderOutlet;
use crate::data::DataCodecs;
use crate::error::{GraphError, GraphResult};
use crate::fork::{self, ForkRequest, SubGraphForker};
use crate::graph::{BuildContext, Graph, GraphHandle};
use crate::kernel::KernelRegistry;
use crate::monitor::{ExecutionMonitor, Metrics, Telemetry};
use crate::pool::{POOL_RESOURCE, PoolResource, PoolResourceConfig};
use crate::task_queue::{DEFAULT_QUEUE, TaskQueue, TaskQueueConfig, TaskQueueManager};
use crate::timer::TimerService;
use arc_swap::ArcSwap;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use trellis_core::{GraphDef, GraphStatus, SessionId};
use trellis_resource::{CreatorRegistry, ResourceMap, ResourceRef, ResourceScope};

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Deadline applied when neither the graph nor the caller sets one; 0 disables
    pub default_timeout_ms: u64,
    /// Task queues; a `default` queue is added when none is named so
    pub task_queues: Vec<TaskQueueConfig>,
    /// Pool resource settings
    pub pool: PoolResourceConfig,
    /// Instance id stamped on sessions this engine issues
    pub instance_id: u64,
    /// Poll interval while draining a replaced snapshot
    pub drain_poll_ms: u64,
    /// Telemetry captures kept by the monitor
    pub history: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 0,
            task_queues: vec![TaskQueueConfig::new(DEFAULT_QUEUE)],
            pool: PoolResourceConfig::default(),
            instance_id: 0,
            drain_poll_ms: 10,
            history: 1000,
        }
    }
}

impl EngineConfig {
    /// Add a task queue, replacing one with the same name
    #[must_use]
    pub fn with_task_queue(mut self, config: TaskQueueConfig) -> Self {
        self.task_queues.retain(|q| q.name != config.name);
        self.task_queues.push(config);
        self
    }

    /// Set the default deadline
    #[must_use]
    pub fn with_default_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.default_timeout_ms = timeout_ms;
        self
    }

    /// Set the pool resource settings
    #[must_use]
    pub fn with_pool(mut self, pool: PoolResourceConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Set the instance id
    #[must_use]
    pub fn with_instance_id(mut self, instance_id: u64) -> Self {
        self.instance_id = instance_id;
        self
    }

    /// Set the drain poll interval
    #[must_use]
    pub fn with_drain_poll_ms(mut self, drain_poll_ms: u64) -> Self {
        self.drain_poll_ms = drain_poll_ms.max(1);
        self
    }
}

/// Per-run options
#[derive(Clone, Default)]
pub struct RunOptions {
    /// Session to run under; a fresh one is issued when unset
    pub session: Option<SessionId>,
    /// Task queue name; empty or unknown names use the default queue
    pub task_queue: String,
    /// Outlet for border frames addressed to no particular peer
    pub default_outlet: Option<Arc<dyn BorderOutlet>>,
    /// Deadline overriding the engine default when the graph sets none
    pub timeout_ms: Option<u64>,
}

impl RunOptions {
    /// Run on the named task queue
    #[must_use]
    pub fn with_task_queue(mut self, name: impl Into<String>) -> Self {
        self.task_queue = name.into();
        self
    }

    /// Run under an existing session
    #[must_use]
    pub fn with_session(mut self, session: SessionId) -> Self {
        self.session = Some(session);
        self
    }

    /// Send unaddressed border frames to `outlet`
    #[must_use]
    pub fn with_default_outlet(mut self, outlet: Arc<dyn BorderOutlet>) -> Self {
        self.default_outlet = Some(outlet);
        self
    }

    /// Set the deadline
    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

impl std::fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunOptions")
            .field("session", &self.session)
            .field("task_queue", &self.task_queue)
            .field("default_outlet", &self.default_outlet.is_some())
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}

/// Kernels and resources graphs are built against
pub struct Snapshot {
    id: u64,
    kernels: Arc<KernelRegistry>,
    creators: Arc<CreatorRegistry>,
    resources: Arc<ResourceMap>,
    codecs: Arc<DataCodecs>,
    inflight: AtomicUsize,
}

impl Snapshot {
    /// Snapshot sequence number, starting at 0
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Kernel registry
    #[must_use]
    pub fn kernels(&self) -> &Arc<KernelRegistry> {
        &self.kernels
    }

    /// Snapshot-scope resource map
    #[must_use]
    pub fn resources(&self) -> &Arc<ResourceMap> {
        &self.resources
    }

    /// Graphs started against this snapshot and not finished
    #[must_use]
    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("id", &self.id)
            .field("kernels", &self.kernels)
            .field("resources", &self.resources)
            .field("inflight", &self.inflight())
            .finish()
    }
}

/// Graph execution engine
pub struct Engine {
    config: EngineConfig,
    queues: Arc<TaskQueueManager>,
    timers: Arc<TimerService>,
    pools: Arc<PoolResource>,
    process: Arc<ResourceMap>,
    snapshot: ArcSwap<Snapshot>,
    next_snapshot: AtomicU64,
    forker: RwLock<Option<Arc<dyn SubGraphForker>>>,
    monitor: Arc<Mutex<ExecutionMonitor>>,
    next_query: AtomicU64,
}

impl Engine {
    /// Create an engine running the built-in kernels
    ///
    /// # Errors
    ///
    /// Returns error if a task queue or the timer service cannot start
    pub fn new(config: EngineConfig) -> GraphResult<Arc<Self>> {
        Self::with_kernels(config, KernelRegistry::with_builtins())
    }

    /// Create an engine with its first kernel registry
    ///
    /// # Errors
    ///
    /// Returns error if a task queue or the timer service cannot start
    pub fn with_kernels(config: EngineConfig, kernels: KernelRegistry) -> GraphResult<Arc<Self>> {
        let queues = Arc::new(TaskQueueManager::new(&config.task_queues)?);
        let timers = Arc::new(TimerService::new().map_err(|e| GraphError::Timer {
            reason: e.to_string(),
        })?);

        let mut process_creators = CreatorRegistry::new();
        process_creators.post_init()?;
        let process = ResourceMap::new(Arc::new(process_creators), ResourceScope::Process);
        let pools = Arc::new(PoolResource::new(config.pool.clone()));
        process.insert_ref(POOL_RESOURCE, Arc::clone(&pools) as ResourceRef);

        let mut creators = CreatorRegistry::new();
        creators.post_init()?;
        let creators = Arc::new(creators);
        let resources = ResourceMap::child(&process, Arc::clone(&creators), ResourceScope::Snapshot)?;
        let snapshot = Snapshot {
            id: 0,
            kernels: Arc::new(kernels),
            creators,
            resources,
            codecs: Arc::new(DataCodecs::with_builtins()),
            inflight: AtomicUsize::new(0),
        };

        tracing::info!(
            instance = config.instance_id,
            queues = ?queues.names().collect::<Vec<_>>(),
            "Engine started"
        );
        Ok(Arc::new(Self {
            monitor: Arc::new(Mutex::new(ExecutionMonitor::new(config.history))),
            config,
            queues,
            timers,
            pools,
            process,
            snapshot: ArcSwap::from_pointee(snapshot),
            next_snapshot: AtomicU64::new(1),
            forker: RwLock::new(None),
            next_query: AtomicU64::new(1),
        }))
    }

    /// Engine configuration
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Install the forker used for nodes placed on remote peers
    pub fn set_forker(&self, forker: Arc<dyn SubGraphForker>) {
        *self.forker.write() = Some(forker);
    }

    /// Issue a fresh session for this engine's instance
    pub fn new_session(&self) -> SessionId {
        SessionId::new(
            self.config.instance_id,
            self.next_query.fetch_add(1, Ordering::SeqCst),
        )
    }

    /// Build and start a graph.
    ///
    /// Nodes placed on remote peers are split off and handed to the forker;
    /// a fork that fails cancels the graph with the peer as origin rather
    /// than failing the call.
    ///
    /// # Errors
    ///
    /// Returns error if the definition is invalid, a node cannot be built,
    /// or remote nodes exist without a forker
    pub fn run_graph(&self, def: GraphDef, options: RunOptions) -> GraphResult<GraphHandle> {
        def.validate()?;
        let session = options.session.unwrap_or_else(|| self.new_session());
        let (local, remotes) = if def.has_remote_nodes() {
            let split = fork::split(&def)?;
            (split.local, split.remotes)
        } else {
            (def, Vec::new())
        };
        let forker = if remotes.is_empty() {
            None
        } else {
            match self.forker.read().clone() {
                Some(forker) => Some(forker),
                None => {
                    return Err(GraphError::NoForker {
                        peer: remotes[0].peer.clone(),
                    });
                }
            }
        };

        let snapshot = self.snapshot.load_full();
        let queue = self.queues.get(&options.task_queue);
        let graph = Graph::build(
            &local,
            BuildContext {
                kernels: &snapshot.kernels,
                creators: &snapshot.creators,
                snapshot_resources: &snapshot.resources,
                codecs: Arc::clone(&snapshot.codecs),
                pools: &self.pools,
                queue,
                session,
            },
        )
        .inspect_err(|e| tracing::error!(session = %session, error = %e, "Graph build failed"))?;

        if let Some(outlet) = options.default_outlet {
            graph.border().set_default_outlet(outlet);
        }

        snapshot.inflight.fetch_add(1, Ordering::SeqCst);
        self.monitor.lock().metrics_mut().record_start();
        let monitor = Arc::clone(&self.monitor);
        let held = Arc::clone(&snapshot);
        graph.on_finish(move |outcome| {
            monitor.lock().metrics_mut().record_outcome(outcome);
            held.inflight.fetch_sub(1, Ordering::SeqCst);
        });

        let handle = GraphHandle::new(Arc::clone(&graph));
        if let Some(forker) = forker {
            for remote in remotes {
                let peer = remote.peer.clone();
                let request = ForkRequest {
                    peer: remote.peer,
                    task_queue: remote.task_queue,
                    session,
                    def: remote.def,
                    graph: handle.clone(),
                };
                match forker.fork(request) {
                    Ok(outlet) => graph.border().add_outlet(&peer, outlet),
                    Err(reason) => {
                        tracing::warn!(graph = %graph.id(), peer = %peer, reason = %reason, "Fork failed");
                        graph.cancel_with(GraphStatus::Cancelled { origin: peer });
                    }
                }
            }
        }

        let timeout_ms = if local.timeout_ms > 0 {
            local.timeout_ms
        } else {
            options.timeout_ms.unwrap_or(self.config.default_timeout_ms)
        };
        graph.start(&self.timers, Duration::from_millis(timeout_ms));
        Ok(handle)
    }

    /// Swap in new kernels and resources.
    ///
    /// `root_resources` are placed in the new snapshot map before its
    /// snapshot-scope creators are built. On failure the current snapshot
    /// stays active. On success this waits until every graph started against
    /// the old snapshot finished, then drops the old snapshot.
    ///
    /// # Errors
    ///
    /// Returns error if the creators do not resolve or a snapshot resource
    /// fails to build
    pub async fn update_snapshot(
        &self,
        kernels: KernelRegistry,
        mut creators: CreatorRegistry,
        root_resources: IndexMap<String, ResourceRef>,
    ) -> GraphResult<u64> {
        // Process resources and roots are supplied from outside the registry.
        let mut provided = self.process.visible_names();
        provided.extend(root_resources.keys().cloned());
        creators.post_init_with(provided)?;
        let creators = Arc::new(creators);
        let resources =
            ResourceMap::child(&self.process, Arc::clone(&creators), ResourceScope::Snapshot)?;
        for (name, value) in root_resources {
            resources.insert_ref(name, value);
        }
        let built = resources.build_scope().inspect_err(|e| {
            tracing::error!(error = %e, "Snapshot build failed, keeping current snapshot");
        })?;

        let id = self.next_snapshot.fetch_add(1, Ordering::SeqCst);
        let codecs = Arc::clone(&self.snapshot.load().codecs);
        let old = self.snapshot.swap(Arc::new(Snapshot {
            id,
            kernels: Arc::new(kernels),
            creators,
            resources,
            codecs,
            inflight: AtomicUsize::new(0),
        }));
        tracing::info!(snapshot = id, resources = built, previous = old.id, "Snapshot installed");

        let poll = Duration::from_millis(self.config.drain_poll_ms.max(1));
        while old.inflight() > 0 {
            tokio::time::sleep(poll).await;
        }
        old.resources.clear();
        tracing::info!(snapshot = old.id, "Previous snapshot drained");
        Ok(id)
    }

    /// The current snapshot
    #[must_use]
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.load_full()
    }

    /// The process-scope resource map
    #[must_use]
    pub fn process_resources(&self) -> &Arc<ResourceMap> {
        &self.process
    }

    /// Task queues
    #[must_use]
    pub fn queues(&self) -> &Arc<TaskQueueManager> {
        &self.queues
    }

    /// Task queue by name, falling back to the default queue
    #[must_use]
    pub fn queue(&self, name: &str) -> Arc<TaskQueue> {
        self.queues.get(name)
    }

    /// Timer service
    #[must_use]
    pub fn timers(&self) -> &Arc<TimerService> {
        &self.timers
    }

    /// Pool resource
    #[must_use]
    pub fn pools(&self) -> &Arc<PoolResource> {
        &self.pools
    }

    /// Counters so far
    #[must_use]
    pub fn metrics(&self) -> Metrics {
        self.monitor.lock().metrics().clone()
    }

    /// Capture queue and pool statistics with the current counters
    pub fn capture_telemetry(&self) -> Telemetry {
        let queues = self.queues.stats();
        let pool = self.pools.stats();
        self.monitor.lock().capture_telemetry(queues, pool)
    }

    /// Stop task queues and the timer service
    pub fn shutdown(&self) {
        self.queues.stop_all();
        self.timers.shutdown();
        self.snapshot.load().resources.clear();
        tracing::info!(instance = self.config.instance_id, "Engine stopped");
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("queues", &self.queues)
            .field("snapshot", &self.snapshot.load().id)
            .finish_non_exhaustive()
    }
}
