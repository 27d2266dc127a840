//! Process lifecycle: wires the engine to the stream layer and runs the
//! periodic pool sample and report loops.

use crate::config::{ConfigError, ServerConfig};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use trellis_resource::{CreatorRegistry, ResourceRef};
use trellis_runtime::{
    BackpressureController, Engine, GraphError, KernelRegistry, SubGraphForker,
};
use trellis_stream::{
    Connector, StreamError, StreamForker, StreamServer, TcpConnector, TransportError, serve_tcp,
};

/// Service errors
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Configuration rejected
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Engine construction or snapshot update failed
    #[error("Engine error: {0}")]
    Graph(#[from] GraphError),

    /// Stream server failed
    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    /// Listener failed
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Result type for service operations
pub type ServiceResult<T> = Result<T, ServiceError>;

/// A running worker process
pub struct Service {
    config: ServerConfig,
    engine: Arc<Engine>,
    server: Arc<StreamServer>,
    shutdown: watch::Sender<bool>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl Service {
    /// Start the engine, the stream server and the background loops.
    ///
    /// Sub-graphs placed on other peers are forked through `connector`.
    /// Must be called from inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if the config is invalid, the engine cannot start or no
    /// runtime is available
    pub fn init(config: ServerConfig, connector: Arc<dyn Connector>) -> ServiceResult<Arc<Self>> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|e| StreamError::NoRuntime(e.to_string()))?;

        let engine = Engine::new(config.engine_config())?;
        engine.set_forker(
            Arc::new(StreamForker::new(connector, runtime.clone())) as Arc<dyn SubGraphForker>
        );
        let server = StreamServer::with_runtime(
            Arc::clone(&engine),
            config.stream_config(),
            runtime.clone(),
        );

        let (shutdown, _) = watch::channel(false);
        let loops = vec![
            runtime.spawn(pool_sample_loop(
                Arc::clone(&engine),
                Duration::from_millis(config.pool_sample_interval_ms),
                shutdown.subscribe(),
            )),
            runtime.spawn(report_loop(
                Arc::clone(&engine),
                Duration::from_millis(config.report_interval_ms),
                BackpressureController::new(config.backpressure_threshold),
                shutdown.subscribe(),
            )),
        ];

        tracing::info!(
            instance = config.instance_id,
            listen = %config.listen,
            peers = config.peers.len(),
            "Service started"
        );
        Ok(Arc::new(Self {
            config,
            engine,
            server,
            shutdown,
            loops: Mutex::new(loops),
        }))
    }

    /// Load the config file and start
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be loaded or the service cannot start
    pub fn init_from_path(
        path: impl AsRef<Path>,
        connector: Arc<dyn Connector>,
    ) -> ServiceResult<Arc<Self>> {
        Self::init(ServerConfig::load(path)?, connector)
    }

    /// Configuration in effect
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The engine
    #[must_use]
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// The stream server accepting forked sub-graphs
    #[must_use]
    pub fn stream_server(&self) -> &Arc<StreamServer> {
        &self.server
    }

    /// Hot-swap kernels and resources
    ///
    /// Resolves once graphs still running on the previous snapshot finished.
    ///
    /// # Errors
    ///
    /// Returns error if the new snapshot cannot be built; the current one
    /// stays active
    pub async fn update(
        &self,
        kernels: KernelRegistry,
        creators: CreatorRegistry,
        root_resources: IndexMap<String, ResourceRef>,
    ) -> ServiceResult<u64> {
        let id = self
            .engine
            .update_snapshot(kernels, creators, root_resources)
            .await?;
        Ok(id)
    }

    /// Accept TCP streams until `shutdown` completes
    ///
    /// # Errors
    ///
    /// Returns error if accepting fails
    pub async fn serve(
        &self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> ServiceResult<()> {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(addr = %addr, "Listening for streams");
        }
        serve_tcp(listener, Arc::clone(&self.server), shutdown).await?;
        Ok(())
    }

    /// Drain streams, stop the background loops and the engine
    pub async fn stop(&self) {
        tracing::info!(outstanding = self.server.outstanding(), "Stopping service");
        self.server.stop().await;

        self.shutdown.send_replace(true);
        let loops = std::mem::take(&mut *self.loops.lock());
        for handle in loops {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Background loop ended abnormally");
            }
        }

        self.engine.shutdown();
        tracing::info!("Service stopped");
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("config", &self.config)
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

/// TCP connector for the peers listed in `config`
#[must_use]
pub fn tcp_connector(config: &ServerConfig, runtime: Handle) -> TcpConnector {
    config
        .peers
        .iter()
        .fold(TcpConnector::new(runtime), |connector, (peer, addr)| {
            connector.with_peer(peer.clone(), *addr)
        })
}

fn ticker(every: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn stopping(shutdown: &mut watch::Receiver<bool>) -> bool {
    shutdown.changed().await.is_err() || *shutdown.borrow()
}

async fn pool_sample_loop(
    engine: Arc<Engine>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = ticker(every);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let sample = engine.pools().sample();
                if sample.trimmed > 0 {
                    tracing::debug!(
                        spread = sample.spread,
                        limit = sample.limit,
                        trimmed = sample.trimmed,
                        "Pool cache trimmed"
                    );
                }
            }
            stop = stopping(&mut shutdown) => if stop { break },
        }
    }
}

async fn report_loop(
    engine: Arc<Engine>,
    every: Duration,
    backpressure: BackpressureController,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = ticker(every);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let telemetry = engine.capture_telemetry();
                backpressure.inspect(&telemetry.queues);
                for queue in &telemetry.queues {
                    tracing::info!(
                        queue = %queue.name,
                        active_threads = queue.active_threads,
                        processing = queue.processing_count,
                        waiting = queue.queue_count,
                        "Task queue"
                    );
                }
                let metrics = &telemetry.metrics;
                tracing::info!(
                    started = metrics.graphs_started,
                    running = metrics.graphs_running(),
                    succeeded = metrics.graphs_succeeded,
                    kernel_errors = metrics.kernel_errors,
                    timeouts = metrics.timeouts,
                    cancelled = metrics.cancelled,
                    rejected = metrics.rejected,
                    pool_in_use = telemetry.pool.in_use,
                    pool_cached = telemetry.pool.cached,
                    pool_limit = telemetry.pool.limit,
                    "Report"
                );
            }
            stop = stopping(&mut shutdown) => if stop { break },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use trellis_core::{GraphDef, GraphStatus, NodeDef};
    use trellis_runtime::RunOptions;
    use trellis_stream::LocalConnector;

    fn quick_config() -> ServerConfig {
        ServerConfig::default()
            .with_report_interval_ms(5)
            .with_pool_sample_interval_ms(5)
    }

    fn chain(remote: Option<&str>) -> GraphDef {
        let middle = NodeDef::new("b", "passthrough");
        let middle = match remote {
            Some(peer) => middle.on_peer(peer, "default"),
            None => middle,
        };
        GraphDef::new()
            .with_node(
                NodeDef::new("a", "source").with_config(json!({ "values": [1, 2], "type": "i64" })),
            )
            .with_node(middle)
            .with_node(NodeDef::new("c", "collect"))
            .with_edge("a", "out", "b", "in")
            .with_edge("b", "out", "c", "in")
    }

    #[tokio::test]
    async fn test_init_runs_graphs_and_stops() {
        let service = Service::init(quick_config(), Arc::new(LocalConnector::new())).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let outcome = service
            .engine()
            .run_graph(chain(None), RunOptions::default())
            .unwrap()
            .wait()
            .await;
        assert_eq!(outcome.status, GraphStatus::Success);
        assert_eq!(outcome.values::<i64>("c"), vec![1, 2]);

        service.stop().await;
        assert!(service.loops.lock().is_empty());
        assert_eq!(service.engine().metrics().graphs_succeeded, 1);
    }

    #[tokio::test]
    async fn test_init_rejects_invalid_config() {
        let config = ServerConfig::default().with_listen("not an address");
        assert!(matches!(
            Service::init(config, Arc::new(LocalConnector::new())),
            Err(ServiceError::Config(_))
        ));
    }

    #[test]
    fn test_init_needs_runtime() {
        assert!(matches!(
            Service::init(ServerConfig::default(), Arc::new(LocalConnector::new())),
            Err(ServiceError::Stream(StreamError::NoRuntime(_)))
        ));
    }

    #[tokio::test]
    async fn test_init_from_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        let err = Service::init_from_path(dir.path().join("none.json"), Arc::new(LocalConnector::new()))
            .unwrap_err();
        assert!(matches!(err, ServiceError::Config(ConfigError::Io { .. })));
    }

    #[tokio::test]
    async fn test_update_swaps_snapshot() {
        let service = Service::init(quick_config(), Arc::new(LocalConnector::new())).unwrap();
        let mut roots = IndexMap::new();
        roots.insert("motd".to_string(), Arc::new("hi".to_string()) as ResourceRef);
        let id = service
            .update(KernelRegistry::with_builtins(), CreatorRegistry::new(), roots)
            .await
            .unwrap();
        assert_eq!(id, 1);
        assert_eq!(service.engine().snapshot().id(), 1);
        assert!(service.engine().snapshot().resources().contains("motd"));
        service.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_fork_between_services_over_tcp() {
        let worker = Service::init(quick_config().with_instance_id(2), Arc::new(LocalConnector::new()))
            .unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let serving = {
            let worker = Arc::clone(&worker);
            tokio::spawn(async move {
                worker
                    .serve(listener, async move {
                        let _ = stop_rx.await;
                    })
                    .await
            })
        };

        let config = quick_config().with_instance_id(1).with_peer("worker", addr);
        let connector = tcp_connector(&config, Handle::current());
        let caller = Service::init(config, Arc::new(connector)).unwrap();
        let outcome = caller
            .engine()
            .run_graph(chain(Some("worker")), RunOptions::default())
            .unwrap()
            .wait()
            .await;
        assert_eq!(outcome.status, GraphStatus::Success);
        assert_eq!(outcome.values::<i64>("c"), vec![1, 2]);

        stop_tx.send(()).unwrap();
        serving.await.unwrap().unwrap();
        caller.stop().await;
        worker.stop().await;
        assert_eq!(worker.engine().metrics().graphs_succeeded, 1);
    }
}
