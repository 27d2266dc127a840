//! Forking sub-graphs to a second engine in the same process.

use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use trellis_core::{GraphDef, GraphStatus, NodeDef};
use trellis_runtime::{
    BorderOutlet, Engine, EngineConfig, ForkRequest, GraphHandle, HubOutlet, RunOptions,
    SubGraphForker,
};

/// Runs every fork on `peer`, wiring the two border hubs to each other
struct Loopback {
    peer: Arc<Engine>,
    forked: Mutex<Vec<GraphHandle>>,
}

impl SubGraphForker for Loopback {
    fn fork(&self, request: ForkRequest) -> Result<Arc<dyn BorderOutlet>, String> {
        let caller = request.graph.border();
        let options = RunOptions::default()
            .with_session(request.session)
            .with_task_queue(request.task_queue)
            .with_default_outlet(Arc::new(HubOutlet::new(&caller)));
        let remote = self
            .peer
            .run_graph(request.def, options)
            .map_err(|e| e.to_string())?;

        let cancel = remote.clone();
        request.graph.on_cancel(move |_| {
            cancel.cancel_from("upstream");
        });
        let outlet = HubOutlet::new(&remote.border());
        self.forked.lock().push(remote);
        Ok(Arc::new(outlet))
    }
}

struct Unreachable;

impl SubGraphForker for Unreachable {
    fn fork(&self, request: ForkRequest) -> Result<Arc<dyn BorderOutlet>, String> {
        Err(format!("{} unreachable", request.peer))
    }
}

fn engines() -> (Arc<Engine>, Arc<Loopback>) {
    let local = Engine::new(EngineConfig::default().with_instance_id(1)).unwrap();
    let forker = Arc::new(Loopback {
        peer: Engine::new(EngineConfig::default().with_instance_id(2)).unwrap(),
        forked: Mutex::new(Vec::new()),
    });
    local.set_forker(Arc::clone(&forker) as Arc<dyn SubGraphForker>);
    (local, forker)
}

#[tokio::test]
async fn test_remote_node_round_trip() {
    let (local, forker) = engines();
    let def = GraphDef::new()
        .with_node(
            NodeDef::new("a", "source").with_config(json!({ "values": [1, 2, 3], "type": "i64" })),
        )
        .with_node(NodeDef::new("b", "passthrough").on_peer("p1", "default"))
        .with_node(NodeDef::new("c", "collect"))
        .with_edge("a", "out", "b", "in")
        .with_edge("b", "out", "c", "in");
    let handle = local.run_graph(def, RunOptions::default()).unwrap();
    let outcome = handle.wait().await;

    assert_eq!(outcome.status, GraphStatus::Success);
    assert_eq!(outcome.values::<i64>("c"), vec![1, 2, 3]);

    let remote = forker.forked.lock().pop().unwrap();
    assert_eq!(remote.session(), handle.session());
    assert_eq!(remote.wait().await.status, GraphStatus::Success);
}

#[tokio::test]
async fn test_cancel_reaches_remote_graph() {
    let (local, forker) = engines();
    let def = GraphDef::new()
        .with_node(NodeDef::new("w", "async_wait"))
        .with_node(NodeDef::new("r", "passthrough").on_peer("p1", "default"))
        .with_node(NodeDef::new("c", "collect"))
        .with_edge("w", "out", "r", "in")
        .with_edge("r", "out", "c", "in");
    let handle = local.run_graph(def, RunOptions::default()).unwrap();
    handle.cancel();

    let outcome = handle.wait().await;
    assert_eq!(
        outcome.status,
        GraphStatus::Cancelled {
            origin: "caller".to_string()
        }
    );
    let remote = forker.forked.lock().pop().unwrap();
    assert_eq!(
        remote.wait().await.status,
        GraphStatus::Cancelled {
            origin: "upstream".to_string()
        }
    );
}

#[tokio::test]
async fn test_failed_fork_cancels_with_peer_origin() {
    let local = Engine::new(EngineConfig::default()).unwrap();
    local.set_forker(Arc::new(Unreachable));
    let def = GraphDef::new()
        .with_node(NodeDef::new("a", "source").with_config(json!({ "values": [1] })))
        .with_node(NodeDef::new("b", "collect").on_peer("p9", "default"))
        .with_edge("a", "out", "b", "in");
    let handle = local.run_graph(def, RunOptions::default()).unwrap();
    assert_eq!(
        handle.wait().await.status,
        GraphStatus::Cancelled {
            origin: "p9".to_string()
        }
    );
}
