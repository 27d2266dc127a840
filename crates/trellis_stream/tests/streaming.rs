//! Forking sub-graphs through the stream protocol.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use trellis_core::{GraphDef, GraphStatus, NodeDef};
use trellis_runtime::{Engine, EngineConfig, RunOptions, SubGraphForker};
use trellis_stream::{
    Connector, LocalConnector, StreamForker, StreamServer, StreamServerConfig, TcpConnector,
    serve_tcp,
};

fn engine(instance: u64) -> Arc<Engine> {
    Engine::new(EngineConfig::default().with_instance_id(instance)).unwrap()
}

fn caller(connector: Arc<dyn Connector>) -> Arc<Engine> {
    let local = engine(1);
    local.set_forker(Arc::new(StreamForker::new(connector, Handle::current())) as Arc<dyn SubGraphForker>);
    local
}

fn round_trip() -> GraphDef {
    GraphDef::new()
        .with_node(
            NodeDef::new("a", "source").with_config(json!({ "values": [4, 5, 6], "type": "i64" })),
        )
        .with_node(NodeDef::new("b", "passthrough").on_peer("worker", "default"))
        .with_node(NodeDef::new("c", "collect"))
        .with_edge("a", "out", "b", "in")
        .with_edge("b", "out", "c", "in")
}

fn local_peer(config: StreamServerConfig) -> (Arc<StreamServer>, Arc<LocalConnector>) {
    let server = StreamServer::new(engine(2), config).unwrap();
    let connector = Arc::new(LocalConnector::new());
    connector.add_peer("worker", Arc::clone(&server));
    (server, connector)
}

#[tokio::test]
async fn test_round_trip_async_mode() {
    let (server, connector) = local_peer(StreamServerConfig::default());
    let local = caller(connector);

    let outcome = local
        .run_graph(round_trip(), RunOptions::default())
        .unwrap()
        .wait()
        .await;
    assert_eq!(outcome.status, GraphStatus::Success);
    assert_eq!(outcome.values::<i64>("c"), vec![4, 5, 6]);

    server.stop().await;
    assert_eq!(server.outstanding(), 0);
    assert_eq!(server.engine().metrics().graphs_succeeded, 1);
}

#[tokio::test]
async fn test_round_trip_sync_mode() {
    let (server, connector) = local_peer(StreamServerConfig::default().with_async_mode(false));
    let local = caller(connector);
    let outcome = local
        .run_graph(round_trip(), RunOptions::default())
        .unwrap()
        .wait()
        .await;
    assert_eq!(outcome.values::<i64>("c"), vec![4, 5, 6]);
    server.stop().await;
}

#[tokio::test]
async fn test_local_timeout_cancels_peer() {
    let (server, connector) = local_peer(StreamServerConfig::default().with_stop_poll_ms(1));
    let local = caller(connector);
    let def = GraphDef::new()
        .with_timeout_ms(50)
        .with_node(NodeDef::new("w", "async_wait"))
        .with_node(NodeDef::new("r", "passthrough").on_peer("worker", "default"))
        .with_node(NodeDef::new("c", "collect"))
        .with_edge("w", "out", "r", "in")
        .with_edge("r", "out", "c", "in");

    let outcome = local.run_graph(def, RunOptions::default()).unwrap().wait().await;
    assert_eq!(outcome.status, GraphStatus::Timeout);

    tokio::time::timeout(Duration::from_secs(5), server.stop())
        .await
        .unwrap();
    // The peer inherits the deadline, so it may end by its own timeout
    // rather than the forwarded cancel.
    let metrics = server.engine().metrics();
    assert_eq!(metrics.graphs_started, 1);
    assert_eq!(metrics.graphs_finished(), 1);
    assert_eq!(metrics.graphs_succeeded, 0);
}

#[tokio::test]
async fn test_unknown_peer_cancels_graph() {
    let local = caller(Arc::new(LocalConnector::new()));
    let outcome = local
        .run_graph(round_trip(), RunOptions::default())
        .unwrap()
        .wait()
        .await;
    assert_eq!(
        outcome.status,
        GraphStatus::Cancelled {
            origin: "worker".to_string()
        }
    );
}

#[tokio::test]
async fn test_remote_failure_cancels_caller() {
    let (_server, connector) = local_peer(StreamServerConfig::default());
    let local = caller(connector);
    let def = GraphDef::new()
        .with_node(NodeDef::new("w", "async_wait"))
        .with_node(NodeDef::new("bad", "no_such_kernel").on_peer("worker", "default"))
        .with_node(NodeDef::new("c", "collect"))
        .with_edge("w", "out", "bad", "in")
        .with_edge("bad", "out", "c", "in");
    let outcome = local.run_graph(def, RunOptions::default()).unwrap().wait().await;
    assert_eq!(
        outcome.status,
        GraphStatus::Cancelled {
            origin: "worker".to_string()
        }
    );
}

#[tokio::test]
async fn test_stopped_server_refuses() {
    let (server, connector) = local_peer(StreamServerConfig::default());
    server.stop().await;
    assert!(connector.connect("worker").is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_round_trip_over_tcp() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = StreamServer::new(engine(2), StreamServerConfig::default()).unwrap();
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let serving = tokio::spawn(serve_tcp(listener, Arc::clone(&server), async move {
        let _ = stop_rx.await;
    }));

    let connector = TcpConnector::new(Handle::current()).with_peer("worker", addr);
    let local = caller(Arc::new(connector));
    let outcome = local
        .run_graph(round_trip(), RunOptions::default())
        .unwrap()
        .wait()
        .await;
    assert_eq!(outcome.status, GraphStatus::Success);
    assert_eq!(outcome.values::<i64>("c"), vec![4, 5, 6]);

    stop_tx.send(()).unwrap();
    serving.await.unwrap().unwrap();
}
