//! Node execution and termination.

use crate::data::Data;
use crate::graph::{Graph, GraphOutcome};
use crate::kernel::{ComputeContext, ComputeStatus};
use crate::node::{Node, NodeState};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use trellis_core::{ErrorStrategy, GraphStatus, NodeId};

impl Graph {
    /// Run one `compute` of a claimed node and act on its status
    pub(crate) fn run_node(self: &Arc<Self>, id: NodeId) {
        let Some(node) = self.node(id) else {
            return;
        };
        if self.is_cancelled() {
            self.abort_node(id);
            return;
        }

        node.set_state(NodeState::Running);
        node.bitmap.disarm_pipes();
        let (result, outputs) = {
            let mut kernel = node.kernel.lock();
            let mut ctx = ComputeContext::new(self, node);
            let result = kernel.compute(&mut ctx);
            (result, ctx.into_outputs())
        };
        node.record_compute();
        self.flush(node, outputs);

        match result {
            Ok(ComputeStatus::Continue) => {
                node.set_state(NodeState::Idle);
                node.release();
                self.try_schedule(id);
            }
            Ok(ComputeStatus::Suspended) => {
                node.bitmap.arm_pipes();
                node.set_state(NodeState::Suspended);
                node.release();
                self.try_schedule(id);
            }
            Ok(ComputeStatus::Finished) => self.finish_node(id),
            Ok(ComputeStatus::Aborted) => self.fail_node(id, "aborted by kernel".to_string()),
            Err(e) => self.fail_node(id, e.to_string()),
        }
    }

    /// Hand buffered outputs to every connected input, in emission order
    fn flush(self: &Arc<Self>, node: &Node, outputs: Vec<Vec<Data>>) {
        for (port, items) in node.outputs.iter().zip(outputs) {
            if items.is_empty() {
                continue;
            }
            for &(target, input) in &port.targets {
                if let Some(consumer) = self.node(target) {
                    if let Some(slot) = consumer.inputs.get(input) {
                        slot.push(&items);
                    }
                }
                self.try_schedule(target);
            }
        }
    }

    /// Signal end of stream on every connected input
    fn close_outputs(self: &Arc<Self>, node: &Node) {
        for port in &node.outputs {
            for &(target, input) in &port.targets {
                if let Some(slot) = self.node(target).and_then(|n| n.inputs.get(input)) {
                    slot.close_producer();
                }
                self.try_schedule(target);
            }
        }
    }

    pub(crate) fn finish_node(self: &Arc<Self>, id: NodeId) {
        let Some(node) = self.node(id) else {
            return;
        };
        if !node.terminate(NodeState::Finished) {
            return;
        }
        tracing::debug!(graph = %self.id(), node = %node.name, computes = node.compute_count(), "Node finished");
        node.terminate_pipes();
        self.close_outputs(node);
        self.node_terminal();
    }

    /// A kernel failed; apply the graph's error strategy
    pub(crate) fn fail_node(self: &Arc<Self>, id: NodeId, message: String) {
        let Some(node) = self.node(id) else {
            return;
        };
        if !node.terminate(NodeState::Aborted) {
            return;
        }
        tracing::warn!(
            graph = %self.id(),
            node = %node.name,
            kernel = %node.kernel_name,
            error = %message,
            "Kernel failed"
        );
        let status = GraphStatus::KernelError {
            node: node.name.clone(),
            message,
        };
        self.first_error.lock().get_or_insert(status.clone());
        node.terminate_pipes();

        match self.error_strategy {
            ErrorStrategy::AbortScope => self.close_outputs(node),
            ErrorStrategy::AbortGraph => {
                self.cancel_with(status);
            }
        }
        self.node_terminal();
    }

    /// Abort without closing outputs; used once the graph is going down
    pub(crate) fn abort_node(self: &Arc<Self>, id: NodeId) {
        let Some(node) = self.node(id) else {
            return;
        };
        if !node.terminate(NodeState::Aborted) {
            return;
        }
        tracing::debug!(graph = %self.id(), node = %node.name, "Node aborted");
        node.terminate_pipes();
        self.node_terminal();
    }

    fn node_terminal(self: &Arc<Self>) {
        if self.remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.finalize();
        }
    }

    /// Publish the outcome; runs once
    pub(crate) fn finalize(self: &Arc<Self>) {
        if self.finalized.swap(true, Ordering::SeqCst) {
            return;
        }
        let timer = self.timer.lock().take();
        if let Some((timers, handle)) = timer {
            timers.stop_timer(&handle);
        }
        self.arena().release();

        let status = self
            .cancel_status
            .lock()
            .clone()
            .or_else(|| self.first_error.lock().clone())
            .unwrap_or(GraphStatus::Success);
        let computes = self.nodes.iter().map(Node::compute_count).sum();
        let outcome = GraphOutcome {
            status,
            outputs: self.take_collected(),
            computes,
        };
        tracing::info!(
            graph = %self.id(),
            session = %self.session(),
            status = outcome.status.label(),
            computes,
            "Graph finished"
        );

        // Hooks run before waiters wake; ones registered meanwhile are picked
        // up under the lock that publishes the outcome.
        let hooks = std::mem::take(&mut *self.finish_hooks.lock());
        for hook in hooks {
            hook(&outcome);
        }
        let late = {
            let mut hooks = self.finish_hooks.lock();
            self.outcome_tx.send_replace(Some(outcome.clone()));
            std::mem::take(&mut *hooks)
        };
        for hook in late {
            hook(&outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::data::data;
    use crate::engine::{Engine, EngineConfig, RunOptions};
    use crate::node::NodeState;
    use serde_json::json;
    use trellis_core::{ErrorStrategy, GraphDef, GraphStatus, NodeDef};

    fn source(name: &str, values: serde_json::Value) -> NodeDef {
        NodeDef::new(name, "source").with_config(json!({ "values": values, "type": "i64" }))
    }

    #[tokio::test]
    async fn test_chain_delivers_in_order() {
        let engine = Engine::new(EngineConfig::default()).unwrap();
        let def = GraphDef::new()
            .with_node(
                NodeDef::new("a", "source")
                    .with_config(json!({ "values": [1, 2, 3, 4], "type": "i64", "batch": 1 })),
            )
            .with_node(NodeDef::new("b", "passthrough"))
            .with_node(NodeDef::new("c", "collect"))
            .with_edge("a", "out", "b", "in")
            .with_edge("b", "out", "c", "in");
        let handle = engine.run_graph(def, RunOptions::default()).unwrap();
        let outcome = handle.wait().await;

        assert_eq!(outcome.status, GraphStatus::Success);
        assert_eq!(outcome.values::<i64>("c"), vec![1, 2, 3, 4]);
        assert_eq!(handle.node_state("b"), Some(NodeState::Finished));
        assert!(handle.compute_count("a").unwrap() >= 4);
    }

    #[tokio::test]
    async fn test_fan_in_waits_for_both_inputs() {
        let engine = Engine::new(EngineConfig::default()).unwrap();
        let def = GraphDef::new()
            .with_node(source("x", json!([1, 2])))
            .with_node(source("y", json!([3])))
            .with_node(NodeDef::new("c", "collect"))
            .with_edge("x", "out", "c", "in")
            .with_edge("y", "out", "c", "in");
        let outcome = engine
            .run_graph(def, RunOptions::default())
            .unwrap()
            .wait()
            .await;
        let mut values = outcome.values::<i64>("c");
        values.sort_unstable();
        assert_eq!(values, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_abort_scope_lets_rest_finish() {
        let engine = Engine::new(EngineConfig::default()).unwrap();
        let def = GraphDef::new()
            .with_node(NodeDef::new("bad", "fail").with_config(json!({ "message": "boom" })))
            .with_node(source("good", json!([7])))
            .with_node(NodeDef::new("c1", "collect"))
            .with_node(NodeDef::new("c2", "collect"))
            .with_edge("bad", "out", "c1", "in")
            .with_edge("good", "out", "c2", "in");
        let handle = engine.run_graph(def, RunOptions::default()).unwrap();
        let outcome = handle.wait().await;

        assert_eq!(
            outcome.status,
            GraphStatus::KernelError {
                node: "bad".to_string(),
                message: "boom".to_string()
            }
        );
        assert_eq!(outcome.values::<i64>("c2"), vec![7]);
        assert_eq!(handle.node_state("bad"), Some(NodeState::Aborted));
        assert_eq!(handle.node_state("c1"), Some(NodeState::Finished));
        assert_eq!(handle.node_state("c2"), Some(NodeState::Finished));
    }

    #[tokio::test]
    async fn test_abort_graph_cancels_everything() {
        let engine = Engine::new(EngineConfig::default()).unwrap();
        let def = GraphDef::new()
            .with_error_strategy(ErrorStrategy::AbortGraph)
            .with_node(
                NodeDef::new("bad", "fail").with_config(json!({ "message": "boom", "abort": true })),
            )
            .with_node(NodeDef::new("w", "async_wait"))
            .with_node(NodeDef::new("c", "collect"))
            .with_edge("w", "out", "c", "in");
        let handle = engine.run_graph(def, RunOptions::default()).unwrap();
        let outcome = handle.wait().await;

        assert_eq!(
            outcome.status,
            GraphStatus::KernelError {
                node: "bad".to_string(),
                message: "aborted by kernel".to_string()
            }
        );
        assert!(handle.is_cancelled());
        assert_eq!(handle.node_state("w"), Some(NodeState::Aborted));
        assert_eq!(handle.node_state("c"), Some(NodeState::Aborted));
    }

    #[tokio::test]
    async fn test_pipe_feed_resumes_suspended_node() {
        let engine = Engine::new(EngineConfig::default()).unwrap();
        let def = GraphDef::new()
            .with_node(NodeDef::new("w", "async_wait"))
            .with_node(NodeDef::new("c", "collect"))
            .with_edge("w", "out", "c", "in");
        let handle = engine.run_graph(def, RunOptions::default()).unwrap();

        let pipe = handle.pipe("w", 0).unwrap();
        pipe.set_data(data(serde_json::Value::from("late"))).unwrap();
        pipe.set_eof().unwrap();

        let outcome = handle.wait().await;
        assert_eq!(outcome.status, GraphStatus::Success);
        assert_eq!(
            outcome.values::<serde_json::Value>("c"),
            vec![serde_json::Value::from("late")]
        );
    }

    #[tokio::test]
    async fn test_empty_graph_succeeds() {
        let engine = Engine::new(EngineConfig::default()).unwrap();
        let outcome = engine
            .run_graph(GraphDef::new(), RunOptions::default())
            .unwrap()
            .wait()
            .await;
        assert_eq!(outcome.status, GraphStatus::Success);
        assert_eq!(outcome.computes, 0);
    }
}
