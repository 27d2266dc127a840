//! Readiness scheduling and cancellation.
//!
//! A node is pushed to the graph's task queue when every required readiness
//! bit is set and it wins the claim flag. The claim is the only thing that
//! serializes `compute`: whoever holds it is the single party allowed to
//! run or terminate the node. Anyone who changes a node's readiness calls
//! `try_schedule` afterwards, so a wakeup that races with a running compute
//! is picked up when the runner releases the claim and tries again.

use crate::graph::Graph;
use crate::node::NodeState;
use crate::task_queue::ScheduleItem;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use trellis_core::{GraphStatus, NodeId};

impl Graph {
    /// Queue `id` if it is ready and unclaimed
    pub(crate) fn try_schedule(self: &Arc<Self>, id: NodeId) {
        let Some(node) = self.node(id) else {
            return;
        };
        if node.state().is_terminal() {
            return;
        }
        if self.is_cancelled() {
            if node.claim() {
                self.abort_node(id);
            }
            return;
        }
        if !node.is_ready() || !node.claim() {
            return;
        }

        node.set_state(NodeState::Scheduled);
        let runner = Arc::clone(self);
        let rejecter = Arc::clone(self);
        let item = ScheduleItem::new(
            move || runner.run_node(id),
            move || rejecter.on_admission_rejected(id),
        );
        if let Err(e) = self.queue.push(item) {
            tracing::debug!(graph = %self.id(), node = %node.name, error = %e, "Node not admitted");
        }
    }

    /// The queue refused or dropped a node's work item
    fn on_admission_rejected(self: &Arc<Self>, id: NodeId) {
        let Some(node) = self.node(id) else {
            return;
        };
        tracing::warn!(graph = %self.id(), node = %node.name, "Admission rejected, cancelling graph");
        self.cancel_with(GraphStatus::AdmissionRejected {
            node: node.name.clone(),
        });
        self.abort_node(id);
    }

    /// Cancel the graph; the first status wins. Returns whether this call
    /// performed the cancellation.
    pub(crate) fn cancel_with(self: &Arc<Self>, status: GraphStatus) -> bool {
        let hooks = {
            let mut hooks = self.cancel_hooks.lock();
            if self.finalized.load(Ordering::SeqCst) || self.cancelled.swap(true, Ordering::SeqCst)
            {
                return false;
            }
            *self.cancel_status.lock() = Some(status.clone());
            std::mem::take(&mut *hooks)
        };
        tracing::info!(graph = %self.id(), status = status.label(), "Graph cancelled");

        for hook in hooks {
            hook(&status);
        }
        for node in &self.nodes {
            if node.claim() {
                self.abort_node(node.id);
            }
        }
        true
    }
}
