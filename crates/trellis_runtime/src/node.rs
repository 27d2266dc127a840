//! Live nodes: a kernel instance with its ports, pipes and readiness.

use crate::bitmap::ReadyBitMap;
use crate::data::Data;
use crate::kernel::Kernel;
use crate::pipe::AsyncPipe;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use trellis_core::NodeId;

/// Node lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeState {
    /// Waiting for readiness
    Idle = 0,
    /// Claimed and queued
    Scheduled = 1,
    /// Inside `compute`
    Running = 2,
    /// Waiting on async pipes
    Suspended = 3,
    /// Completed
    Finished = 4,
    /// Failed or cancelled
    Aborted = 5,
}

impl NodeState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Scheduled,
            2 => Self::Running,
            3 => Self::Suspended,
            4 => Self::Finished,
            _ => Self::Aborted,
        }
    }

    /// Whether the node will never compute again
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Aborted)
    }
}

#[derive(Debug)]
struct InputState {
    queue: VecDeque<Data>,
    open_producers: usize,
}

/// An input port; its readiness bit is kept in step with the queue
pub(crate) struct InputPort {
    pub(crate) name: String,
    pub(crate) type_id: String,
    slot: usize,
    bitmap: Arc<ReadyBitMap>,
    state: Mutex<InputState>,
}

impl InputPort {
    pub(crate) fn new(
        name: String,
        type_id: String,
        slot: usize,
        producers: usize,
        bitmap: Arc<ReadyBitMap>,
    ) -> Self {
        let port = Self {
            name,
            type_id,
            slot,
            bitmap,
            state: Mutex::new(InputState {
                queue: VecDeque::new(),
                open_producers: producers,
            }),
        };
        let state = port.state.lock();
        port.refresh(&state);
        drop(state);
        port
    }

    // A port with nothing queued is still ready once every producer closed,
    // so the kernel gets to observe EOF.
    fn refresh(&self, state: &InputState) {
        self.bitmap
            .assign(self.slot, !state.queue.is_empty() || state.open_producers == 0);
    }

    pub(crate) fn push(&self, items: &[Data]) {
        let mut state = self.state.lock();
        state.queue.extend(items.iter().cloned());
        self.refresh(&state);
    }

    pub(crate) fn close_producer(&self) {
        let mut state = self.state.lock();
        state.open_producers = state.open_producers.saturating_sub(1);
        self.refresh(&state);
    }

    pub(crate) fn pop(&self) -> Option<Data> {
        let mut state = self.state.lock();
        let item = state.queue.pop_front();
        self.refresh(&state);
        item
    }

    pub(crate) fn drain(&self) -> Vec<Data> {
        let mut state = self.state.lock();
        let items = state.queue.drain(..).collect();
        self.refresh(&state);
        items
    }

    pub(crate) fn peek(&self, index: usize) -> Option<Data> {
        self.state.lock().queue.get(index).cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub(crate) fn is_eof(&self) -> bool {
        let state = self.state.lock();
        state.queue.is_empty() && state.open_producers == 0
    }
}

/// An output port and the inputs it feeds
#[derive(Debug, Clone)]
pub(crate) struct OutputPort {
    pub(crate) name: String,
    pub(crate) type_id: String,
    pub(crate) targets: Vec<(NodeId, usize)>,
}

pub(crate) struct Node {
    pub(crate) id: NodeId,
    pub(crate) name: String,
    pub(crate) kernel_name: String,
    pub(crate) kernel: Mutex<Box<dyn Kernel>>,
    pub(crate) inputs: Vec<InputPort>,
    pub(crate) outputs: Vec<OutputPort>,
    pub(crate) pipes: Vec<Arc<AsyncPipe>>,
    pub(crate) resources: IndexMap<String, bool>,
    pub(crate) bitmap: Arc<ReadyBitMap>,
    scheduled: AtomicBool,
    state: AtomicU8,
    compute_count: AtomicU64,
}

impl Node {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: NodeId,
        name: String,
        kernel_name: String,
        kernel: Box<dyn Kernel>,
        inputs: Vec<InputPort>,
        outputs: Vec<OutputPort>,
        pipes: Vec<Arc<AsyncPipe>>,
        resources: IndexMap<String, bool>,
        bitmap: Arc<ReadyBitMap>,
    ) -> Self {
        Self {
            id,
            name,
            kernel_name,
            kernel: Mutex::new(kernel),
            inputs,
            outputs,
            pipes,
            resources,
            bitmap,
            scheduled: AtomicBool::new(false),
            state: AtomicU8::new(NodeState::Idle as u8),
            compute_count: AtomicU64::new(0),
        }
    }

    /// Take the exclusive right to run the node
    pub(crate) fn claim(&self) -> bool {
        self.scheduled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Give up the claim; terminal nodes keep it forever
    pub(crate) fn release(&self) {
        if !self.state().is_terminal() {
            self.scheduled.store(false, Ordering::SeqCst);
        }
    }

    pub(crate) fn state(&self) -> NodeState {
        NodeState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: NodeState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Move to a terminal state; false if already terminal
    pub(crate) fn terminate(&self, state: NodeState) -> bool {
        let mut current = self.state.load(Ordering::SeqCst);
        loop {
            if NodeState::from_u8(current).is_terminal() {
                return false;
            }
            match self.state.compare_exchange(
                current,
                state as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.bitmap.is_ready()
    }

    pub(crate) fn record_compute(&self) {
        self.compute_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn compute_count(&self) -> u64 {
        self.compute_count.load(Ordering::Relaxed)
    }

    pub(crate) fn terminate_pipes(&self) {
        for pipe in &self.pipes {
            pipe.terminate();
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kernel", &self.kernel_name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::data;

    #[test]
    fn test_input_port_readiness() {
        let bitmap = Arc::new(ReadyBitMap::new(1, 0));
        let port = InputPort::new("in".into(), "*".into(), 0, 1, Arc::clone(&bitmap));
        assert!(!bitmap.is_ready());

        port.push(&[data(1i64), data(2i64)]);
        assert!(bitmap.is_ready());
        assert_eq!(port.len(), 2);
        assert!(port.peek(1).is_some());

        port.pop();
        port.pop();
        assert!(!bitmap.is_ready());
        assert!(!port.is_eof());

        port.close_producer();
        assert!(bitmap.is_ready());
        assert!(port.is_eof());
    }

    #[test]
    fn test_unconnected_input_is_eof() {
        let bitmap = Arc::new(ReadyBitMap::new(1, 0));
        let port = InputPort::new("in".into(), "*".into(), 0, 0, Arc::clone(&bitmap));
        assert!(port.is_eof());
        assert!(bitmap.is_ready());
    }

    #[test]
    fn test_state_roundtrip() {
        for state in [
            NodeState::Idle,
            NodeState::Scheduled,
            NodeState::Running,
            NodeState::Suspended,
            NodeState::Finished,
            NodeState::Aborted,
        ] {
            assert_eq!(NodeState::from_u8(state as u8), state);
        }
        assert!(NodeState::Finished.is_terminal());
        assert!(!NodeState::Suspended.is_terminal());
    }
}
