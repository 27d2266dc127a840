//! Async pipe: the suspension primitive of one node.
//!
//! An async kernel returns `Suspended` when it has nothing to do; the node
//! then waits on its pipes instead of its inputs. Whoever completes the
//! outstanding work feeds the pipe, which flips the node's readiness bit
//! and asks the scheduler to run the node again.

use crate::bitmap::ReadyBitMap;
use crate::data::Data;
use crate::error::PipeError;
use crate::graph::NodeWaker;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, OnceLock};

/// When pending items make the pipe's slot ready
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivateStrategy {
    /// Any single item
    Any,
    /// At least `expected` items
    All {
        /// Items needed
        expected: usize,
    },
}

impl ActivateStrategy {
    fn satisfied(self, pending: usize) -> bool {
        match self {
            Self::Any => pending > 0,
            Self::All { expected } => pending >= expected.max(1),
        }
    }
}

/// Pipe declaration from `Kernel::define`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeSpec {
    /// Activation rule
    pub strategy: ActivateStrategy,
    /// Maximum pending items
    pub capacity: usize,
}

impl Default for PipeSpec {
    fn default() -> Self {
        Self {
            strategy: ActivateStrategy::Any,
            capacity: 1024,
        }
    }
}

#[derive(Debug, Default)]
struct PipeState {
    queue: VecDeque<Data>,
    eof: bool,
    terminated: bool,
    received: u64,
}

/// Bounded queue feeding one node
pub struct AsyncPipe {
    state: Mutex<PipeState>,
    spec: PipeSpec,
    bitmap: Arc<ReadyBitMap>,
    slot: usize,
    waker: OnceLock<NodeWaker>,
}

impl AsyncPipe {
    /// Create a pipe bound to `slot` of `bitmap`
    #[must_use]
    pub fn new(spec: PipeSpec, bitmap: Arc<ReadyBitMap>, slot: usize) -> Self {
        Self {
            state: Mutex::new(PipeState::default()),
            spec,
            bitmap,
            slot,
            waker: OnceLock::new(),
        }
    }

    pub(crate) fn bind(&self, waker: NodeWaker) {
        let _ = self.waker.set(waker);
    }

    fn refresh(&self, state: &PipeState) -> bool {
        let ready =
            state.eof || state.terminated || self.spec.strategy.satisfied(state.queue.len());
        self.bitmap.assign(self.slot, ready);
        ready
    }

    fn wake(&self) {
        if let Some(waker) = self.waker.get() {
            waker.wake();
        }
    }

    /// Queue an item
    ///
    /// # Errors
    ///
    /// Returns `Closed` after EOF or termination, `Full` at capacity
    pub fn set_data(&self, item: Data) -> Result<(), PipeError> {
        let ready = {
            let mut state = self.state.lock();
            if state.eof || state.terminated {
                return Err(PipeError::Closed);
            }
            if state.queue.len() >= self.spec.capacity {
                return Err(PipeError::Full {
                    capacity: self.spec.capacity,
                });
            }
            state.queue.push_back(item);
            state.received += 1;
            self.refresh(&state)
        };
        if ready {
            self.wake();
        }
        Ok(())
    }

    /// Mark end of stream
    ///
    /// # Errors
    ///
    /// Returns `Closed` if already at EOF or terminated
    pub fn set_eof(&self) -> Result<(), PipeError> {
        {
            let mut state = self.state.lock();
            if state.eof || state.terminated {
                return Err(PipeError::Closed);
            }
            state.eof = true;
            self.refresh(&state);
        }
        self.wake();
        Ok(())
    }

    /// Take the oldest item; the flag reports EOF with nothing left
    pub fn get_data(&self) -> (Option<Data>, bool) {
        let mut state = self.state.lock();
        let item = if state.terminated {
            None
        } else {
            state.queue.pop_front()
        };
        let eof = state.queue.is_empty() && (state.eof || state.terminated);
        self.refresh(&state);
        (item, eof)
    }

    /// Close permanently; later reads see EOF. Idempotent.
    pub fn terminate(&self) {
        let mut state = self.state.lock();
        if state.terminated {
            return;
        }
        state.terminated = true;
        state.queue.clear();
        self.refresh(&state);
    }

    /// Whether `terminate` ran
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.state.lock().terminated
    }

    /// Pending item count
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Whether nothing is pending
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().queue.is_empty()
    }

    /// Items accepted over the pipe's lifetime
    #[must_use]
    pub fn received(&self) -> u64 {
        self.state.lock().received
    }

    /// The pipe's declaration
    #[must_use]
    pub const fn spec(&self) -> PipeSpec {
        self.spec
    }
}

impl std::fmt::Debug for AsyncPipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("AsyncPipe")
            .field("slot", &self.slot)
            .field("pending", &state.queue.len())
            .field("eof", &state.eof)
            .field("terminated", &state.terminated)
            .finish()
    }
}
