//! TRELLIS Runtime
//!
//! Executes dataflow graphs: kernels wired port to port, scheduled on
//! bounded worker pools whenever their readiness bits allow, suspended on
//! async pipes without holding a thread, and cancelled as a unit on a
//! deadline, a kernel failure or a caller's request. Nodes placed on other
//! peers are split off at graph start and reached through border frames.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backpressure;
pub mod bitmap;
pub mod border;
pub mod data;
pub mod engine;
pub mod error;
mod executor;
pub mod fork;
pub mod graph;
pub mod kernel;
pub mod kernels;
pub mod monitor;
pub mod node;
pub mod pipe;
pub mod pool;
mod scheduler;
pub mod task_queue;
pub mod timer;
pub mod work_queue;

pub use backpressure::{BackpressureController, BackpressureStatus};
pub use border::{BorderHub, BorderOutlet, HubOutlet};
pub use data::{Data, DataCodecs, data};
pub use engine::{Engine, EngineConfig, RunOptions, Snapshot};
pub use error::{GraphError, GraphResult, KernelError, PipeError, TaskQueueError};
pub use fork::{ForkRequest, SubGraph, SubGraphForker, split};
pub use graph::{GraphHandle, GraphOutcome};
pub use kernel::{ComputeContext, ComputeStatus, InitContext, Kernel, KernelDef, KernelRegistry};
pub use monitor::{ExecutionMonitor, Metrics, Telemetry};
pub use node::NodeState;
pub use pipe::{ActivateStrategy, AsyncPipe, PipeSpec};
pub use pool::{POOL_RESOURCE, Pool, PoolResource, PoolResourceConfig, PoolSample, PoolStats};
pub use task_queue::{ScheduleItem, TaskQueue, TaskQueueConfig, TaskQueueManager, TaskQueueStat};
pub use timer::{TimerEvent, TimerHandle, TimerService};
