//! Execution monitor for metrics and telemetry.
//!
//! Counts graph outcomes and keeps a bounded history of periodic telemetry
//! captures (queue and pool statistics alongside the counters).

use crate::graph::GraphOutcome;
use crate::pool::PoolStats;
use crate::task_queue::TaskQueueStat;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use trellis_core::GraphStatus;

/// Execution metrics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metrics {
    /// Graphs started
    pub graphs_started: u64,
    /// Graphs finished with success
    pub graphs_succeeded: u64,
    /// Graphs finished with a kernel error
    pub kernel_errors: u64,
    /// Graphs that hit their deadline
    pub timeouts: u64,
    /// Graphs cancelled by a caller or peer
    pub cancelled: u64,
    /// Graphs cancelled by admission control
    pub rejected: u64,
    /// `compute` calls across finished graphs
    pub nodes_computed: u64,
}

impl Metrics {
    /// Create new metrics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a graph start
    pub fn record_start(&mut self) {
        self.graphs_started += 1;
    }

    /// Record a graph outcome
    pub fn record_outcome(&mut self, outcome: &GraphOutcome) {
        self.nodes_computed += outcome.computes;
        match outcome.status {
            GraphStatus::Success => self.graphs_succeeded += 1,
            GraphStatus::KernelError { .. } => self.kernel_errors += 1,
            GraphStatus::Timeout => self.timeouts += 1,
            GraphStatus::Cancelled { .. } => self.cancelled += 1,
            GraphStatus::AdmissionRejected { .. } => self.rejected += 1,
        }
    }

    /// Graphs with an outcome
    #[must_use]
    pub fn graphs_finished(&self) -> u64 {
        self.graphs_succeeded + self.kernel_errors + self.timeouts + self.cancelled + self.rejected
    }

    /// Graphs started but not finished
    #[must_use]
    pub fn graphs_running(&self) -> u64 {
        self.graphs_started.saturating_sub(self.graphs_finished())
    }

    /// Get success rate (0.0 - 1.0)
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        let finished = self.graphs_finished();
        if finished == 0 {
            return 1.0;
        }
        self.graphs_succeeded as f64 / finished as f64
    }

    /// Reset metrics
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Telemetry data point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    /// Time since the monitor started
    pub timestamp: Duration,
    /// Counters at capture time
    pub metrics: Metrics,
    /// Task queue statistics
    pub queues: Vec<TaskQueueStat>,
    /// Pool resource counters
    pub pool: PoolStats,
}

/// Execution monitor
///
/// Tracks execution metrics and provides telemetry snapshots.
#[derive(Debug)]
pub struct ExecutionMonitor {
    metrics: Metrics,
    start_time: std::time::Instant,
    telemetry_history: VecDeque<Telemetry>,
    max_history: usize,
}

impl ExecutionMonitor {
    /// Create a new monitor
    #[must_use]
    pub fn new(max_history: usize) -> Self {
        Self {
            metrics: Metrics::new(),
            start_time: std::time::Instant::now(),
            telemetry_history: VecDeque::new(),
            max_history,
        }
    }

    /// Get current metrics
    #[must_use]
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Get mutable metrics
    pub fn metrics_mut(&mut self) -> &mut Metrics {
        &mut self.metrics
    }

    /// Capture a telemetry snapshot
    pub fn capture_telemetry(&mut self, queues: Vec<TaskQueueStat>, pool: PoolStats) -> Telemetry {
        let telemetry = Telemetry {
            timestamp: self.start_time.elapsed(),
            metrics: self.metrics.clone(),
            queues,
            pool,
        };
        self.telemetry_history.push_back(telemetry.clone());
        while self.telemetry_history.len() > self.max_history {
            self.telemetry_history.pop_front();
        }
        telemetry
    }

    /// Telemetry history, oldest first
    pub fn history(&self) -> impl Iterator<Item = &Telemetry> {
        self.telemetry_history.iter()
    }

    /// Number of retained captures
    #[must_use]
    pub fn history_len(&self) -> usize {
        self.telemetry_history.len()
    }

    /// Reset the monitor
    pub fn reset(&mut self) {
        self.metrics.reset();
        self.start_time = std::time::Instant::now();
        self.telemetry_history.clear();
    }
}

impl Default for ExecutionMonitor {
    fn default() -> Self {
        Self::new(1000)
    }
}
