//! Backpressure classification for task queues.
//!
//! Admission control itself lives in the task queue (a full wait queue
//! rejects); this controller reads queue statistics and tells the report
//! loop how close each queue is to rejecting work.

use crate::task_queue::TaskQueueStat;

/// Backpressure status of one queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressureStatus {
    /// Wait queue below the threshold
    Ok,
    /// Wait queue at or above the threshold
    Saturated,
    /// Wait queue full; pushes are being rejected
    Overflowing,
}

/// Backpressure controller
///
/// Compares each queue's `queue_count / queue_max` ratio with a threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackpressureController {
    /// Saturation threshold (0.0 - 1.0)
    threshold: f64,
}

impl BackpressureController {
    /// Create a controller
    #[must_use]
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold: threshold.clamp(0.0, 1.0),
        }
    }

    /// Saturation threshold
    #[must_use]
    pub const fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Classify a queue
    #[must_use]
    pub fn status(&self, stat: &TaskQueueStat) -> BackpressureStatus {
        if stat.queue_ratio >= 1.0 {
            BackpressureStatus::Overflowing
        } else if stat.queue_ratio >= self.threshold {
            BackpressureStatus::Saturated
        } else {
            BackpressureStatus::Ok
        }
    }

    /// Classify every queue, logging the ones under pressure
    pub fn inspect(&self, stats: &[TaskQueueStat]) -> Vec<(String, BackpressureStatus)> {
        stats
            .iter()
            .map(|stat| {
                let status = self.status(stat);
                if status != BackpressureStatus::Ok {
                    tracing::warn!(
                        queue = %stat.name,
                        queue_count = stat.queue_count,
                        queue_ratio = stat.queue_ratio,
                        status = ?status,
                        "Task queue under backpressure"
                    );
                }
                (stat.name.clone(), status)
            })
            .collect()
    }
}

impl Default for BackpressureController {
    fn default() -> Self {
        Self::new(0.8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stat(queue_count: usize, queue_max: usize) -> TaskQueueStat {
        TaskQueueStat {
            name: "q".to_string(),
            active_threads: 0,
            idle_threads: 1,
            processing_count: 0,
            queue_count,
            processing_ratio: 0.0,
            queue_ratio: queue_count as f64 / queue_max as f64,
        }
    }

    #[test]
    fn test_backpressure_controller_new() {
        assert_eq!(BackpressureController::new(1.5).threshold(), 1.0);
        assert_eq!(BackpressureController::default().threshold(), 0.8);
    }

    #[test]
    fn test_backpressure_status() {
        let controller = BackpressureController::new(0.8);
        assert_eq!(controller.status(&stat(50, 100)), BackpressureStatus::Ok);
        assert_eq!(controller.status(&stat(85, 100)), BackpressureStatus::Saturated);
        assert_eq!(controller.status(&stat(100, 100)), BackpressureStatus::Overflowing);
    }

    #[test]
    fn test_backpressure_inspect() {
        let controller = BackpressureController::default();
        let result = controller.inspect(&[stat(1, 10), stat(10, 10)]);
        assert_eq!(result[0].1, BackpressureStatus::Ok);
        assert_eq!(result[1].1, BackpressureStatus::Overflowing);
    }
}
