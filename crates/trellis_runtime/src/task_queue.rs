//! Task queue: bounded-concurrency worker pool with a bounded wait queue.
//!
//! `push` admits an item into the wait queue or rejects it (running its
//! `destroy` callback) when `queue_max` items already wait. `schedule`
//! moves waiting items to workers while fewer than `processing_max` are in
//! flight; each finishing worker calls `schedule_next` to pull the next one.

use crate::error::TaskQueueError;
use crate::work_queue::WorkQueue;
use crossbeam_channel::{Receiver, Sender};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::JoinHandle;

/// Name of the fallback queue
pub const DEFAULT_QUEUE: &str = "default";

/// A unit of work: run it, or destroy it if it will never run
pub struct ScheduleItem {
    run: Box<dyn FnOnce() + Send>,
    destroy: Box<dyn FnOnce() + Send>,
}

impl ScheduleItem {
    /// Create an item
    pub fn new(run: impl FnOnce() + Send + 'static, destroy: impl FnOnce() + Send + 'static) -> Self {
        Self {
            run: Box::new(run),
            destroy: Box::new(destroy),
        }
    }

    /// Create an item with nothing to do on destroy
    pub fn detached(run: impl FnOnce() + Send + 'static) -> Self {
        Self::new(run, || {})
    }

    /// Consume by running
    pub fn run(self) {
        (self.run)();
    }

    /// Consume by destroying
    pub fn destroy(self) {
        (self.destroy)();
    }
}

impl std::fmt::Debug for ScheduleItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ScheduleItem")
    }
}

/// Task queue configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskQueueConfig {
    /// Queue name
    pub name: String,
    /// Worker threads
    pub thread_num: usize,
    /// Maximum items in flight
    pub processing_max: usize,
    /// Maximum items waiting
    pub queue_max: usize,
}

impl TaskQueueConfig {
    /// Create a config with default limits
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Set the worker thread count
    #[must_use]
    pub fn with_thread_num(mut self, thread_num: usize) -> Self {
        self.thread_num = thread_num;
        self
    }

    /// Set the in-flight limit
    #[must_use]
    pub fn with_processing_max(mut self, processing_max: usize) -> Self {
        self.processing_max = processing_max;
        self
    }

    /// Set the wait-queue limit
    #[must_use]
    pub fn with_queue_max(mut self, queue_max: usize) -> Self {
        self.queue_max = queue_max;
        self
    }

    /// Check limits
    ///
    /// # Errors
    ///
    /// Returns error if the name is empty or any limit is zero
    pub fn validate(&self) -> Result<(), TaskQueueError> {
        let invalid = |reason: &str| TaskQueueError::InvalidConfig {
            queue: self.name.clone(),
            reason: reason.to_string(),
        };
        if self.name.is_empty() {
            return Err(invalid("name must not be empty"));
        }
        if self.thread_num == 0 {
            return Err(invalid("thread_num must be at least 1"));
        }
        if self.processing_max == 0 {
            return Err(invalid("processing_max must be at least 1"));
        }
        if self.queue_max == 0 {
            return Err(invalid("queue_max must be at least 1"));
        }
        Ok(())
    }
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_QUEUE.to_string(),
            thread_num: 4,
            processing_max: 4,
            queue_max: 1024,
        }
    }
}

/// Point-in-time queue statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskQueueStat {
    /// Queue name
    pub name: String,
    /// Workers currently running an item
    pub active_threads: usize,
    /// Idle workers
    pub idle_threads: usize,
    /// Items in flight
    pub processing_count: usize,
    /// Items waiting
    pub queue_count: usize,
    /// `processing_count / processing_max`
    pub processing_ratio: f64,
    /// `queue_count / queue_max`
    pub queue_ratio: f64,
}

struct Shared {
    config: TaskQueueConfig,
    waiting: WorkQueue<ScheduleItem>,
    queue_count: AtomicUsize,
    processing_count: AtomicUsize,
    active_threads: AtomicUsize,
    stopped: AtomicBool,
    sender: Mutex<Option<Sender<ScheduleItem>>>,
}

impl Shared {
    fn schedule(&self) {
        let max = self.config.processing_max;
        loop {
            let mut current = self.processing_count.load(Ordering::SeqCst);
            loop {
                if current >= max {
                    return;
                }
                match self.processing_count.compare_exchange(
                    current,
                    current + 1,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                ) {
                    Ok(_) => break,
                    Err(actual) => current = actual,
                }
            }

            match self.waiting.pop() {
                Some(item) => {
                    self.queue_count.fetch_sub(1, Ordering::SeqCst);
                    self.dispatch(item);
                }
                None => {
                    self.release_slot();
                    // A push may have lost its reservation race against us.
                    if self.waiting.is_empty() {
                        return;
                    }
                }
            }
        }
    }

    fn dispatch(&self, item: ScheduleItem) {
        let sender = self.sender.lock().clone();
        let rejected = match sender {
            Some(sender) => sender.send(item).err().map(|e| e.into_inner()),
            None => Some(item),
        };
        if let Some(item) = rejected {
            self.release_slot();
            item.destroy();
        }
    }

    fn release_slot(&self) {
        let _ = self
            .processing_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    fn schedule_next(&self) {
        self.release_slot();
        self.schedule();
    }
}

/// Worker pool with bounded concurrency and a bounded wait queue
pub struct TaskQueue {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskQueue {
    /// Create the queue and spawn its workers
    ///
    /// # Errors
    ///
    /// Returns error if the config is invalid or a thread cannot spawn
    pub fn new(config: TaskQueueConfig) -> Result<Arc<Self>, TaskQueueError> {
        config.validate()?;
        let (sender, receiver) = crossbeam_channel::bounded(config.processing_max);
        let shared = Arc::new(Shared {
            config,
            waiting: WorkQueue::new(),
            queue_count: AtomicUsize::new(0),
            processing_count: AtomicUsize::new(0),
            active_threads: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
            sender: Mutex::new(Some(sender)),
        });

        let mut workers = Vec::with_capacity(shared.config.thread_num);
        for i in 0..shared.config.thread_num {
            let name = format!("trellis-{}-{}", shared.config.name, i);
            let worker_shared = Arc::clone(&shared);
            let worker_rx = receiver.clone();
            let spawned = std::thread::Builder::new()
                .name(name)
                .spawn(move || worker_loop(&worker_shared, &worker_rx));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    // Closing the channel lets the workers already started exit.
                    shared.sender.lock().take();
                    return Err(TaskQueueError::Spawn {
                        queue: shared.config.name.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            queue = %shared.config.name,
            threads = shared.config.thread_num,
            processing_max = shared.config.processing_max,
            queue_max = shared.config.queue_max,
            "Task queue started"
        );
        Ok(Arc::new(Self {
            shared,
            workers: Mutex::new(workers),
        }))
    }

    /// Queue name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    /// Queue config
    #[must_use]
    pub fn config(&self) -> &TaskQueueConfig {
        &self.shared.config
    }

    /// Admit an item; on rejection its `destroy` runs before returning
    ///
    /// # Errors
    ///
    /// Returns error if the wait queue is full or the queue stopped
    pub fn push(&self, item: ScheduleItem) -> Result<(), TaskQueueError> {
        let shared = &self.shared;
        if shared.stopped.load(Ordering::SeqCst) {
            item.destroy();
            return Err(TaskQueueError::Stopped {
                queue: shared.config.name.clone(),
            });
        }

        let queue_max = shared.config.queue_max;
        let mut current = shared.queue_count.load(Ordering::SeqCst);
        loop {
            if current >= queue_max {
                tracing::warn!(queue = %shared.config.name, queue_max, "Task queue full, dropping item");
                item.destroy();
                return Err(TaskQueueError::QueueFull {
                    queue: shared.config.name.clone(),
                    queue_max,
                });
            }
            match shared.queue_count.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        shared.waiting.push(item);
        shared.schedule();
        Ok(())
    }

    /// Dispatch waiting items while slots are free
    pub fn schedule(&self) {
        self.shared.schedule();
    }

    /// Release one in-flight slot and dispatch the next waiting item
    pub fn schedule_next(&self) {
        self.shared.schedule_next();
    }

    /// Override the in-flight count
    pub fn set_processing_count(&self, count: usize) {
        self.shared.processing_count.store(count, Ordering::SeqCst);
    }

    /// Items in flight
    #[must_use]
    pub fn processing_count(&self) -> usize {
        self.shared.processing_count.load(Ordering::SeqCst)
    }

    /// Items waiting
    #[must_use]
    pub fn queue_count(&self) -> usize {
        self.shared.queue_count.load(Ordering::SeqCst)
    }

    /// Whether `stop` ran
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::SeqCst)
    }

    /// Snapshot statistics
    #[must_use]
    pub fn stat(&self) -> TaskQueueStat {
        let shared = &self.shared;
        let active = shared.active_threads.load(Ordering::SeqCst);
        let processing = shared.processing_count.load(Ordering::SeqCst);
        let queued = shared.queue_count.load(Ordering::SeqCst);
        TaskQueueStat {
            name: shared.config.name.clone(),
            active_threads: active,
            idle_threads: shared.config.thread_num.saturating_sub(active),
            processing_count: processing,
            queue_count: queued,
            processing_ratio: processing as f64 / shared.config.processing_max as f64,
            queue_ratio: queued as f64 / shared.config.queue_max as f64,
        }
    }

    /// Stop accepting work, destroy every waiting item and join the workers.
    ///
    /// Items already handed to a worker still run.
    pub fn stop(&self) {
        let shared = &self.shared;
        if shared.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        shared.sender.lock().take();

        let drained = shared.waiting.drain();
        let dropped = drained.len();
        for item in drained {
            shared.queue_count.fetch_sub(1, Ordering::SeqCst);
            item.destroy();
        }

        let current = std::thread::current().id();
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
        tracing::info!(queue = %shared.config.name, dropped, "Task queue stopped");
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("name", &self.shared.config.name)
            .field("processing", &self.processing_count())
            .field("queued", &self.queue_count())
            .finish()
    }
}

fn worker_loop(shared: &Shared, receiver: &Receiver<ScheduleItem>) {
    while let Ok(item) = receiver.recv() {
        shared.active_threads.fetch_add(1, Ordering::SeqCst);
        item.run();
        shared.active_threads.fetch_sub(1, Ordering::SeqCst);
        shared.schedule_next();
    }
}

/// Named task queues with a default fallback
#[derive(Debug)]
pub struct TaskQueueManager {
    queues: IndexMap<String, Arc<TaskQueue>>,
    default: Arc<TaskQueue>,
}

impl TaskQueueManager {
    /// Create every configured queue, adding a default queue if none is named so
    ///
    /// # Errors
    ///
    /// Returns error if a config is invalid or duplicated
    pub fn new(configs: &[TaskQueueConfig]) -> Result<Self, TaskQueueError> {
        let mut queues = IndexMap::new();
        for config in configs {
            if queues.contains_key(&config.name) {
                return Err(TaskQueueError::InvalidConfig {
                    queue: config.name.clone(),
                    reason: "duplicate queue name".to_string(),
                });
            }
            queues.insert(config.name.clone(), TaskQueue::new(config.clone())?);
        }
        if !queues.contains_key(DEFAULT_QUEUE) {
            queues.insert(
                DEFAULT_QUEUE.to_string(),
                TaskQueue::new(TaskQueueConfig::default())?,
            );
        }
        let default = queues
            .get(DEFAULT_QUEUE)
            .cloned()
            .ok_or_else(|| TaskQueueError::InvalidConfig {
                queue: DEFAULT_QUEUE.to_string(),
                reason: "missing default queue".to_string(),
            })?;
        Ok(Self { queues, default })
    }

    /// Queue by name, falling back to the default queue
    #[must_use]
    pub fn get(&self, name: &str) -> Arc<TaskQueue> {
        match self.queues.get(name) {
            Some(queue) => Arc::clone(queue),
            None => {
                if !name.is_empty() {
                    tracing::debug!(queue = %name, "Unknown task queue, using default");
                }
                Arc::clone(&self.default)
            }
        }
    }

    /// The default queue
    #[must_use]
    pub fn default_queue(&self) -> Arc<TaskQueue> {
        Arc::clone(&self.default)
    }

    /// Queue names
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.queues.keys().map(String::as_str)
    }

    /// Statistics of every queue
    #[must_use]
    pub fn stats(&self) -> Vec<TaskQueueStat> {
        self.queues.values().map(|q| q.stat()).collect()
    }

    /// Stop every queue
    pub fn stop_all(&self) {
        for queue in self.queues.values() {
            queue.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    fn counting_item(
        runs: &Arc<AtomicUsize>,
        destroys: &Arc<AtomicUsize>,
    ) -> ScheduleItem {
        let runs = Arc::clone(runs);
        let destroys = Arc::clone(destroys);
        ScheduleItem::new(
            move || {
                runs.fetch_add(1, Ordering::SeqCst);
            },
            move || {
                destroys.fetch_add(1, Ordering::SeqCst);
            },
        )
    }

    fn wait_until(cond: impl Fn() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_config_validate() {
        assert!(TaskQueueConfig::default().validate().is_ok());
        assert!(TaskQueueConfig::new("q").with_queue_max(0).validate().is_err());
        assert!(TaskQueueConfig::new("").validate().is_err());
    }

    #[test]
    fn test_runs_items() {
        let queue = TaskQueue::new(TaskQueueConfig::new("run").with_thread_num(2)).unwrap();
        let (tx, rx) = mpsc::channel();
        for i in 0..10 {
            let tx = tx.clone();
            queue
                .push(ScheduleItem::detached(move || {
                    let _ = tx.send(i);
                }))
                .unwrap();
        }
        let mut got: Vec<i32> = (0..10)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        got.sort_unstable();
        assert_eq!(got, (0..10).collect::<Vec<_>>());
        wait_until(|| queue.processing_count() == 0);
    }

    #[test]
    fn test_overflow_drops_and_destroys() {
        let queue = TaskQueue::new(
            TaskQueueConfig::new("tight")
                .with_thread_num(1)
                .with_processing_max(1)
                .with_queue_max(1),
        )
        .unwrap();
        queue.set_processing_count(1);

        let runs = Arc::new(AtomicUsize::new(0));
        let destroys = Arc::new(AtomicUsize::new(0));

        assert!(queue.push(counting_item(&runs, &destroys)).is_ok());
        assert!(matches!(
            queue.push(counting_item(&runs, &destroys)),
            Err(TaskQueueError::QueueFull { .. })
        ));
        assert!(queue.push(counting_item(&runs, &destroys)).is_err());
        assert_eq!(destroys.load(Ordering::SeqCst), 2);
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(queue.queue_count(), 1);

        queue.schedule_next();
        wait_until(|| runs.load(Ordering::SeqCst) == 1);
        assert_eq!(destroys.load(Ordering::SeqCst), 2);
        wait_until(|| queue.processing_count() == 0);
    }

    #[test]
    fn test_processing_max_bounds_concurrency() {
        let queue = TaskQueue::new(
            TaskQueueConfig::new("bounded")
                .with_thread_num(4)
                .with_processing_max(2),
        )
        .unwrap();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            let done = Arc::clone(&done);
            queue
                .push(ScheduleItem::detached(move || {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(2));
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    done.fetch_add(1, Ordering::SeqCst);
                }))
                .unwrap();
        }
        wait_until(|| done.load(Ordering::SeqCst) == 16);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn test_stop_destroys_waiting() {
        let queue = TaskQueue::new(
            TaskQueueConfig::new("stopping")
                .with_thread_num(1)
                .with_processing_max(1),
        )
        .unwrap();
        queue.set_processing_count(1);
        let runs = Arc::new(AtomicUsize::new(0));
        let destroys = Arc::new(AtomicUsize::new(0));
        queue.push(counting_item(&runs, &destroys)).unwrap();
        queue.push(counting_item(&runs, &destroys)).unwrap();

        queue.stop();
        assert_eq!(destroys.load(Ordering::SeqCst), 2);
        assert!(matches!(
            queue.push(counting_item(&runs, &destroys)),
            Err(TaskQueueError::Stopped { .. })
        ));
        assert_eq!(destroys.load(Ordering::SeqCst), 3);
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_stat_ratios() {
        let queue = TaskQueue::new(
            TaskQueueConfig::new("stat")
                .with_thread_num(1)
                .with_processing_max(2)
                .with_queue_max(4),
        )
        .unwrap();
        queue.set_processing_count(2);
        queue.push(ScheduleItem::detached(|| {})).unwrap();
        let stat = queue.stat();
        assert_eq!(stat.queue_count, 1);
        assert!((stat.processing_ratio - 1.0).abs() < f64::EPSILON);
        assert!((stat.queue_ratio - 0.25).abs() < f64::EPSILON);
        queue.stop();
    }

    #[test]
    fn test_manager_fallback() {
        let manager = TaskQueueManager::new(&[TaskQueueConfig::new("search").with_thread_num(1)])
            .unwrap();
        assert_eq!(manager.get("search").name(), "search");
        assert_eq!(manager.get("nope").name(), DEFAULT_QUEUE);
        assert_eq!(manager.get("").name(), DEFAULT_QUEUE);
        assert_eq!(manager.stats().len(), 2);
        manager.stop_all();
    }

    #[test]
    fn test_manager_rejects_duplicates() {
        let configs = vec![TaskQueueConfig::new("a"), TaskQueueConfig::new("a")];
        assert!(TaskQueueManager::new(&configs).is_err());
    }

    proptest::proptest! {
        #![proptest_config(proptest::prelude::ProptestConfig::with_cases(16))]
        #[test]
        fn prop_admission_counts(queue_max in 1usize..6, pushes in 0usize..12) {
            let queue = TaskQueue::new(
                TaskQueueConfig::new("prop")
                    .with_thread_num(1)
                    .with_processing_max(1)
                    .with_queue_max(queue_max),
            )
            .unwrap();
            queue.set_processing_count(1);
            let runs = Arc::new(AtomicUsize::new(0));
            let destroys = Arc::new(AtomicUsize::new(0));
            let mut accepted = 0;
            for _ in 0..pushes {
                if queue.push(counting_item(&runs, &destroys)).is_ok() {
                    accepted += 1;
                }
            }
            proptest::prop_assert_eq!(accepted, pushes.min(queue_max));
            proptest::prop_assert_eq!(destroys.load(Ordering::SeqCst), pushes - accepted);
            queue.stop();
        }
    }
}
