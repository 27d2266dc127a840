//! Timer service: one-shot deadlines on a dedicated event-loop thread.
//!
//! Handle operations never touch the loop's state directly. They are queued
//! as commands and the loop is woken through a `Notify`. Each timer's
//! callback runs exactly once: with `is_timeout = true` on expiry, or with
//! `false` when stopped first (or when the service shuts down).

use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Opaque context passed back to a callback
pub type TimerData = Arc<dyn Any + Send + Sync>;

type Callback = Box<dyn FnOnce(TimerEvent) + Send>;

const PENDING: u8 = 0;
const FIRED: u8 = 1;
const CANCELLED: u8 = 2;

/// What a callback receives
#[derive(Clone)]
pub struct TimerEvent {
    /// Timer id
    pub id: u64,
    /// True on expiry, false on stop
    pub is_timeout: bool,
    /// Context given to `add_timer_with_data`
    pub data: Option<TimerData>,
}

impl std::fmt::Debug for TimerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerEvent")
            .field("id", &self.id)
            .field("is_timeout", &self.is_timeout)
            .finish_non_exhaustive()
    }
}

/// Timer lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    /// Waiting for its deadline
    Pending,
    /// Deadline reached, callback ran with `is_timeout = true`
    Fired,
    /// Stopped first, callback ran with `is_timeout = false`
    Cancelled,
}

struct TimerInner {
    id: u64,
    state: AtomicU8,
    callback: Mutex<Option<Callback>>,
    data: Option<TimerData>,
}

impl TimerInner {
    fn complete(&self, is_timeout: bool) -> bool {
        let target = if is_timeout { FIRED } else { CANCELLED };
        if self
            .state
            .compare_exchange(PENDING, target, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        let callback = self.callback.lock().take();
        if let Some(callback) = callback {
            callback(TimerEvent {
                id: self.id,
                is_timeout,
                data: self.data.clone(),
            });
        }
        true
    }

    fn state(&self) -> TimerState {
        match self.state.load(Ordering::SeqCst) {
            PENDING => TimerState::Pending,
            FIRED => TimerState::Fired,
            _ => TimerState::Cancelled,
        }
    }
}

/// Shared handle to one timer
#[derive(Clone)]
pub struct TimerHandle {
    inner: Arc<TimerInner>,
}

impl TimerHandle {
    /// Timer id
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> TimerState {
        self.inner.state()
    }

    /// Whether the callback has not run yet
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.state() == TimerState::Pending
    }
}

impl std::fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerHandle")
            .field("id", &self.inner.id)
            .field("state", &self.inner.state())
            .finish()
    }
}

enum Command {
    Add(Arc<TimerInner>, Instant),
    Update(Arc<TimerInner>, Instant),
    Stop(u64),
    Shutdown,
}

/// Dedicated timer thread
pub struct TimerService {
    commands: Arc<SegQueue<Command>>,
    notify: Arc<Notify>,
    running: AtomicBool,
    next_id: AtomicU64,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TimerService {
    /// Start the loop thread
    ///
    /// # Errors
    ///
    /// Returns error if the thread or its runtime cannot start
    pub fn new() -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;
        let commands = Arc::new(SegQueue::new());
        let notify = Arc::new(Notify::new());

        let loop_commands = Arc::clone(&commands);
        let loop_notify = Arc::clone(&notify);
        let thread = std::thread::Builder::new()
            .name("trellis-timer".to_string())
            .spawn(move || runtime.block_on(run_loop(loop_commands, loop_notify)))?;

        tracing::debug!("Timer service started");
        Ok(Self {
            commands,
            notify,
            running: AtomicBool::new(true),
            next_id: AtomicU64::new(1),
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Arm a timer
    pub fn add_timer(
        &self,
        timeout: Duration,
        callback: impl FnOnce(TimerEvent) + Send + 'static,
    ) -> TimerHandle {
        self.add(timeout, None, Box::new(callback))
    }

    /// Arm a timer carrying a context value
    pub fn add_timer_with_data(
        &self,
        timeout: Duration,
        data: TimerData,
        callback: impl FnOnce(TimerEvent) + Send + 'static,
    ) -> TimerHandle {
        self.add(timeout, Some(data), Box::new(callback))
    }

    fn add(&self, timeout: Duration, data: Option<TimerData>, callback: Callback) -> TimerHandle {
        let inner = Arc::new(TimerInner {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(PENDING),
            callback: Mutex::new(Some(callback)),
            data,
        });
        let handle = TimerHandle {
            inner: Arc::clone(&inner),
        };
        if !self.running.load(Ordering::SeqCst) {
            inner.complete(false);
            return handle;
        }
        self.send(Command::Add(Arc::clone(&inner), Instant::now() + timeout));
        // A shutdown between the check and the push may have drained the
        // queue already; `complete` is a no-op if the loop got there first.
        if !self.running.load(Ordering::SeqCst) {
            inner.complete(false);
        }
        handle
    }

    /// Move a pending timer's deadline to `timeout` from now
    pub fn update_timer(&self, handle: &TimerHandle, timeout: Duration) {
        if handle.is_pending() {
            self.send(Command::Update(
                Arc::clone(&handle.inner),
                Instant::now() + timeout,
            ));
        }
    }

    /// Stop a timer unless it already fired.
    ///
    /// The callback runs inline on the calling thread with
    /// `is_timeout = false` before this returns, not on the loop thread.
    /// Callers must not hold a lock the callback takes.
    pub fn stop_timer(&self, handle: &TimerHandle) -> bool {
        let stopped = handle.inner.complete(false);
        if stopped {
            self.send(Command::Stop(handle.inner.id));
        }
        stopped
    }

    /// Whether the loop is running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop the loop; pending timers complete with `is_timeout = false`
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.send(Command::Shutdown);
        if let Some(thread) = self.thread.lock().take() {
            if thread.thread().id() != std::thread::current().id() {
                let _ = thread.join();
            }
        }
        tracing::debug!("Timer service stopped");
    }

    fn send(&self, command: Command) {
        self.commands.push(command);
        self.notify.notify_one();
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for TimerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerService")
            .field("running", &self.is_running())
            .finish()
    }
}

async fn run_loop(commands: Arc<SegQueue<Command>>, notify: Arc<Notify>) {
    let mut pending: BTreeMap<(Instant, u64), Arc<TimerInner>> = BTreeMap::new();
    let mut deadlines: HashMap<u64, (Instant, u64)> = HashMap::new();
    let mut seq = 0u64;

    loop {
        while let Some(command) = commands.pop() {
            match command {
                Command::Add(inner, at) | Command::Update(inner, at) => {
                    if let Some(old) = deadlines.remove(&inner.id) {
                        pending.remove(&old);
                    }
                    if inner.state() == TimerState::Pending {
                        seq += 1;
                        deadlines.insert(inner.id, (at, seq));
                        pending.insert((at, seq), inner);
                    }
                }
                Command::Stop(id) => {
                    if let Some(old) = deadlines.remove(&id) {
                        pending.remove(&old);
                    }
                }
                Command::Shutdown => {
                    for inner in std::mem::take(&mut pending).into_values() {
                        inner.complete(false);
                    }
                    while let Some(late) = commands.pop() {
                        if let Command::Add(inner, _) | Command::Update(inner, _) = late {
                            inner.complete(false);
                        }
                    }
                    return;
                }
            }
        }

        let now = Instant::now();
        while let Some(entry) = pending.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let inner = entry.remove();
            deadlines.remove(&inner.id);
            if inner.complete(true) {
                tracing::trace!(timer = inner.id, "Timer fired");
            }
        }

        match pending.keys().next().map(|(at, _)| *at) {
            Some(at) => {
                tokio::select! {
                    () = tokio::time::sleep_until(tokio::time::Instant::from_std(at)) => {}
                    () = notify.notified() => {}
                }
            }
            None => notify.notified().await,
        }
    }
}
