//! Background timer thread implementing the events crate's [`Scheduler`].

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use blockscript_events::{ScheduledTask, Scheduler, Task};

use crate::error::{RuntimeError, RuntimeResult};

/// Scheduler thread configuration.
#[derive(Debug, Clone)]
pub struct ThreadSchedulerConfig {
    /// Thread name, also used in logs.
    pub name: String,
    /// Longest the worker sleeps while idle.
    pub idle_wait: Duration,
}

impl Default for ThreadSchedulerConfig {
    fn default() -> Self {
        Self {
            name: "blockscript-scheduler".to_string(),
            idle_wait: Duration::from_secs(1),
        }
    }
}

impl ThreadSchedulerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_idle_wait(mut self, wait: Duration) -> Self {
        self.idle_wait = wait;
        self
    }
}

/// Scheduler runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub tasks_scheduled: u64,
    pub tasks_run: u64,
    pub tasks_panicked: u64,
    pub tasks_cancelled: u64,
    pub pending: usize,
}

struct Entry {
    due: Instant,
    seq: u64,
    repeat: Option<Duration>,
    task: Task,
    handle: ScheduledTask,
}

// Reversed so the BinaryHeap pops the earliest (due, seq) first.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Entry {}

enum Command {
    Schedule(Entry),
    Shutdown,
}

/// Runs scheduled callbacks on one dedicated thread.
///
/// Callbacks run one at a time in due order. A callback that panics is
/// logged and, if repeating, keeps its schedule.
pub struct ThreadScheduler {
    name: String,
    sender: mpsc::Sender<Command>,
    next_seq: AtomicU64,
    join: Mutex<Option<thread::JoinHandle<()>>>,
    stats: Arc<Mutex<SchedulerStats>>,
}

impl ThreadScheduler {
    /// Spawn the worker thread.
    pub fn spawn(config: ThreadSchedulerConfig) -> RuntimeResult<Self> {
        let (sender, receiver) = mpsc::channel::<Command>();
        let stats = Arc::new(Mutex::new(SchedulerStats::default()));
        let worker_stats = Arc::clone(&stats);

        let name = config.name.clone();
        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || scheduler_loop(config, receiver, worker_stats))
            .map_err(|source| RuntimeError::Spawn {
                name: name.clone(),
                source,
            })?;

        Ok(Self {
            name,
            sender,
            next_seq: AtomicU64::new(0),
            join: Mutex::new(Some(join)),
            stats,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get current scheduler statistics.
    pub fn stats(&self) -> SchedulerStats {
        lock_stats(&self.stats).clone()
    }

    /// Stop the worker and wait for it to exit. Pending callbacks are dropped.
    ///
    /// Calling this from inside a scheduled callback only requests the stop.
    pub fn shutdown(&self) -> RuntimeResult<()> {
        let _ = self.sender.send(Command::Shutdown);
        let join = self
            .join
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        let Some(join) = join else {
            return Ok(());
        };
        if join.thread().id() == thread::current().id() {
            return Ok(());
        }
        join.join().map_err(|_| RuntimeError::WorkerPanicked {
            name: self.name.clone(),
        })
    }
}

impl Scheduler for ThreadScheduler {
    fn schedule(&self, delay: Duration, repeat: Option<Duration>, task: Task) -> ScheduledTask {
        let handle = ScheduledTask::new();
        let entry = Entry {
            due: Instant::now() + delay,
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            repeat: repeat.filter(|interval| !interval.is_zero()),
            task,
            handle: handle.clone(),
        };
        if self.sender.send(Command::Schedule(entry)).is_err() {
            warn!(scheduler = %self.name, "scheduler stopped; task dropped");
            handle.cancel();
        }
        handle
    }
}

impl Drop for ThreadScheduler {
    fn drop(&mut self) {
        let _ = self.sender.send(Command::Shutdown);
    }
}

impl core::fmt::Debug for ThreadScheduler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ThreadScheduler")
            .field("name", &self.name)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

fn lock_stats(stats: &Mutex<SchedulerStats>) -> std::sync::MutexGuard<'_, SchedulerStats> {
    stats.lock().unwrap_or_else(|p| p.into_inner())
}

fn scheduler_loop(
    config: ThreadSchedulerConfig,
    receiver: mpsc::Receiver<Command>,
    stats: Arc<Mutex<SchedulerStats>>,
) {
    info!(scheduler = %config.name, "scheduler started");
    let mut queue: BinaryHeap<Entry> = BinaryHeap::new();

    loop {
        let wait = queue
            .peek()
            .map(|e| e.due.saturating_duration_since(Instant::now()))
            .unwrap_or(config.idle_wait)
            .min(config.idle_wait);

        match receiver.recv_timeout(wait) {
            Ok(Command::Schedule(entry)) => {
                lock_stats(&stats).tasks_scheduled += 1;
                queue.push(entry);
            }
            Ok(Command::Shutdown) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }

        run_due(&config.name, &mut queue, &stats);
        lock_stats(&stats).pending = queue.len();
    }

    lock_stats(&stats).pending = 0;
    info!(scheduler = %config.name, dropped = queue.len(), "scheduler stopped");
}

fn run_due(name: &str, queue: &mut BinaryHeap<Entry>, stats: &Mutex<SchedulerStats>) {
    let now = Instant::now();
    while queue.peek().is_some_and(|e| e.due <= now) {
        let Some(mut entry) = queue.pop() else {
            break;
        };

        if entry.handle.is_cancelled() {
            lock_stats(stats).tasks_cancelled += 1;
            continue;
        }

        let outcome = catch_unwind(AssertUnwindSafe(|| (entry.task)()));
        {
            let mut s = lock_stats(stats);
            s.tasks_run += 1;
            if outcome.is_err() {
                s.tasks_panicked += 1;
            }
        }
        if outcome.is_err() {
            error!(scheduler = %name, seq = entry.seq, "scheduled task panicked");
        }

        match entry.repeat {
            Some(interval) if !entry.handle.is_cancelled() => {
                entry.due += interval;
                queue.push(entry);
            }
            _ => debug!(scheduler = %name, seq = entry.seq, "scheduled task finished"),
        }
    }
}
