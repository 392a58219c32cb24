//! Scheduler boundary.
//!
//! The subsystem never spawns threads of its own. Trigger delays, repeat
//! intervals, delayed chain steps and the correlation sweep are all handed to
//! a host-supplied [`Scheduler`]. [`ManualScheduler`] is a deterministic
//! implementation driven by a [`ManualClock`], for tests and offline tools.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use blockscript_core::{Clock, ManualClock};

/// A scheduled callback. Repeating tasks are invoked once per interval.
pub type Task = Box<dyn FnMut() + Send + 'static>;

/// Handle to a scheduled callback.
///
/// Cancellation is best-effort: the scheduler checks the flag immediately
/// before each run, but a run that already started is not interrupted.
#[derive(Debug, Clone, Default)]
pub struct ScheduledTask {
    cancelled: Arc<AtomicBool>,
}

impl ScheduledTask {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Whether both handles control the same scheduled task.
    pub fn same_task(&self, other: &ScheduledTask) -> bool {
        Arc::ptr_eq(&self.cancelled, &other.cancelled)
    }
}

/// Runs callbacks later, optionally repeating.
pub trait Scheduler: Send + Sync {
    /// Run `task` after `delay`, then every `repeat` if given, until cancelled.
    fn schedule(&self, delay: Duration, repeat: Option<Duration>, task: Task) -> ScheduledTask;
}

impl<'a> dyn Scheduler + 'a {
    /// Run `f` once after `delay`.
    pub fn after<F>(&self, delay: Duration, f: F) -> ScheduledTask
    where
        F: FnOnce() + Send + 'static,
    {
        let mut f = Some(f);
        self.schedule(
            delay,
            None,
            Box::new(move || {
                if let Some(f) = f.take() {
                    f()
                }
            }),
        )
    }

    /// Run `f` every `interval`, first run one interval from now.
    pub fn every<F>(&self, interval: Duration, f: F) -> ScheduledTask
    where
        F: FnMut() + Send + 'static,
    {
        self.schedule(interval, Some(interval), Box::new(f))
    }
}

impl<S> Scheduler for Arc<S>
where
    S: Scheduler + ?Sized,
{
    fn schedule(&self, delay: Duration, repeat: Option<Duration>, task: Task) -> ScheduledTask {
        (**self).schedule(delay, repeat, task)
    }
}

struct Entry {
    due: DateTime<Utc>,
    seq: u64,
    repeat: Option<Duration>,
    task: Task,
    handle: ScheduledTask,
}

#[derive(Default)]
struct Queue {
    next_seq: u64,
    entries: Vec<Entry>,
}

impl Queue {
    /// Remove and return the earliest entry due at or before `until`.
    fn pop_due(&mut self, until: DateTime<Utc>) -> Option<Entry> {
        let idx = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.due <= until)
            .min_by_key(|(_, e)| (e.due, e.seq))
            .map(|(idx, _)| idx)?;
        Some(self.entries.swap_remove(idx))
    }
}

/// Deterministic scheduler: nothing runs until [`advance`](Self::advance) is called.
///
/// Tasks run on the calling thread, in due-time order (ties in scheduling
/// order), with the clock set to each task's due time while it runs.
#[derive(Clone)]
pub struct ManualScheduler {
    clock: ManualClock,
    queue: Arc<Mutex<Queue>>,
}

impl ManualScheduler {
    pub fn new(clock: ManualClock) -> Self {
        Self {
            clock,
            queue: Arc::new(Mutex::new(Queue::default())),
        }
    }

    pub fn clock(&self) -> &ManualClock {
        &self.clock
    }

    /// Callbacks still waiting (cancelled ones included until they come due).
    pub fn pending(&self) -> usize {
        self.lock().entries.len()
    }

    /// Move time forward by `by`, running every callback that comes due.
    ///
    /// Returns how many callbacks ran.
    pub fn advance(&self, by: Duration) -> usize {
        let target = self.clock.now() + chrono::Duration::from_std(by).unwrap_or_default();
        let mut ran = 0;

        loop {
            let Some(mut entry) = self.lock().pop_due(target) else {
                break;
            };

            if entry.handle.is_cancelled() {
                continue;
            }

            if entry.due > self.clock.now() {
                self.clock.set(entry.due);
            }
            (entry.task)();
            ran += 1;

            if let Some(interval) = entry.repeat {
                if !entry.handle.is_cancelled() {
                    entry.due += chrono::Duration::from_std(interval).unwrap_or_default();
                    self.lock().entries.push(entry);
                }
            }
        }

        self.clock.set(target);
        debug!(ran, "manual scheduler advanced");
        ran
    }

    /// Run whatever is due at the current instant.
    pub fn run_due(&self) -> usize {
        self.advance(Duration::ZERO)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, repeat: Option<Duration>, task: Task) -> ScheduledTask {
        let handle = ScheduledTask::new();
        let due = self.clock.now() + chrono::Duration::from_std(delay).unwrap_or_default();
        // A zero interval would re-run forever within a single advance.
        let repeat = repeat.filter(|interval| !interval.is_zero());

        let mut queue = self.lock();
        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.entries.push(Entry {
            due,
            seq,
            repeat,
            task,
            handle: handle.clone(),
        });
        handle
    }
}

impl core::fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ManualScheduler")
            .field("now", &self.clock.now())
            .field("pending", &self.pending())
            .finish()
    }
}
