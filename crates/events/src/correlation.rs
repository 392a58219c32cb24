//! Correlation engine: ordered multi-step event sequences.
//!
//! Each registered [`Pattern`] is an ordered list of steps (event name plus an
//! optional predicate on the event data) and a timeout. Every event that flows
//! through the bus:
//!
//! 1. advances each live [`PatternInstance`] whose *next* step it matches
//!    (instances are independent state machines: `Waiting(k)` → `Waiting(k+1)`
//!    → `Complete`), and
//! 2. starts a fresh instance of every pattern whose first step it matches.
//!
//! An instance started by an event is never advanced by that same event.
//! Instances older than their pattern's timeout are dropped silently, lazily
//! while processing events and proactively by the periodic sweep.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::ser::{SerializeStruct, Serializer};
use tracing::{debug, error, info};

use blockscript_core::{ActorId, Clock, InstanceId, PatternId, ScopeId};

use crate::error::{EventError, EventResult};
use crate::event::{EventData, EventInstance};
use crate::scheduler::{ScheduledTask, Scheduler};

/// Predicate over an event's data.
pub type StepPredicate = Arc<dyn Fn(&EventData) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct PatternStep {
    event_name: String,
    predicate: Option<StepPredicate>,
}

impl PatternStep {
    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    pub fn matches(&self, name: &str, data: &EventData) -> bool {
        self.event_name == name && self.predicate.as_ref().is_none_or(|p| p(data))
    }
}

impl core::fmt::Debug for PatternStep {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PatternStep")
            .field("event_name", &self.event_name)
            .field("has_predicate", &self.predicate.is_some())
            .finish()
    }
}

/// An ordered event sequence to detect. Immutable once built.
#[derive(Debug)]
pub struct Pattern {
    id: PatternId,
    name: String,
    steps: Vec<PatternStep>,
    timeout: Duration,
}

impl Pattern {
    pub fn builder(name: impl Into<String>) -> PatternBuilder {
        PatternBuilder {
            name: name.into(),
            steps: Vec::new(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn id(&self) -> PatternId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &[PatternStep] {
        &self.steps
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

pub struct PatternBuilder {
    name: String,
    steps: Vec<PatternStep>,
    timeout: Duration,
}

impl PatternBuilder {
    /// Add a step that matches `event` only when `predicate` accepts its data.
    ///
    /// The predicate runs without engine locks held and may be evaluated for
    /// several live instances of the same event.
    pub fn step<F>(mut self, event: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&EventData) -> bool + Send + Sync + 'static,
    {
        self.steps.push(PatternStep {
            event_name: event.into(),
            predicate: Some(Arc::new(predicate)),
        });
        self
    }

    /// Add a step that matches any occurrence of `event`.
    pub fn then(mut self, event: impl Into<String>) -> Self {
        self.steps.push(PatternStep {
            event_name: event.into(),
            predicate: None,
        });
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> EventResult<Pattern> {
        if self.steps.is_empty() {
            return Err(EventError::EmptyPattern { name: self.name });
        }
        Ok(Pattern {
            id: PatternId::new(),
            name: self.name,
            steps: self.steps,
            timeout: self.timeout,
        })
    }
}

/// One matched step of an instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletedStep {
    pub index: usize,
    pub event_name: String,
    pub data: EventData,
    pub timestamp: DateTime<Utc>,
}

/// One attempt to match a pattern.
///
/// `completed_steps` is always a prefix of the pattern's steps, matched in
/// order. Listeners receive a copy; the engine owns the live instance.
#[derive(Debug, Clone)]
pub struct PatternInstance {
    id: InstanceId,
    pattern: Arc<Pattern>,
    initiating_actor: Option<ActorId>,
    scope: Option<ScopeId>,
    start_time: DateTime<Utc>,
    completed_steps: Vec<CompletedStep>,
    completed: bool,
    completion_time: Option<DateTime<Utc>>,
}

impl PatternInstance {
    fn start(pattern: Arc<Pattern>, event: &EventInstance) -> Self {
        let mut instance = Self {
            id: InstanceId::new(),
            pattern,
            initiating_actor: event.actor,
            scope: event.scope.clone(),
            start_time: event.timestamp,
            completed_steps: Vec::new(),
            completed: false,
            completion_time: None,
        };
        instance.record(event);
        instance
    }

    /// Append the next step; marks the instance complete on the last one.
    fn record(&mut self, event: &EventInstance) {
        self.completed_steps.push(CompletedStep {
            index: self.completed_steps.len(),
            event_name: event.name.clone(),
            data: event.data.clone(),
            timestamp: event.timestamp,
        });
        if self.completed_steps.len() == self.pattern.steps.len() {
            self.completed = true;
            self.completion_time = Some(event.timestamp);
        }
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn pattern(&self) -> &Arc<Pattern> {
        &self.pattern
    }

    pub fn initiating_actor(&self) -> Option<&ActorId> {
        self.initiating_actor.as_ref()
    }

    pub fn scope(&self) -> Option<&ScopeId> {
        self.scope.as_ref()
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn completed_steps(&self) -> &[CompletedStep] {
        &self.completed_steps
    }

    /// Index of the step this instance is waiting for.
    pub fn next_step(&self) -> usize {
        self.completed_steps.len()
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn completion_time(&self) -> Option<DateTime<Utc>> {
        self.completion_time
    }

    /// `now - start_time > timeout`. A start time in the future never expires.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match (now - self.start_time).to_std() {
            Ok(elapsed) => elapsed > self.pattern.timeout,
            Err(_) => false,
        }
    }

    /// Fields of every completed step merged; later steps win on collisions.
    pub fn merged_data(&self) -> EventData {
        let mut merged = EventData::new();
        for step in &self.completed_steps {
            for (k, v) in &step.data {
                merged.insert(k.clone(), v.clone());
            }
        }
        merged
    }
}

impl Serialize for PatternInstance {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("PatternInstance", 8)?;
        state.serialize_field("id", &self.id)?;
        state.serialize_field("pattern", self.pattern.name())?;
        state.serialize_field("initiating_actor", &self.initiating_actor)?;
        state.serialize_field("scope", &self.scope)?;
        state.serialize_field("start_time", &self.start_time)?;
        state.serialize_field("completed_steps", &self.completed_steps)?;
        state.serialize_field("completed", &self.completed)?;
        state.serialize_field("completion_time", &self.completion_time)?;
        state.end()
    }
}

/// Receives completed pattern instances.
pub trait PatternCompletionListener: Send + Sync {
    fn on_completed(&self, instance: &PatternInstance) -> anyhow::Result<()>;
}

impl<F> PatternCompletionListener for F
where
    F: Fn(&PatternInstance) -> anyhow::Result<()> + Send + Sync,
{
    fn on_completed(&self, instance: &PatternInstance) -> anyhow::Result<()> {
        self(instance)
    }
}

pub struct CorrelationEngine {
    clock: Arc<dyn Clock>,
    patterns: RwLock<Vec<Arc<Pattern>>>,
    instances: Mutex<Vec<PatternInstance>>,
    listeners: RwLock<Vec<Arc<dyn PatternCompletionListener>>>,
    completed_total: AtomicU64,
}

impl CorrelationEngine {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            patterns: RwLock::new(Vec::new()),
            instances: Mutex::new(Vec::new()),
            listeners: RwLock::new(Vec::new()),
            completed_total: AtomicU64::new(0),
        }
    }

    fn lock_instances(&self) -> std::sync::MutexGuard<'_, Vec<PatternInstance>> {
        self.instances.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn register_pattern(&self, pattern: Pattern) -> Arc<Pattern> {
        let pattern = Arc::new(pattern);
        info!(pattern_id = %pattern.id(), pattern = %pattern.name(), steps = pattern.steps().len(), "pattern registered");
        self.patterns
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(Arc::clone(&pattern));
        pattern
    }

    /// Remove a pattern and drop its live instances.
    pub fn unregister_pattern(&self, id: PatternId) -> bool {
        let removed = {
            let mut patterns = self.patterns.write().unwrap_or_else(|p| p.into_inner());
            let before = patterns.len();
            patterns.retain(|p| p.id() != id);
            patterns.len() != before
        };
        if removed {
            self.lock_instances().retain(|i| i.pattern.id() != id);
            info!(pattern_id = %id, "pattern unregistered");
        }
        removed
    }

    pub fn patterns(&self) -> Vec<Arc<Pattern>> {
        self.patterns
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn add_listener(&self, listener: impl PatternCompletionListener + 'static) {
        self.listeners
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(Arc::new(listener));
    }

    /// Advance live instances with `event`, then start new ones.
    ///
    /// Listeners are notified after the instance lock is released, so they may
    /// publish (and re-enter this method) freely. Returns the number of
    /// instances completed by this event.
    pub fn process_event(&self, event: &EventInstance) -> usize {
        let now = self.clock.now();
        let patterns = self.patterns();

        // What each live instance waits for. Predicates run unlocked below,
        // so they may query this engine.
        let waiting: Vec<(InstanceId, usize, Arc<Pattern>)> = {
            let mut instances = self.lock_instances();
            instances.retain(|instance| {
                let expired = instance.is_expired(now);
                if expired {
                    debug!(instance_id = %instance.id, pattern = %instance.pattern.name(), "pattern instance expired");
                }
                !instance.completed && !expired
            });
            instances
                .iter()
                .map(|i| (i.id, i.next_step(), Arc::clone(&i.pattern)))
                .collect()
        };

        let advancing: Vec<(InstanceId, usize)> = waiting
            .into_iter()
            .filter(|(_, next, pattern)| {
                pattern
                    .steps
                    .get(*next)
                    .is_some_and(|step| step.matches(&event.name, &event.data))
            })
            .map(|(id, next, _)| (id, next))
            .collect();
        let starting: Vec<&Arc<Pattern>> = patterns
            .iter()
            .filter(|pattern| {
                pattern
                    .steps
                    .first()
                    .is_some_and(|step| step.matches(&event.name, &event.data))
            })
            .collect();

        let mut completed = Vec::new();
        {
            let mut instances = self.lock_instances();

            // Skip instances another thread moved on (or dropped) meanwhile.
            instances.retain_mut(|instance| {
                let matched = advancing
                    .iter()
                    .any(|(id, next)| *id == instance.id && *next == instance.next_step());
                if !matched {
                    return true;
                }
                instance.record(event);
                if instance.completed {
                    completed.push(instance.clone());
                    return false;
                }
                true
            });

            for pattern in starting {
                let instance = PatternInstance::start(Arc::clone(pattern), event);
                debug!(instance_id = %instance.id, pattern = %pattern.name(), "pattern instance started");
                if instance.completed {
                    completed.push(instance);
                } else {
                    instances.push(instance);
                }
            }
        }

        for instance in &completed {
            self.completed_total.fetch_add(1, Ordering::SeqCst);
            info!(
                instance_id = %instance.id,
                pattern = %instance.pattern.name(),
                steps = instance.completed_steps.len(),
                "pattern completed"
            );
            self.notify(instance);
        }
        completed.len()
    }

    fn notify(&self, instance: &PatternInstance) {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        for listener in listeners {
            let outcome = catch_unwind(AssertUnwindSafe(|| listener.on_completed(instance)));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(instance_id = %instance.id, pattern = %instance.pattern.name(), error = %format!("{err:#}"), "completion listener failed");
                }
                Err(_) => {
                    error!(instance_id = %instance.id, pattern = %instance.pattern.name(), "completion listener panicked");
                }
            }
        }
    }

    /// Drop every expired instance. No listener is notified.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let mut instances = self.lock_instances();
        let before = instances.len();
        instances.retain(|i| !i.is_expired(now));
        let removed = before - instances.len();
        if removed > 0 {
            debug!(removed, remaining = instances.len(), "expired pattern instances swept");
        }
        removed
    }

    /// Run [`sweep_expired`](Self::sweep_expired) every `interval` on `scheduler`.
    pub fn start_sweeper(self: &Arc<Self>, scheduler: &dyn Scheduler, interval: Duration) -> ScheduledTask {
        let engine = Arc::downgrade(self);
        info!(interval = ?interval, "correlation sweep started");
        scheduler.every(interval, move || {
            if let Some(engine) = engine.upgrade() {
                engine.sweep_expired();
            }
        })
    }

    /// Copies of the live instances, in creation order.
    pub fn active_instances(&self) -> Vec<PatternInstance> {
        self.lock_instances().clone()
    }

    pub fn active_count(&self) -> usize {
        self.lock_instances().len()
    }

    /// Instances completed since this engine was created.
    pub fn completed_total(&self) -> u64 {
        self.completed_total.load(Ordering::SeqCst)
    }
}

impl core::fmt::Debug for CorrelationEngine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CorrelationEngine")
            .field("patterns", &self.patterns().len())
            .field("active", &self.active_count())
            .field("completed_total", &self.completed_total())
            .finish_non_exhaustive()
    }
}
