//! Triggers: standing rules that (re)publish an event.
//!
//! A trigger publishes one event with a payload template, optionally after a
//! delay and optionally repeating, and then runs its chain steps against the
//! event it just published. Triggers registered on the bus with an activation
//! event (`TriggerBuilder::on`) fire whenever that event is published; any
//! trigger can also be fired explicitly.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use blockscript_core::{ActorId, ScopeId, TriggerId};

use crate::bus::EventBus;
use crate::chain::ChainStep;
use crate::error::EventResult;
use crate::event::EventData;
use crate::history::DispatchReport;
use crate::scheduler::ScheduledTask;
use crate::template::DataTemplate;

/// Predicate over the actor that is firing the trigger.
pub type ActorGuard = Arc<dyn Fn(Option<&ActorId>) -> bool + Send + Sync>;

/// What a call to [`Trigger::fire`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FireOutcome {
    /// Published immediately.
    Fired(DispatchReport),
    /// Handed to the scheduler (delay and/or repetition).
    Scheduled,
    /// `can_fire` was false, or a repeat loop is already running.
    Skipped,
}

pub struct Trigger {
    id: TriggerId,
    event_name: String,
    event_data: DataTemplate,
    activation: Option<String>,
    guard: Option<ActorGuard>,
    chain: Vec<ChainStep>,
    delay: Duration,
    /// 0 = unbounded.
    repeat_count: u32,
    repeat_interval: Duration,
    owner: Option<ActorId>,
    scope: Option<ScopeId>,
    global_scope: bool,

    execution_count: AtomicU32,
    active: AtomicBool,
    cancelled: AtomicBool,
    repeat_task: Mutex<Option<ScheduledTask>>,
}

impl Trigger {
    pub fn builder(event_name: impl Into<String>) -> TriggerBuilder {
        TriggerBuilder {
            event_name: event_name.into(),
            event_data: DataTemplate::new(),
            activation: None,
            guard: None,
            chain: Vec::new(),
            delay: Duration::ZERO,
            repeat_count: 1,
            repeat_interval: Duration::ZERO,
            owner: None,
            scope: None,
            global_scope: true,
        }
    }

    pub fn id(&self) -> TriggerId {
        self.id
    }

    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    /// Event whose publication fires this trigger, if any.
    pub fn activation(&self) -> Option<&str> {
        self.activation.as_deref()
    }

    pub fn chain(&self) -> &[ChainStep] {
        &self.chain
    }

    pub fn owner(&self) -> Option<&ActorId> {
        self.owner.as_ref()
    }

    pub fn scope(&self) -> Option<&ScopeId> {
        self.scope.as_ref()
    }

    pub fn repeat_count(&self) -> u32 {
        self.repeat_count
    }

    pub fn execution_count(&self) -> u32 {
        self.execution_count.load(Ordering::SeqCst)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn bound_reached(&self, count: u32) -> bool {
        self.repeat_count > 0 && count >= self.repeat_count
    }

    fn is_repeating(&self) -> bool {
        !self.repeat_interval.is_zero() && self.repeat_count != 1
    }

    pub fn can_fire(&self, actor: Option<&ActorId>, scope: Option<&ScopeId>) -> bool {
        if !self.is_active() || self.is_cancelled() {
            return false;
        }
        if let Some(owner) = &self.owner {
            if actor != Some(owner) {
                return false;
            }
        }
        if let Some(own_scope) = &self.scope {
            if !self.global_scope && scope != Some(own_scope) {
                return false;
            }
        }
        if let Some(guard) = &self.guard {
            if !guard(actor) {
                return false;
            }
        }
        !self.bound_reached(self.execution_count())
    }

    /// Fire with no parent event: back-references in the payload resolve to nothing.
    pub fn fire(
        self: &Arc<Self>,
        bus: &EventBus,
        actor: Option<ActorId>,
        scope: Option<ScopeId>,
    ) -> EventResult<FireOutcome> {
        self.fire_with(bus, actor, scope, &EventData::new())
    }

    /// Fire with `parent` available to `"$field"` references in the payload.
    pub fn fire_with(
        self: &Arc<Self>,
        bus: &EventBus,
        actor: Option<ActorId>,
        scope: Option<ScopeId>,
        parent: &EventData,
    ) -> EventResult<FireOutcome> {
        if !self.can_fire(actor.as_ref(), scope.as_ref()) {
            debug!(trigger_id = %self.id, event = %self.event_name, "trigger cannot fire");
            return Ok(FireOutcome::Skipped);
        }

        if self.is_repeating() {
            return self.start_repeating(bus, actor, scope, parent);
        }

        if self.delay.is_zero() {
            return Ok(match self.execute(bus, actor, scope, parent)? {
                Some(report) => FireOutcome::Fired(report),
                None => FireOutcome::Skipped,
            });
        }

        let weak_bus = bus.weak_handle();
        let trigger = Arc::clone(self);
        let parent = parent.clone();
        bus.scheduler().after(self.delay, move || {
            if let Some(bus) = weak_bus.upgrade() {
                trigger.execute_logged(&bus, actor, scope, &parent);
            }
        });
        debug!(trigger_id = %self.id, delay = ?self.delay, "trigger scheduled");
        Ok(FireOutcome::Scheduled)
    }

    fn start_repeating(
        self: &Arc<Self>,
        bus: &EventBus,
        actor: Option<ActorId>,
        scope: Option<ScopeId>,
        parent: &EventData,
    ) -> EventResult<FireOutcome> {
        let mut slot = self
            .repeat_task
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        if slot.as_ref().is_some_and(|t| !t.is_cancelled()) {
            debug!(trigger_id = %self.id, "repeat loop already running");
            return Ok(FireOutcome::Skipped);
        }

        let mut outcome = FireOutcome::Scheduled;
        let first_delay = if self.delay.is_zero() {
            // Hold the slot while the first execution runs unlocked, so a
            // concurrent fire sees a live loop and skips.
            let claim = ScheduledTask::new();
            *slot = Some(claim.clone());
            drop(slot);

            let executed = self.execute(bus, actor, scope.clone(), parent);
            slot = self
                .repeat_task
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            let report = match executed {
                Ok(report) => report,
                Err(err) => {
                    release_claim(&mut slot, &claim);
                    return Err(err);
                }
            };
            if let Some(report) = report {
                outcome = FireOutcome::Fired(report);
            }
            // Deactivation takes and cancels the claim.
            if !self.is_active() || claim.is_cancelled() {
                release_claim(&mut slot, &claim);
                return Ok(outcome);
            }
            self.repeat_interval
        } else {
            self.delay
        };

        let weak_bus = bus.weak_handle();
        let trigger = Arc::clone(self);
        let parent = parent.clone();
        let handle = bus.scheduler().schedule(
            first_delay,
            Some(self.repeat_interval),
            Box::new(move || {
                if let Some(bus) = weak_bus.upgrade() {
                    trigger.execute_logged(&bus, actor, scope.clone(), &parent);
                }
            }),
        );
        *slot = Some(handle);
        Ok(outcome)
    }

    /// One execution: publish, run the chain, account for the repeat bound.
    ///
    /// Returns `None` when the trigger can no longer fire at this point
    /// (cancelled, deactivated, guard false, or bound reached concurrently).
    fn execute(
        self: &Arc<Self>,
        bus: &EventBus,
        actor: Option<ActorId>,
        scope: Option<ScopeId>,
        parent: &EventData,
    ) -> EventResult<Option<DispatchReport>> {
        if !self.can_fire(actor.as_ref(), scope.as_ref()) {
            return Ok(None);
        }

        // Reserve the execution up front so concurrent callers never exceed the bound.
        let reserved = self
            .execution_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (!self.bound_reached(n)).then_some(n + 1)
            });
        let Ok(previous) = reserved else {
            return Ok(None);
        };

        let data = self.event_data.resolve(parent);
        let (report, event) = match bus.dispatch(&self.event_name, data, actor, scope) {
            Ok(dispatched) => dispatched,
            Err(err) => {
                self.execution_count.fetch_sub(1, Ordering::SeqCst);
                return Err(err);
            }
        };

        for step in &self.chain {
            step.run(bus, self, &event);
        }

        if self.bound_reached(previous + 1) {
            self.deactivate();
            bus.forget_trigger(self.id);
            info!(
                trigger_id = %self.id,
                executions = previous + 1,
                "trigger reached its repeat bound"
            );
        }

        Ok(Some(report))
    }

    fn execute_logged(
        self: &Arc<Self>,
        bus: &EventBus,
        actor: Option<ActorId>,
        scope: Option<ScopeId>,
        parent: &EventData,
    ) {
        if self.is_cancelled() {
            return;
        }
        if let Err(err) = self.execute(bus, actor, scope, parent) {
            warn!(trigger_id = %self.id, event = %self.event_name, error = %err, "scheduled trigger execution failed");
        }
    }

    fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
        if let Some(task) = self
            .repeat_task
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            task.cancel();
        }
    }

    /// Stop the trigger and every callback it still has queued.
    ///
    /// Queued callbacks check the flag right before acting, so one that is
    /// already running may still complete.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.deactivate();
    }
}

/// Clear the repeat slot if it still holds `claim`.
fn release_claim(slot: &mut Option<ScheduledTask>, claim: &ScheduledTask) {
    if slot.as_ref().is_some_and(|t| t.same_task(claim)) {
        *slot = None;
    }
}

impl core::fmt::Debug for Trigger {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Trigger")
            .field("id", &self.id)
            .field("event_name", &self.event_name)
            .field("activation", &self.activation)
            .field("chain", &self.chain)
            .field("delay", &self.delay)
            .field("repeat_count", &self.repeat_count)
            .field("repeat_interval", &self.repeat_interval)
            .field("owner", &self.owner)
            .field("scope", &self.scope)
            .field("execution_count", &self.execution_count())
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

/// Fluent construction for [`Trigger`]. Defaults to a single execution.
pub struct TriggerBuilder {
    event_name: String,
    event_data: DataTemplate,
    activation: Option<String>,
    guard: Option<ActorGuard>,
    chain: Vec<ChainStep>,
    delay: Duration,
    repeat_count: u32,
    repeat_interval: Duration,
    owner: Option<ActorId>,
    scope: Option<ScopeId>,
    global_scope: bool,
}

impl TriggerBuilder {
    pub fn data(mut self, template: DataTemplate) -> Self {
        self.event_data = template;
        self
    }

    /// Fire whenever `event` is published on the bus this trigger is registered with.
    pub fn on(mut self, event: impl Into<String>) -> Self {
        self.activation = Some(event.into());
        self
    }

    pub fn when<F>(mut self, guard: F) -> Self
    where
        F: Fn(Option<&ActorId>) -> bool + Send + Sync + 'static,
    {
        self.guard = Some(Arc::new(guard));
        self
    }

    pub fn then(mut self, step: ChainStep) -> Self {
        self.chain.push(step);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Execute at most `count` times, `interval` apart.
    pub fn repeat(mut self, count: u32, interval: Duration) -> Self {
        self.repeat_count = count;
        self.repeat_interval = interval;
        self
    }

    /// Execute every `interval` until cancelled.
    pub fn forever(self, interval: Duration) -> Self {
        self.repeat(0, interval)
    }

    /// Only the given actor may fire this trigger.
    pub fn owned_by(mut self, actor: ActorId) -> Self {
        self.owner = Some(actor);
        self
    }

    /// Only fire for events from `scope`.
    pub fn in_scope(mut self, scope: ScopeId) -> Self {
        self.scope = Some(scope);
        self.global_scope = false;
        self
    }

    /// Remember `scope` but fire from any scope.
    pub fn global_in(mut self, scope: ScopeId) -> Self {
        self.scope = Some(scope);
        self.global_scope = true;
        self
    }

    pub fn build(self) -> Trigger {
        Trigger {
            id: TriggerId::new(),
            event_name: self.event_name,
            event_data: self.event_data,
            activation: self.activation,
            guard: self.guard,
            chain: self.chain,
            delay: self.delay,
            repeat_count: self.repeat_count,
            repeat_interval: self.repeat_interval,
            owner: self.owner,
            scope: self.scope,
            global_scope: self.global_scope,
            execution_count: AtomicU32::new(0),
            active: AtomicBool::new(true),
            cancelled: AtomicBool::new(false),
            repeat_task: Mutex::new(None),
        }
    }
}
