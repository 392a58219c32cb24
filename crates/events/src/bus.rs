//! The event bus: schema registry, validation and priority-ordered dispatch.
//!
//! ## Dispatch
//!
//! `publish` runs, in order:
//!
//! 1. schema lookup and validation (nothing runs if this fails)
//! 2. handler resolution: every global handler plus, for local schemas, the
//!    local handlers bound to the event's scope (or to no scope), sorted by
//!    descending priority, ties in registration order. A one-shot schema is
//!    claimed and unregistered here, before any user code runs.
//! 3. the correlation pass (pattern matching)
//! 4. triggers activated by this event
//! 5. the resolved handlers
//!
//! A handler that fails is logged and skipped; the rest still run.
//!
//! ## Reentrancy
//!
//! Handlers, triggers and completion listeners may publish. Nested publishes
//! run to completion before the outer dispatch continues (depth-first). The
//! nesting depth per thread is capped by [`BusConfig::max_dispatch_depth`], so
//! a cyclic chain fails with `RecursionLimit` instead of overflowing the stack.
//!
//! ## Concurrency
//!
//! Registries sit behind `RwLock`s and handler lists are copy-on-write
//! (`Arc<Vec<_>>` swapped on registration). Dispatch works from a snapshot and
//! never holds a lock while user code runs, so registration from another
//! thread (or from inside a handler) is always safe.

use std::cell::Cell;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Instant;

use tracing::{debug, error, info, warn};

use blockscript_core::{ActorId, Clock, HandlerId, ScopeId, TriggerId};

use crate::config::BusConfig;
use crate::correlation::CorrelationEngine;
use crate::error::{EventError, EventResult};
use crate::event::{EventData, EventInstance};
use crate::handler::Handler;
use crate::history::{DispatchOutcome, DispatchRecord, DispatchReport, HistoryRing};
use crate::scheduler::{ScheduledTask, Scheduler};
use crate::schema::{EventSchema, SchemaScope};
use crate::trigger::{FireOutcome, Trigger};

thread_local! {
    static DISPATCH_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Tracks nested publishes on the current thread for as long as it lives.
struct DepthGuard {
    depth: usize,
}

impl DepthGuard {
    fn enter(max: usize) -> Result<Self, usize> {
        let depth = DISPATCH_DEPTH.with(|d| d.get()) + 1;
        if depth > max {
            return Err(depth);
        }
        DISPATCH_DEPTH.with(|d| d.set(depth));
        Ok(Self { depth })
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        DISPATCH_DEPTH.with(|d| d.set(self.depth - 1));
    }
}

#[derive(Clone)]
struct Registered {
    seq: u64,
    handler: Handler,
}

type HandlerList = Arc<Vec<Registered>>;

struct SchemaEntry {
    schema: RwLock<Arc<EventSchema>>,
    global: RwLock<HandlerList>,
    local: RwLock<HandlerList>,
    /// Set by the one dispatch allowed to consume a one-shot schema.
    consumed: AtomicBool,
}

impl SchemaEntry {
    fn new(schema: EventSchema) -> Self {
        Self {
            schema: RwLock::new(Arc::new(schema)),
            global: RwLock::new(Arc::new(Vec::new())),
            local: RwLock::new(Arc::new(Vec::new())),
            consumed: AtomicBool::new(false),
        }
    }

    fn schema(&self) -> Arc<EventSchema> {
        Arc::clone(&self.schema.read().unwrap_or_else(|p| p.into_inner()))
    }

    fn snapshot(list: &RwLock<HandlerList>) -> HandlerList {
        Arc::clone(&list.read().unwrap_or_else(|p| p.into_inner()))
    }

    fn update(list: &RwLock<HandlerList>, f: impl FnOnce(&mut Vec<Registered>)) {
        let mut guard = list.write().unwrap_or_else(|p| p.into_inner());
        let mut next = guard.as_ref().clone();
        f(&mut next);
        *guard = Arc::new(next);
    }

    /// Handlers applicable to an event from `scope`, in invocation order.
    fn resolve(&self, schema: &EventSchema, scope: Option<&ScopeId>) -> Vec<Handler> {
        let mut resolved: Vec<Registered> = Self::snapshot(&self.global).as_ref().clone();
        if schema.scope() == SchemaScope::Local {
            resolved.extend(
                Self::snapshot(&self.local)
                    .iter()
                    .filter(|r| r.handler.accepts_scope(scope))
                    .cloned(),
            );
        }
        resolved.sort_by_key(|r| (std::cmp::Reverse(r.handler.priority()), r.seq));
        resolved.into_iter().map(|r| r.handler).collect()
    }

    fn handler_count(&self) -> usize {
        Self::snapshot(&self.global).len() + Self::snapshot(&self.local).len()
    }
}

#[derive(Default)]
struct TriggerIndex {
    by_id: HashMap<TriggerId, Arc<Trigger>>,
    by_activation: HashMap<String, Arc<Vec<Arc<Trigger>>>>,
}

/// Central registry of schemas, handlers and triggers.
///
/// Always used behind an `Arc` (see [`EventBus::new`]) so delayed work can
/// hold a weak handle back to it.
pub struct EventBus {
    config: BusConfig,
    clock: Arc<dyn Clock>,
    scheduler: Arc<dyn Scheduler>,
    correlation: Arc<CorrelationEngine>,
    schemas: RwLock<HashMap<String, Arc<SchemaEntry>>>,
    history: Mutex<HashMap<String, HistoryRing>>,
    triggers: RwLock<TriggerIndex>,
    next_seq: AtomicU64,
    this: Weak<EventBus>,
}

impl EventBus {
    pub fn new(
        config: BusConfig,
        clock: Arc<dyn Clock>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Arc<Self> {
        let correlation = Arc::new(CorrelationEngine::new(Arc::clone(&clock)));
        Self::with_correlation(config, clock, scheduler, correlation)
    }

    /// Build around an existing correlation engine (e.g. one shared by tests).
    pub fn with_correlation(
        config: BusConfig,
        clock: Arc<dyn Clock>,
        scheduler: Arc<dyn Scheduler>,
        correlation: Arc<CorrelationEngine>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            config,
            clock,
            scheduler,
            correlation,
            schemas: RwLock::new(HashMap::new()),
            history: Mutex::new(HashMap::new()),
            triggers: RwLock::new(TriggerIndex::default()),
            next_seq: AtomicU64::new(0),
            this: this.clone(),
        })
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn correlation(&self) -> &Arc<CorrelationEngine> {
        &self.correlation
    }

    pub(crate) fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    pub(crate) fn weak_handle(&self) -> Weak<EventBus> {
        self.this.clone()
    }

    /// Start the periodic sweep of expired pattern instances.
    pub fn start_correlation_sweep(&self) -> ScheduledTask {
        self.correlation
            .start_sweeper(self.scheduler.as_ref(), self.config.sweep_interval)
    }

    // ---------------------------------------------------------------------
    // Schemas
    // ---------------------------------------------------------------------

    fn read_schemas(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<SchemaEntry>>> {
        self.schemas.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write_schemas(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<SchemaEntry>>> {
        self.schemas.write().unwrap_or_else(|p| p.into_inner())
    }

    fn entry(&self, name: &str) -> Option<Arc<SchemaEntry>> {
        self.read_schemas().get(name).cloned()
    }

    /// Register a new event type with empty handler lists.
    pub fn register_schema(&self, schema: EventSchema) -> EventResult<()> {
        let name = schema.name().to_string();
        let mut schemas = self.write_schemas();
        if schemas.contains_key(&name) {
            return Err(EventError::DuplicateSchema { name });
        }
        info!(event = %name, scope = ?schema.scope(), one_shot = schema.is_one_shot(), "event schema registered");
        schemas.insert(name, Arc::new(SchemaEntry::new(schema)));
        Ok(())
    }

    /// Register or update a schema, keeping any handlers already registered.
    pub fn replace_schema(&self, schema: EventSchema) {
        let name = schema.name().to_string();
        let mut schemas = self.write_schemas();
        match schemas.get(&name) {
            Some(entry) => {
                *entry.schema.write().unwrap_or_else(|p| p.into_inner()) = Arc::new(schema);
                info!(event = %name, "event schema updated");
            }
            None => {
                schemas.insert(name.clone(), Arc::new(SchemaEntry::new(schema)));
                info!(event = %name, "event schema registered");
            }
        }
    }

    /// Remove a schema and both of its handler lists. No-op if absent.
    pub fn unregister_schema(&self, name: &str) -> bool {
        let removed = self.write_schemas().remove(name).is_some();
        if removed {
            info!(event = %name, "event schema unregistered");
        }
        removed
    }

    pub fn schema(&self, name: &str) -> Option<Arc<EventSchema>> {
        self.entry(name).map(|e| e.schema())
    }

    pub fn has_schema(&self, name: &str) -> bool {
        self.read_schemas().contains_key(name)
    }

    pub fn schema_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read_schemas().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn schemas_tagged(&self, tag: &str) -> Vec<Arc<EventSchema>> {
        let mut tagged: Vec<Arc<EventSchema>> = self
            .read_schemas()
            .values()
            .map(|e| e.schema())
            .filter(|s| s.has_tag(tag))
            .collect();
        tagged.sort_by(|a, b| a.name().cmp(b.name()));
        tagged
    }

    // ---------------------------------------------------------------------
    // Handlers
    // ---------------------------------------------------------------------

    /// Attach a handler to an event.
    ///
    /// It goes to the global list when the schema is global or the handler is
    /// not scope-bound, otherwise to the local (scope-filtered) list.
    pub fn register_handler(&self, event: &str, handler: Handler) -> EventResult<HandlerId> {
        let entry = self
            .entry(event)
            .ok_or_else(|| EventError::unknown_event(event))?;
        let schema = entry.schema();
        let id = handler.id();
        let registered = Registered {
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            handler,
        };

        let list = if schema.scope() == SchemaScope::Global || registered.handler.is_global() {
            &entry.global
        } else {
            &entry.local
        };
        debug!(event = %event, handler_id = %id, priority = registered.handler.priority(), "handler registered");
        SchemaEntry::update(list, |v| v.push(registered));
        Ok(id)
    }

    pub fn unregister_handler(&self, event: &str, id: HandlerId) -> bool {
        let Some(entry) = self.entry(event) else {
            return false;
        };
        let mut removed = false;
        for list in [&entry.global, &entry.local] {
            SchemaEntry::update(list, |v| {
                let before = v.len();
                v.retain(|r| r.handler.id() != id);
                removed |= v.len() != before;
            });
        }
        removed
    }

    /// Drop every handler owned by `actor`, across all events.
    pub fn unregister_handlers_for_actor(&self, actor: &ActorId) -> usize {
        let entries: Vec<Arc<SchemaEntry>> = self.read_schemas().values().cloned().collect();
        let mut removed = 0;
        for entry in entries {
            for list in [&entry.global, &entry.local] {
                SchemaEntry::update(list, |v| {
                    let before = v.len();
                    v.retain(|r| r.handler.bound_actor() != Some(actor));
                    removed += before - v.len();
                });
            }
        }
        if removed > 0 {
            info!(actor = %actor, removed, "handlers unregistered for actor");
        }
        removed
    }

    pub fn handler_count(&self, event: &str) -> usize {
        self.entry(event).map(|e| e.handler_count()).unwrap_or(0)
    }

    // ---------------------------------------------------------------------
    // Triggers
    // ---------------------------------------------------------------------

    fn read_triggers(&self) -> std::sync::RwLockReadGuard<'_, TriggerIndex> {
        self.triggers.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write_triggers(&self) -> std::sync::RwLockWriteGuard<'_, TriggerIndex> {
        self.triggers.write().unwrap_or_else(|p| p.into_inner())
    }

    pub fn register_trigger(&self, trigger: Trigger) -> Arc<Trigger> {
        let trigger = Arc::new(trigger);
        let mut index = self.write_triggers();
        index.by_id.insert(trigger.id(), Arc::clone(&trigger));
        if let Some(activation) = trigger.activation() {
            let list = index.by_activation.entry(activation.to_string()).or_default();
            let mut next = list.as_ref().clone();
            next.push(Arc::clone(&trigger));
            *list = Arc::new(next);
        }
        debug!(trigger_id = %trigger.id(), event = %trigger.event_name(), activation = ?trigger.activation(), "trigger registered");
        trigger
    }

    pub fn trigger(&self, id: TriggerId) -> Option<Arc<Trigger>> {
        self.read_triggers().by_id.get(&id).cloned()
    }

    pub fn trigger_count(&self) -> usize {
        self.read_triggers().by_id.len()
    }

    /// Fire a registered trigger by id.
    pub fn fire_trigger(
        &self,
        id: TriggerId,
        actor: Option<ActorId>,
        scope: Option<ScopeId>,
    ) -> EventResult<FireOutcome> {
        let trigger = self
            .trigger(id)
            .ok_or(EventError::UnknownTrigger { id })?;
        trigger.fire(self, actor, scope)
    }

    /// Cancel a trigger (and its queued callbacks) and remove it.
    pub fn unregister_trigger(&self, id: TriggerId) -> bool {
        match self.forget_trigger(id) {
            Some(trigger) => {
                trigger.cancel();
                info!(trigger_id = %id, "trigger unregistered");
                true
            }
            None => false,
        }
    }

    /// Remove from the index without cancelling (used on self-deactivation).
    pub(crate) fn forget_trigger(&self, id: TriggerId) -> Option<Arc<Trigger>> {
        let mut index = self.write_triggers();
        let trigger = index.by_id.remove(&id)?;
        if let Some(activation) = trigger.activation() {
            if let Some(list) = index.by_activation.get_mut(activation) {
                let next: Vec<Arc<Trigger>> =
                    list.iter().filter(|t| t.id() != id).cloned().collect();
                if next.is_empty() {
                    index.by_activation.remove(activation);
                } else {
                    *list = Arc::new(next);
                }
            }
        }
        Some(trigger)
    }

    fn activate_triggers(&self, event: &EventInstance) {
        let Some(triggers) = self.read_triggers().by_activation.get(&event.name).cloned() else {
            return;
        };
        for trigger in triggers.iter() {
            if let Err(err) = trigger.fire_with(self, event.actor, event.scope.clone(), &event.data) {
                warn!(
                    trigger_id = %trigger.id(),
                    activation = %event.name,
                    error = %err,
                    "activated trigger failed"
                );
            }
        }
    }

    // ---------------------------------------------------------------------
    // Dispatch
    // ---------------------------------------------------------------------

    /// Validate and dispatch an event.
    pub fn publish(
        &self,
        name: &str,
        data: EventData,
        actor: Option<ActorId>,
        scope: Option<ScopeId>,
    ) -> EventResult<DispatchReport> {
        self.dispatch(name, data, actor, scope).map(|(report, _)| report)
    }

    /// `publish`, also returning the validated event (used by triggers for
    /// chain back-references).
    pub(crate) fn dispatch(
        &self,
        name: &str,
        data: EventData,
        actor: Option<ActorId>,
        scope: Option<ScopeId>,
    ) -> EventResult<(DispatchReport, EventInstance)> {
        let started = Instant::now();
        let entry = self
            .entry(name)
            .ok_or_else(|| EventError::unknown_event(name))?;

        let depth_guard = match DepthGuard::enter(self.config.max_dispatch_depth) {
            Ok(guard) => guard,
            Err(depth) => {
                let err = EventError::RecursionLimit {
                    event: name.to_string(),
                    depth,
                };
                warn!(event = %name, depth, "dispatch depth limit reached");
                self.record_rejection(name, started, &err);
                return Err(err);
            }
        };
        let depth = depth_guard.depth;

        let schema = entry.schema();
        let data = match schema.validate(data) {
            Ok(data) => data,
            Err(err) => {
                debug!(event = %name, error = %err, "event rejected");
                self.record_rejection(name, started, &err);
                return Err(err);
            }
        };

        let event = EventInstance::new(name, data, actor, scope, self.clock.now());

        // Handlers are fixed before any user code runs; registrations made
        // during this dispatch apply from the next publish on.
        let handlers = entry.resolve(&schema, event.scope.as_ref());
        let one_shot_consumed = schema.is_one_shot() && !handlers.is_empty();
        if one_shot_consumed {
            if !self.claim_one_shot(name, &entry) {
                debug!(event = %name, "one-shot event already consumed");
                return Err(EventError::unknown_event(name));
            }
            info!(event = %name, "one-shot event consumed");
        }

        self.correlation.process_event(&event);
        self.activate_triggers(&event);

        let mut failed = 0;
        for handler in &handlers {
            if let Err(err) = invoke_isolated(handler, &event) {
                failed += 1;
                error!(event = %name, handler_id = %handler.id(), error = %err, "handler failed");
            }
        }

        let report = DispatchReport {
            event: name.to_string(),
            handlers_invoked: handlers.len(),
            handlers_failed: failed,
            elapsed: started.elapsed(),
            depth,
            dispatched_at: event.timestamp,
            one_shot_consumed,
        };
        self.record(name, DispatchRecord::from(&report));
        debug!(
            event = %name,
            handlers = report.handlers_invoked,
            failed = report.handlers_failed,
            depth,
            "event dispatched"
        );
        Ok((report, event))
    }

    /// Claim `entry` for the single dispatch a one-shot schema allows and
    /// unregister it. Returns false when another dispatch got there first.
    fn claim_one_shot(&self, name: &str, entry: &Arc<SchemaEntry>) -> bool {
        if entry
            .consumed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        let mut schemas = self.write_schemas();
        if schemas
            .get(name)
            .is_some_and(|current| Arc::ptr_eq(current, entry))
        {
            schemas.remove(name);
        }
        true
    }

    // ---------------------------------------------------------------------
    // History
    // ---------------------------------------------------------------------

    fn record(&self, name: &str, record: DispatchRecord) {
        let mut history = self.history.lock().unwrap_or_else(|p| p.into_inner());
        history
            .entry(name.to_string())
            .or_insert_with(|| HistoryRing::new(self.config.history_capacity))
            .push(record);
    }

    fn record_rejection(&self, name: &str, started: Instant, err: &EventError) {
        self.record(
            name,
            DispatchRecord {
                at: self.clock.now(),
                elapsed: started.elapsed(),
                outcome: DispatchOutcome::Rejected {
                    reason: err.to_string(),
                },
            },
        );
    }

    /// Recent dispatch records for `name`, oldest first.
    pub fn history(&self, name: &str) -> Vec<DispatchRecord> {
        self.history
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
            .map(HistoryRing::snapshot)
            .unwrap_or_default()
    }

    pub fn clear_history(&self, name: &str) {
        self.history
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(name);
    }
}

/// Run one handler, turning both errors and panics into `HandlerExecution`.
fn invoke_isolated(handler: &Handler, event: &EventInstance) -> EventResult<()> {
    let message = match catch_unwind(AssertUnwindSafe(|| handler.invoke(event))) {
        Ok(Ok(())) => return Ok(()),
        Ok(Err(err)) => format!("{err:#}"),
        Err(panic) => panic
            .downcast_ref::<&str>()
            .map(|s| format!("panicked: {s}"))
            .or_else(|| {
                panic
                    .downcast_ref::<String>()
                    .map(|s| format!("panicked: {s}"))
            })
            .unwrap_or_else(|| "panicked".to_string()),
    };
    Err(EventError::HandlerExecution {
        event: event.name.clone(),
        handler: handler.id().to_string(),
        message,
    })
}

impl core::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventBus")
            .field("config", &self.config)
            .field("schemas", &self.schema_names())
            .field("triggers", &self.trigger_count())
            .finish_non_exhaustive()
    }
}
