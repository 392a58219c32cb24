//! Chain steps: templated follow-up events fired by a trigger.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error};

use blockscript_core::ActorId;

use crate::bus::EventBus;
use crate::error::EventError;
use crate::event::{EventData, EventInstance};
use crate::template::DataTemplate;
use crate::trigger::Trigger;

/// Decides whether a chain step runs, given the actor and the resolved child data.
pub type ChainGuard = Arc<dyn Fn(Option<&ActorId>, &EventData) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct ChainStep {
    target: String,
    template: DataTemplate,
    delay: Duration,
    guard: Option<ChainGuard>,
}

impl ChainStep {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            template: DataTemplate::new(),
            delay: Duration::ZERO,
            guard: None,
        }
    }

    pub fn with_data(mut self, template: DataTemplate) -> Self {
        self.template = template;
        self
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn when<F>(mut self, guard: F) -> Self
    where
        F: Fn(Option<&ActorId>, &EventData) -> bool + Send + Sync + 'static,
    {
        self.guard = Some(Arc::new(guard));
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn template(&self) -> &DataTemplate {
        &self.template
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Resolve against `parent` and publish (now or after the delay).
    ///
    /// Failures are logged here and never returned: one broken step must not
    /// keep its siblings from firing.
    pub(crate) fn run(&self, bus: &EventBus, trigger: &Arc<Trigger>, parent: &EventInstance) {
        let data = self.template.resolve(&parent.data);

        if let Some(guard) = &self.guard {
            if !guard(parent.actor.as_ref(), &data) {
                debug!(trigger_id = %trigger.id(), target = %self.target, "chain step guard rejected");
                return;
            }
        }

        if self.delay.is_zero() {
            publish_step(bus, trigger, &self.target, data, parent);
            return;
        }

        let weak_bus = bus.weak_handle();
        let trigger = Arc::clone(trigger);
        let target = self.target.clone();
        let parent = parent.clone();
        bus.scheduler().after(self.delay, move || {
            if trigger.is_cancelled() {
                debug!(trigger_id = %trigger.id(), target = %target, "delayed chain step cancelled");
                return;
            }
            match weak_bus.upgrade() {
                Some(bus) => publish_step(&bus, &trigger, &target, data, &parent),
                None => debug!(target = %target, "bus dropped before delayed chain step"),
            }
        });
    }
}

fn publish_step(
    bus: &EventBus,
    trigger: &Trigger,
    target: &str,
    data: EventData,
    parent: &EventInstance,
) {
    if let Err(source) = bus.publish(target, data, parent.actor, parent.scope.clone()) {
        let err = EventError::ChainStep {
            trigger: trigger.id(),
            target: target.to_string(),
            source: Box::new(source),
        };
        error!(trigger_id = %trigger.id(), parent = %parent.name, error = %err, "chain step failed");
    }
}

impl core::fmt::Debug for ChainStep {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ChainStep")
            .field("target", &self.target)
            .field("template", &self.template)
            .field("delay", &self.delay)
            .field("guarded", &self.guard.is_some())
            .finish()
    }
}
