//! `blockscript-events`: the event-driven trigger subsystem.
//!
//! - [`EventBus`]: schema registry, validation, priority-ordered dispatch
//! - [`Trigger`]: guarded, delayed/repeating firing with chained follow-ups
//! - [`CorrelationEngine`]: ordered multi-step pattern detection with timeouts
//!
//! Everything here is in-process and synchronous. Delays and periodic work are
//! delegated to a host-supplied [`Scheduler`].

pub mod bus;
pub mod chain;
pub mod config;
pub mod correlation;
pub mod error;
pub mod event;
pub mod handler;
pub mod history;
pub mod scheduler;
pub mod schema;
pub mod template;
pub mod trigger;

pub use bus::EventBus;
pub use chain::ChainStep;
pub use config::BusConfig;
pub use correlation::{
    CompletedStep, CorrelationEngine, Pattern, PatternBuilder, PatternCompletionListener,
    PatternInstance, PatternStep,
};
pub use error::{EventError, EventResult, FieldViolation, ViolationKind};
pub use event::{EventData, EventInstance};
pub use handler::{EventHandler, Handler};
pub use history::{DispatchOutcome, DispatchRecord, DispatchReport};
pub use scheduler::{ManualScheduler, ScheduledTask, Scheduler, Task};
pub use schema::{EventSchema, EventSchemaBuilder, FieldSpec, FieldType, SchemaScope};
pub use template::{DataTemplate, TemplateValue};
pub use trigger::{FireOutcome, Trigger, TriggerBuilder};
