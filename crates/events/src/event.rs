use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;

use blockscript_core::{ActorId, ScopeId};

/// Field values carried by an event.
pub type EventData = serde_json::Map<String, JsonValue>;

/// One occurrence of an event, as seen by handlers, triggers and patterns.
///
/// Instances are ephemeral: they exist for the duration of a single dispatch
/// and `data` has already been validated and defaulted against the schema.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventInstance {
    pub name: String,
    pub data: EventData,
    pub actor: Option<ActorId>,
    pub scope: Option<ScopeId>,
    pub timestamp: DateTime<Utc>,
}

impl EventInstance {
    pub fn new(
        name: impl Into<String>,
        data: EventData,
        actor: Option<ActorId>,
        scope: Option<ScopeId>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            data,
            actor,
            scope,
            timestamp,
        }
    }

    pub fn get(&self, field: &str) -> Option<&JsonValue> {
        self.data.get(field)
    }
}
