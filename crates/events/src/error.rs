//! Error taxonomy for the trigger subsystem.
//!
//! Structural errors (`UnknownEvent`, `Validation`, `DuplicateSchema`, ...) are
//! returned synchronously to the caller. Execution errors (`HandlerExecution`,
//! `ChainStep`) are only ever logged: dispatch keeps going past them.

use serde::Serialize;
use thiserror::Error;

use blockscript_core::TriggerId;

/// Result type used across the events crate.
pub type EventResult<T> = Result<T, EventError>;

/// Why a single field failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ViolationKind {
    /// A required field was absent (or `null`).
    Missing,
    /// A field was present with a value of the wrong type.
    TypeMismatch { expected: String, found: String },
}

/// One offending field in a rejected event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldViolation {
    pub field: String,
    #[serde(flatten)]
    pub kind: ViolationKind,
}

impl FieldViolation {
    pub fn missing(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            kind: ViolationKind::Missing,
        }
    }

    pub fn type_mismatch(
        field: impl Into<String>,
        expected: impl Into<String>,
        found: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            kind: ViolationKind::TypeMismatch {
                expected: expected.into(),
                found: found.into(),
            },
        }
    }
}

impl core::fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match &self.kind {
            ViolationKind::Missing => write!(f, "{}: missing required field", self.field),
            ViolationKind::TypeMismatch { expected, found } => {
                write!(f, "{}: expected {expected}, found {found}", self.field)
            }
        }
    }
}

fn join_violations(violations: &[FieldViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    /// No schema is registered under this name.
    #[error("unknown event: {name}")]
    UnknownEvent { name: String },

    /// Event data did not satisfy its schema.
    #[error("validation failed for {event}: {}", join_violations(.violations))]
    Validation {
        event: String,
        violations: Vec<FieldViolation>,
    },

    /// A live schema already uses this name.
    #[error("event schema already registered: {name}")]
    DuplicateSchema { name: String },

    /// A schema declared the same field twice.
    #[error("schema {schema} declares field {field} more than once")]
    DuplicateField { schema: String, field: String },

    /// A handler returned an error or panicked. Logged, never propagated.
    #[error("handler {handler} failed on {event}: {message}")]
    HandlerExecution {
        event: String,
        handler: String,
        message: String,
    },

    /// A chain step could not publish its follow-up event. Logged per step.
    #[error("chain step {target} of trigger {trigger} failed: {source}")]
    ChainStep {
        trigger: TriggerId,
        target: String,
        #[source]
        source: Box<EventError>,
    },

    /// Nested publishing went deeper than the configured limit.
    #[error("dispatch depth {depth} exceeded while publishing {event}")]
    RecursionLimit { event: String, depth: usize },

    /// A pattern was built without any steps.
    #[error("pattern {name} has no steps")]
    EmptyPattern { name: String },

    /// No trigger is registered under this id.
    #[error("unknown trigger: {id}")]
    UnknownTrigger { id: TriggerId },
}

impl EventError {
    pub fn unknown_event(name: impl Into<String>) -> Self {
        Self::UnknownEvent { name: name.into() }
    }

    /// Field names named by a validation error (empty for other variants).
    pub fn offending_fields(&self) -> Vec<&str> {
        match self {
            EventError::Validation { violations, .. } => {
                violations.iter().map(|v| v.field.as_str()).collect()
            }
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_message_lists_every_field() {
        let err = EventError::Validation {
            event: "orderPlaced".to_string(),
            violations: vec![
                FieldViolation::missing("amount"),
                FieldViolation::type_mismatch("note", "string", "integer"),
            ],
        };

        let msg = err.to_string();
        assert!(msg.contains("amount: missing required field"));
        assert!(msg.contains("note: expected string, found integer"));
        assert_eq!(err.offending_fields(), vec!["amount", "note"]);
    }
}
