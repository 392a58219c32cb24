//! Payload templates with back-references into a parent event.
//!
//! A template maps field names to either a literal value or a reference to a
//! field of the parent event (written `"$field"` in JSON form). References are
//! resolved when the template is used, never when it is built.

use std::collections::BTreeMap;

use serde_json::Value as JsonValue;
use tracing::debug;

use crate::event::EventData;

#[derive(Debug, Clone, PartialEq)]
pub enum TemplateValue {
    Literal(JsonValue),
    /// Copy the named field from the parent event.
    FieldRef(String),
}

impl TemplateValue {
    pub fn literal(value: impl Into<JsonValue>) -> Self {
        Self::Literal(value.into())
    }

    pub fn field(name: impl Into<String>) -> Self {
        Self::FieldRef(name.into())
    }

    /// Interpret a raw JSON value: `"$name"` is a reference, `"$$..."` is a
    /// literal string starting with a single `$`, everything else is literal.
    pub fn parse(value: JsonValue) -> Self {
        if let JsonValue::String(s) = &value {
            if let Some(rest) = s.strip_prefix("$$") {
                return Self::Literal(JsonValue::String(format!("${rest}")));
            }
            if let Some(name) = s.strip_prefix('$') {
                if !name.is_empty() {
                    return Self::FieldRef(name.to_string());
                }
            }
        }
        Self::Literal(value)
    }

    fn resolve(&self, parent: &EventData) -> Option<JsonValue> {
        match self {
            TemplateValue::Literal(v) => Some(v.clone()),
            TemplateValue::FieldRef(name) => parent.get(name).cloned(),
        }
    }
}

/// Field name → template value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataTemplate {
    entries: BTreeMap<String, TemplateValue>,
}

impl DataTemplate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a JSON object, parsing `"$field"` strings as references.
    pub fn from_json(object: EventData) -> Self {
        Self {
            entries: object
                .into_iter()
                .map(|(k, v)| (k, TemplateValue::parse(v)))
                .collect(),
        }
    }

    pub fn set(mut self, field: impl Into<String>, value: TemplateValue) -> Self {
        self.entries.insert(field.into(), value);
        self
    }

    pub fn literal(self, field: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.set(field, TemplateValue::literal(value))
    }

    /// Copy `source` from the parent event into `field`.
    pub fn copy(self, field: impl Into<String>, source: impl Into<String>) -> Self {
        self.set(field, TemplateValue::field(source))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Produce concrete data against `parent`.
    ///
    /// A reference to a field the parent does not carry leaves the target field
    /// absent, so schema validation reports it if it was required.
    pub fn resolve(&self, parent: &EventData) -> EventData {
        let mut out = EventData::new();
        for (field, value) in &self.entries {
            match value.resolve(parent) {
                Some(v) => {
                    out.insert(field.clone(), v);
                }
                None => {
                    debug!(field = %field, "template reference unresolved; field omitted");
                }
            }
        }
        out
    }
}

impl FromIterator<(String, TemplateValue)> for DataTemplate {
    fn from_iter<I: IntoIterator<Item = (String, TemplateValue)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}
