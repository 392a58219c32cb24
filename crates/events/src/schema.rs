//! Event schemas: the typed shape and routing scope of one named event.

use std::collections::{BTreeSet, HashSet};

use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::error::{EventError, EventResult, FieldViolation};
use crate::event::EventData;

/// Value type a field accepts.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Any,
    Bool,
    Integer,
    /// Any JSON number, integers included.
    Number,
    String,
    List,
    Object,
}

impl FieldType {
    pub fn accepts(self, value: &JsonValue) -> bool {
        match self {
            FieldType::Any => true,
            FieldType::Bool => value.is_boolean(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Number => value.is_number(),
            FieldType::String => value.is_string(),
            FieldType::List => value.is_array(),
            FieldType::Object => value.is_object(),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            FieldType::Any => "any",
            FieldType::Bool => "bool",
            FieldType::Integer => "integer",
            FieldType::Number => "number",
            FieldType::String => "string",
            FieldType::List => "list",
            FieldType::Object => "object",
        }
    }
}

/// Name of the JSON type of `value`, for validation messages.
pub(crate) fn json_type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(n) if n.is_i64() || n.is_u64() => "integer",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "list",
        JsonValue::Object(_) => "object",
    }
}

/// One declared field of a schema.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldSpec {
    pub name: String,
    pub field_type: FieldType,
    pub required: bool,
    /// Applied when an optional field is absent.
    pub default_value: Option<JsonValue>,
}

impl FieldSpec {
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
            default_value: None,
        }
    }

    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
            default_value: None,
        }
    }

    pub fn with_default(mut self, value: impl Into<JsonValue>) -> Self {
        self.default_value = Some(value.into());
        self
    }
}

/// Routing scope of an event.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaScope {
    /// Every handler sees every occurrence.
    #[default]
    Global,
    /// Scope-bound handlers only see occurrences from their own scope.
    Local,
}

/// Definition of one named event type.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventSchema {
    name: String,
    fields: Vec<FieldSpec>,
    scope: SchemaScope,
    one_shot: bool,
    priority: i32,
    tags: BTreeSet<String>,
}

impl EventSchema {
    pub fn builder(name: impl Into<String>) -> EventSchemaBuilder {
        EventSchemaBuilder {
            name: name.into(),
            fields: Vec::new(),
            scope: SchemaScope::Global,
            one_shot: false,
            priority: 0,
            tags: BTreeSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn scope(&self) -> SchemaScope {
        self.scope
    }

    pub fn is_local(&self) -> bool {
        self.scope == SchemaScope::Local
    }

    pub fn is_one_shot(&self) -> bool {
        self.one_shot
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    /// Validate `data` and return it with defaults applied.
    ///
    /// Every violation is collected before failing, so callers see all the
    /// offending fields at once. Fields not declared by the schema pass through
    /// untouched. A `null` value counts as absent.
    pub fn validate(&self, mut data: EventData) -> EventResult<EventData> {
        let mut violations = Vec::new();

        for spec in &self.fields {
            match data.get(&spec.name) {
                None | Some(JsonValue::Null) => {
                    if spec.required {
                        violations.push(FieldViolation::missing(&spec.name));
                    } else if let Some(default) = &spec.default_value {
                        data.insert(spec.name.clone(), default.clone());
                    }
                }
                Some(value) if !spec.field_type.accepts(value) => {
                    violations.push(FieldViolation::type_mismatch(
                        &spec.name,
                        spec.field_type.name(),
                        json_type_name(value),
                    ));
                }
                Some(_) => {}
            }
        }

        if violations.is_empty() {
            Ok(data)
        } else {
            Err(EventError::Validation {
                event: self.name.clone(),
                violations,
            })
        }
    }
}

/// Fluent construction for [`EventSchema`].
#[derive(Debug, Clone)]
pub struct EventSchemaBuilder {
    name: String,
    fields: Vec<FieldSpec>,
    scope: SchemaScope,
    one_shot: bool,
    priority: i32,
    tags: BTreeSet<String>,
}

impl EventSchemaBuilder {
    pub fn field(mut self, spec: FieldSpec) -> Self {
        self.fields.push(spec);
        self
    }

    pub fn required(self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.field(FieldSpec::required(name, field_type))
    }

    pub fn optional(self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.field(FieldSpec::optional(name, field_type))
    }

    pub fn optional_with_default(
        self,
        name: impl Into<String>,
        field_type: FieldType,
        default: impl Into<JsonValue>,
    ) -> Self {
        self.field(FieldSpec::optional(name, field_type).with_default(default))
    }

    pub fn scope(mut self, scope: SchemaScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn local(self) -> Self {
        self.scope(SchemaScope::Local)
    }

    pub fn one_shot(mut self) -> Self {
        self.one_shot = true;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn build(self) -> EventResult<EventSchema> {
        let mut seen = HashSet::new();
        for f in &self.fields {
            if !seen.insert(f.name.as_str()) {
                return Err(EventError::DuplicateField {
                    schema: self.name.clone(),
                    field: f.name.clone(),
                });
            }
        }

        Ok(EventSchema {
            name: self.name,
            fields: self.fields,
            scope: self.scope,
            one_shot: self.one_shot,
            priority: self.priority,
            tags: self.tags,
        })
    }
}
