//! Opt-in schema descriptors.
//!
//! A type with no registered descriptor is stored as-is. A registered
//! descriptor contributes three things: field transforms applied before
//! storage, a validation contract checked on every create/update/replace, and
//! the set of fields that receive an index.

use crate::core::error::QuireError;
use crate::core::filter;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
    #[default]
    Any,
}

impl FieldKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Number => "number",
            FieldKind::Integer => "integer",
            FieldKind::Boolean => "boolean",
            FieldKind::Array => "array",
            FieldKind::Object => "object",
            FieldKind::Any => "any",
        }
    }

    fn accepts(&self, value: &JsonValue) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Integer => value.is_i64() || value.is_u64(),
            FieldKind::Boolean => value.is_boolean(),
            FieldKind::Array => value.is_array(),
            FieldKind::Object => value.is_object(),
            FieldKind::Any => true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum FieldRule {
    MinLength(usize),
    MaxLength(usize),
    Pattern(String),
    Min(f64),
    Max(f64),
    OneOf(Vec<JsonValue>),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum FieldTransform {
    Trim,
    Lowercase,
    Uppercase,
    /// Fills the field of a full document when it is absent or null.
    Default(JsonValue),
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct FieldSpec {
    #[serde(default)]
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub indexed: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validate: Vec<FieldRule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transform: Vec<FieldTransform>,
}

impl FieldSpec {
    pub fn new(kind: FieldKind) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn rule(mut self, rule: FieldRule) -> Self {
        self.validate.push(rule);
        self
    }

    pub fn transform(mut self, transform: FieldTransform) -> Self {
        self.transform.push(transform);
        self
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SchemaDescriptor {
    #[serde(rename = "type")]
    pub entity_type: String,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldSpec>,
}

/// `Full` documents (create, replace) get defaults filled; `Merged` ones (update) do not.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrepareMode {
    Full,
    Merged,
}

impl SchemaDescriptor {
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn field(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        self.fields.insert(name.into(), spec);
        self
    }

    /// Reject descriptors that could never be enforced.
    pub fn check(&self) -> Result<(), QuireError> {
        check_entity_type(&self.entity_type)?;
        for (name, spec) in &self.fields {
            filter::check_field_name(name)?;
            // Documents are validated by top-level key; a dotted name would be
            // looked up literally there but as a nested path by filters and indexes.
            if name.contains('.') {
                return Err(QuireError::ValidationError(format!(
                    "schema field '{name}' must be a top-level name, not a path"
                )));
            }
            for rule in &spec.validate {
                if let FieldRule::Pattern(pattern) = rule {
                    Regex::new(pattern).map_err(|e| {
                        QuireError::ValidationError(format!(
                            "field '{name}' has an invalid pattern: {e}"
                        ))
                    })?;
                }
            }
        }
        Ok(())
    }

    /// Fields that get an index at registration time.
    pub fn indexed_fields(&self) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .filter(|(_, spec)| spec.indexed || spec.unique)
            .map(|(name, _)| name.as_str())
    }

    pub fn unique_fields(&self) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .filter(|(_, spec)| spec.unique)
            .map(|(name, _)| name.as_str())
    }

    /// Apply transforms, then validate. Returns the document to store.
    pub fn prepare(&self, doc: &JsonValue, mode: PrepareMode) -> Result<JsonValue, QuireError> {
        let mut obj = require_object(doc)?.clone();
        self.apply_transforms(&mut obj, mode);
        let errors = self.violations(&obj);
        if !errors.is_empty() {
            return Err(QuireError::ValidationError(format!(
                "{}: {}",
                self.entity_type,
                errors.join("; ")
            )));
        }
        Ok(JsonValue::Object(obj))
    }

    fn apply_transforms(&self, obj: &mut Map<String, JsonValue>, mode: PrepareMode) {
        for (name, spec) in &self.fields {
            for transform in &spec.transform {
                match transform {
                    FieldTransform::Default(value) => {
                        let missing = obj.get(name).is_none_or(JsonValue::is_null);
                        if mode == PrepareMode::Full && missing {
                            obj.insert(name.clone(), value.clone());
                        }
                    }
                    FieldTransform::Trim => map_string(obj, name, |s| s.trim().to_string()),
                    FieldTransform::Lowercase => map_string(obj, name, |s| s.to_lowercase()),
                    FieldTransform::Uppercase => map_string(obj, name, |s| s.to_uppercase()),
                }
            }
        }
    }

    fn violations(&self, obj: &Map<String, JsonValue>) -> Vec<String> {
        let mut errors = Vec::new();
        for (name, spec) in &self.fields {
            let value = match obj.get(name) {
                None | Some(JsonValue::Null) => {
                    if spec.required {
                        errors.push(format!("field '{name}' is required"));
                    }
                    continue;
                }
                Some(value) => value,
            };
            if !spec.kind.accepts(value) {
                errors.push(format!(
                    "field '{name}' must be of kind {}",
                    spec.kind.as_str()
                ));
                continue;
            }
            for rule in &spec.validate {
                if let Some(message) = rule_violation(name, rule, value) {
                    errors.push(message);
                }
            }
        }
        errors
    }
}

fn map_string(obj: &mut Map<String, JsonValue>, name: &str, f: impl Fn(&str) -> String) {
    if let Some(JsonValue::String(s)) = obj.get_mut(name) {
        *s = f(s);
    }
}

fn rule_violation(name: &str, rule: &FieldRule, value: &JsonValue) -> Option<String> {
    let length = match value {
        JsonValue::String(s) => Some(s.chars().count()),
        JsonValue::Array(items) => Some(items.len()),
        _ => None,
    };
    match rule {
        FieldRule::MinLength(min) => match length {
            Some(len) if len < *min => {
                Some(format!("field '{name}' must have length >= {min}"))
            }
            _ => None,
        },
        FieldRule::MaxLength(max) => match length {
            Some(len) if len > *max => {
                Some(format!("field '{name}' must have length <= {max}"))
            }
            _ => None,
        },
        FieldRule::Pattern(pattern) => {
            let text = value.as_str()?;
            match Regex::new(pattern) {
                Ok(re) if re.is_match(text) => None,
                Ok(_) => Some(format!("field '{name}' must match /{pattern}/")),
                Err(e) => Some(format!("field '{name}' has an invalid pattern: {e}")),
            }
        }
        FieldRule::Min(min) => match value.as_f64() {
            Some(n) if n < *min => Some(format!("field '{name}' must be >= {min}")),
            _ => None,
        },
        FieldRule::Max(max) => match value.as_f64() {
            Some(n) if n > *max => Some(format!("field '{name}' must be <= {max}")),
            _ => None,
        },
        FieldRule::OneOf(allowed) => {
            if allowed.contains(value) {
                None
            } else {
                Some(format!("field '{name}' must be one of {}", JsonValue::from(allowed.clone())))
            }
        }
    }
}

/// Documents are JSON objects, registered schema or not.
pub fn require_object(doc: &JsonValue) -> Result<&Map<String, JsonValue>, QuireError> {
    doc.as_object()
        .ok_or_else(|| QuireError::ValidationError("document must be a JSON object".to_string()))
}

pub fn check_entity_type(entity_type: &str) -> Result<(), QuireError> {
    if entity_type.trim().is_empty() {
        return Err(QuireError::ValidationError(
            "entity type must not be empty".to_string(),
        ));
    }
    if entity_type.chars().any(|c| c.is_control()) {
        return Err(QuireError::ValidationError(format!(
            "entity type {entity_type:?} contains control characters"
        )));
    }
    Ok(())
}
