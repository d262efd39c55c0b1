//! Filter DSL compilation.
//!
//! A filter is a JSON object mapping field names to either a literal
//! (equality) or an operator object using `$gt $gte $lt $lte $ne $in $like`.
//! Several operators in one object are AND-ed. Dotted names address nested
//! document fields; the reserved names `_id`, `_version`, `_created_at` and
//! `_updated_at` address row columns instead of the document.

use crate::core::error::QuireError;
use regex::Regex;
use rusqlite::types::Value as SqlValue;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::OnceLock;

fn field_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)*$").expect("static regex")
    })
}

/// Field names end up inside SQL text (JSON paths, index DDL), so they are
/// restricted to dotted identifiers.
pub fn check_field_name(name: &str) -> Result<(), QuireError> {
    if field_name_re().is_match(name) {
        Ok(())
    } else {
        Err(QuireError::ValidationError(format!(
            "invalid field name {name:?}: expected identifier segments separated by '.'"
        )))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FieldRef {
    Column(&'static str),
    Document(String),
}

impl FieldRef {
    pub fn parse(name: &str) -> Result<Self, QuireError> {
        match name {
            "_id" => Ok(FieldRef::Column("id")),
            "_version" => Ok(FieldRef::Column("version")),
            "_created_at" => Ok(FieldRef::Column("created_at")),
            "_updated_at" => Ok(FieldRef::Column("updated_at")),
            _ => {
                check_field_name(name)?;
                Ok(FieldRef::Document(name.to_string()))
            }
        }
    }

    pub fn sql(&self) -> String {
        match self {
            FieldRef::Column(column) => (*column).to_string(),
            FieldRef::Document(path) => json_path_sql(path),
        }
    }

    pub fn document_field(&self) -> Option<&str> {
        match self {
            FieldRef::Document(path) => Some(path),
            FieldRef::Column(_) => None,
        }
    }
}

/// `json_extract` expression for an already-checked field path.
pub fn json_path_sql(path: &str) -> String {
    format!("json_extract(data, '$.{path}')")
}

#[derive(Clone, Debug, PartialEq)]
pub enum Condition {
    Eq(JsonValue),
    Ne(JsonValue),
    Gt(JsonValue),
    Gte(JsonValue),
    Lt(JsonValue),
    Lte(JsonValue),
    In(Vec<JsonValue>),
    Like(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Clause {
    pub field: FieldRef,
    pub condition: Condition,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Filter {
    pub clauses: Vec<Clause>,
}

impl Filter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn parse(value: &JsonValue) -> Result<Self, QuireError> {
        let obj = match value {
            JsonValue::Null => return Ok(Self::all()),
            JsonValue::Object(obj) => obj,
            other => {
                return Err(QuireError::ValidationError(format!(
                    "filter must be a JSON object, got {other}"
                )));
            }
        };

        let mut clauses = Vec::new();
        for (name, spec) in obj {
            let field = FieldRef::parse(name)?;
            match spec {
                JsonValue::Object(ops) if is_operator_object(ops) => {
                    for (op, operand) in ops {
                        clauses.push(Clause {
                            field: field.clone(),
                            condition: parse_operator(name, op, operand)?,
                        });
                    }
                }
                literal => clauses.push(Clause {
                    field,
                    condition: Condition::Eq(literal.clone()),
                }),
            }
        }
        Ok(Self { clauses })
    }

    /// Document fields referenced by this filter, in clause order, deduplicated.
    pub fn document_fields(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for clause in &self.clauses {
            if let Some(path) = clause.field.document_field()
                && !out.iter().any(|f| f == path)
            {
                out.push(path.to_string());
            }
        }
        out
    }

    /// Render as a conjunction of SQL predicates using positional `?`
    /// placeholders. Returns `None` for the empty filter.
    pub fn to_sql(&self) -> Option<(String, Vec<SqlValue>)> {
        if self.clauses.is_empty() {
            return None;
        }
        let mut parts = Vec::with_capacity(self.clauses.len());
        let mut params = Vec::new();
        for clause in &self.clauses {
            let expr = clause.field.sql();
            let part = match &clause.condition {
                Condition::Eq(JsonValue::Null) => format!("{expr} IS NULL"),
                Condition::Eq(v) => {
                    params.push(json_to_sql(v));
                    format!("{expr} = ?")
                }
                Condition::Ne(v) => {
                    params.push(json_to_sql(v));
                    format!("{expr} IS NOT ?")
                }
                Condition::Gt(v) => binary(&expr, ">", v, &mut params),
                Condition::Gte(v) => binary(&expr, ">=", v, &mut params),
                Condition::Lt(v) => binary(&expr, "<", v, &mut params),
                Condition::Lte(v) => binary(&expr, "<=", v, &mut params),
                Condition::In(values) if values.is_empty() => "0".to_string(),
                Condition::In(values) => {
                    let marks = vec!["?"; values.len()].join(", ");
                    params.extend(values.iter().map(json_to_sql));
                    format!("{expr} IN ({marks})")
                }
                Condition::Like(pattern) => {
                    params.push(SqlValue::Text(pattern.clone()));
                    format!("{expr} LIKE ?")
                }
            };
            parts.push(part);
        }
        Some((parts.join(" AND "), params))
    }
}

fn binary(expr: &str, op: &str, v: &JsonValue, params: &mut Vec<SqlValue>) -> String {
    params.push(json_to_sql(v));
    format!("{expr} {op} ?")
}

fn is_operator_object(ops: &serde_json::Map<String, JsonValue>) -> bool {
    !ops.is_empty() && ops.keys().all(|k| k.starts_with('$'))
}

fn parse_operator(field: &str, op: &str, operand: &JsonValue) -> Result<Condition, QuireError> {
    let condition = match op {
        "$gt" => Condition::Gt(operand.clone()),
        "$gte" => Condition::Gte(operand.clone()),
        "$lt" => Condition::Lt(operand.clone()),
        "$lte" => Condition::Lte(operand.clone()),
        "$ne" => Condition::Ne(operand.clone()),
        "$in" => match operand {
            JsonValue::Array(values) => Condition::In(values.clone()),
            _ => {
                return Err(QuireError::ValidationError(format!(
                    "filter on '{field}': $in expects an array"
                )));
            }
        },
        "$like" => match operand {
            JsonValue::String(pattern) => Condition::Like(pattern.clone()),
            _ => {
                return Err(QuireError::ValidationError(format!(
                    "filter on '{field}': $like expects a string pattern"
                )));
            }
        },
        other => {
            return Err(QuireError::ValidationError(format!(
                "filter on '{field}': unsupported operator {other}"
            )));
        }
    };
    Ok(condition)
}

/// Map a JSON literal onto the SQL value `json_extract` would produce for it.
pub fn json_to_sql(value: &JsonValue) -> SqlValue {
    match value {
        JsonValue::Null => SqlValue::Null,
        JsonValue::Bool(b) => SqlValue::Integer(i64::from(*b)),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        JsonValue::String(s) => SqlValue::Text(s.clone()),
        JsonValue::Array(_) | JsonValue::Object(_) => SqlValue::Text(value.to_string()),
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrderBy {
    pub field: String,
    #[serde(default)]
    pub descending: bool,
}

impl OrderBy {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            descending: false,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            descending: true,
        }
    }

    /// `"-field"` sorts descending, `"field"` ascending.
    pub fn parse(spec: &str) -> Self {
        match spec.strip_prefix('-') {
            Some(field) => Self::desc(field),
            None => Self::asc(spec),
        }
    }

    pub fn sql(&self) -> Result<String, QuireError> {
        let field = FieldRef::parse(&self.field)?;
        let dir = if self.descending { "DESC" } else { "ASC" };
        Ok(format!("{} {dir}", field.sql()))
    }
}
