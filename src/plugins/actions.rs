//! Action generation, policy validation and execution.
//!
//! An action descriptor is a small structured request (`create`, `updateMany`,
//! `toggle`, ...) against one entity type. `generate` turns it into an
//! [`ActionPlan`] of statements, classified read or write; write plans always
//! require confirmation. `execute` runs a plan: reads return rows, writes run
//! in one store transaction and report the cumulative affected-row count.
//!
//! Raw SQL statements (from an external NL-to-SQL generator) pass the same
//! gate. Only plain reads and `records` writes are admissible.

use crate::core::error::QuireError;
use crate::core::filter::{Filter, OrderBy};
use crate::core::query::{FindOptions, SchemaSnapshot};
use crate::core::record::Record;
use crate::core::schemas;
use crate::core::store::{Store, StoreTx};
use crate::core::{descriptor, output};
use clap::{Parser, Subcommand};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue, json};
use std::sync::OnceLock;
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[clap(name = "action", about = "Plan and run structured actions")]
pub struct ActionCli {
    #[clap(subcommand)]
    pub command: ActionCommand,
}

#[derive(Subcommand, Debug)]
pub enum ActionCommand {
    /// Show the plan generated for a descriptor without running it.
    Plan {
        /// Descriptor JSON, or `@path` to read it from a file.
        descriptor: String,
    },
    /// Generate and run a plan. Write plans need `--yes`.
    Run {
        descriptor: String,
        #[clap(long)]
        yes: bool,
    },
}

pub fn run_action_cli(store: &Store, cli: ActionCli, format: &str) -> Result<(), QuireError> {
    match cli.command {
        ActionCommand::Plan { descriptor } => {
            let descriptor = parse_descriptor(&descriptor)?;
            let plan = generate(&descriptor, &store.schema_snapshot()?)?;
            validate_plan(&plan)?;
            output::emit(format, "action.plan", "ok", json!({ "plan": plan }), || {
                print_plan(&plan);
            })
        }
        ActionCommand::Run { descriptor, yes } => {
            let descriptor = parse_descriptor(&descriptor)?;
            let plan = generate(&descriptor, &store.schema_snapshot()?)?;
            if plan.requires_confirmation && !yes {
                return output::emit(
                    format,
                    "action.run",
                    "awaiting_confirmation",
                    json!({ "plan": plan }),
                    || {
                        print_plan(&plan);
                        println!(
                            "{} re-run with --yes to apply",
                            output::status_word("awaiting_confirmation")
                        );
                    },
                );
            }
            let result = execute(store, &plan)?;
            let status = if result.success { "ok" } else { "error" };
            output::emit(format, "action.run", status, json!({ "result": result }), || {
                println!("{} {}", output::status_word(status), result.message);
                if let Some(rows) = &result.rows {
                    for row in rows {
                        println!("  {}", output::compact_line(&row.to_string(), 120));
                    }
                }
                if let Some(error) = &result.error {
                    println!("  {error}");
                }
            })
        }
    }
}

fn parse_descriptor(input: &str) -> Result<ActionDescriptor, QuireError> {
    let text = match input.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)?,
        None => input.to_string(),
    };
    Ok(serde_json::from_str(&text)?)
}

fn print_plan(plan: &ActionPlan) {
    println!(
        "{} plan: {}",
        plan.kind.as_str(),
        output::compact_line(&plan.explanation, 120)
    );
    for statement in &plan.statements {
        println!("  - {}", statement.describe());
    }
    if let Some(n) = plan.estimated_records {
        println!("  estimated records: {n}");
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ActionKind {
    Create,
    CreateMany,
    Update,
    UpdateMany,
    Delete,
    DeleteMany,
    DeleteAll,
    Toggle,
    Find,
}

impl ActionKind {
    pub fn is_write(&self) -> bool {
        !matches!(self, ActionKind::Find)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActionDescriptor {
    pub action: ActionKind,
    pub entity_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Vec<JsonValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updates: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// `"-field"` sorts descending. Only meaningful for `find`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub order_by: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_confirmation: Option<bool>,
}

impl ActionDescriptor {
    pub fn new(action: ActionKind, entity_type: impl Into<String>) -> Self {
        Self {
            action,
            entity_type: entity_type.into(),
            data: None,
            items: None,
            filters: None,
            updates: None,
            field: None,
            order_by: Vec::new(),
            limit: None,
            requires_confirmation: None,
        }
    }

    pub fn with_data(mut self, data: JsonValue) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_items(mut self, items: Vec<JsonValue>) -> Self {
        self.items = Some(items);
        self
    }

    pub fn with_filters(mut self, filters: JsonValue) -> Self {
        self.filters = Some(filters);
        self
    }

    pub fn with_updates(mut self, updates: JsonValue) -> Self {
        self.updates = Some(updates);
        self
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    fn filters_or_all(&self) -> JsonValue {
        self.filters
            .clone()
            .unwrap_or_else(|| JsonValue::Object(Map::new()))
    }

    fn required_filters(&self) -> Result<JsonValue, QuireError> {
        let filters = self.filters_or_all();
        if Filter::parse(&filters)?.is_empty() {
            return Err(QuireError::ValidationError(format!(
                "{:?} on '{}' requires non-empty filters",
                self.action, self.entity_type
            )));
        }
        Ok(filters)
    }

    fn required_updates(&self) -> Result<JsonValue, QuireError> {
        match &self.updates {
            Some(updates) if updates.as_object().is_some_and(|o| !o.is_empty()) => {
                Ok(updates.clone())
            }
            _ => Err(QuireError::ValidationError(format!(
                "{:?} on '{}' requires a non-empty updates object",
                self.action, self.entity_type
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PlanKind {
    Read,
    Write,
}

impl PlanKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanKind::Read => "read",
            PlanKind::Write => "write",
        }
    }
}

/// One unit of work inside a plan. Structured variants target a single entity
/// type; `Raw` carries externally generated SQL.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Statement {
    Select {
        entity_type: String,
        #[serde(default)]
        filter: JsonValue,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        order_by: Vec<OrderBy>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<u64>,
    },
    Insert {
        entity_type: String,
        docs: Vec<JsonValue>,
    },
    Update {
        entity_type: String,
        #[serde(default)]
        filter: JsonValue,
        patch: JsonValue,
        #[serde(default)]
        many: bool,
    },
    Delete {
        entity_type: String,
        #[serde(default)]
        filter: JsonValue,
        #[serde(default)]
        many: bool,
        #[serde(default = "default_soft")]
        soft: bool,
    },
    Toggle {
        entity_type: String,
        #[serde(default)]
        filter: JsonValue,
        field: String,
        #[serde(default)]
        many: bool,
    },
    Raw {
        sql: String,
        #[serde(default)]
        params: Vec<JsonValue>,
    },
}

fn default_soft() -> bool {
    true
}

fn raw_verb_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^\s*(select|with|insert|update|delete)\b").expect("static regex")
    })
}

fn forbidden_keyword_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(create|drop|alter|truncate|attach|detach|pragma|vacuum|reindex)\b")
            .expect("static regex")
    })
}

fn protected_table_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        let names = schemas::PROTECTED_TABLES.join("|");
        Regex::new(&format!(r"(?i)\b({names})\b")).expect("static regex")
    })
}

fn raw_write_target_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(
            r"(?i)^\s*(insert\s+into|update|delete\s+from)\s+{}\b",
            schemas::RECORDS_TABLE
        ))
        .expect("static regex")
    })
}

impl Statement {
    pub fn is_write(&self) -> bool {
        match self {
            Statement::Select { .. } => false,
            Statement::Raw { sql, .. } => raw_verb_re()
                .captures(sql)
                .and_then(|c| c.get(1))
                .map(|verb| {
                    !matches!(verb.as_str().to_ascii_lowercase().as_str(), "select" | "with")
                })
                .unwrap_or(true),
            _ => true,
        }
    }

    pub fn entity_type(&self) -> Option<&str> {
        match self {
            Statement::Select { entity_type, .. }
            | Statement::Insert { entity_type, .. }
            | Statement::Update { entity_type, .. }
            | Statement::Delete { entity_type, .. }
            | Statement::Toggle { entity_type, .. } => Some(entity_type),
            Statement::Raw { .. } => None,
        }
    }

    /// One-line human rendering for plan previews.
    pub fn describe(&self) -> String {
        match self {
            Statement::Select { entity_type, filter, .. } => {
                format!("select {entity_type} where {}", render_filter(filter))
            }
            Statement::Insert { entity_type, docs } => {
                format!("insert {} {entity_type} record(s)", docs.len())
            }
            Statement::Update { entity_type, filter, patch, many } => format!(
                "update {} {entity_type} where {} set {patch}",
                if *many { "all" } else { "first" },
                render_filter(filter)
            ),
            Statement::Delete { entity_type, filter, many, soft } => format!(
                "{} {} {entity_type} where {}",
                if *soft { "soft-delete" } else { "delete" },
                if *many { "all" } else { "first" },
                render_filter(filter)
            ),
            Statement::Toggle { entity_type, filter, field, many } => format!(
                "toggle {field} on {} {entity_type} where {}",
                if *many { "all" } else { "first" },
                render_filter(filter)
            ),
            Statement::Raw { sql, .. } => format!("raw: {}", output::compact_line(sql, 80)),
        }
    }
}

fn render_filter(filter: &JsonValue) -> String {
    match filter.as_object() {
        Some(obj) if !obj.is_empty() => filter.to_string(),
        _ => "*".to_string(),
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActionPlan {
    pub kind: PlanKind,
    pub statements: Vec<Statement>,
    pub explanation: String,
    pub affected_types: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_records: Option<u64>,
    pub requires_confirmation: bool,
}

impl ActionPlan {
    /// Build a plan from loose statements, classifying it by its contents.
    pub fn from_statements(statements: Vec<Statement>, explanation: impl Into<String>) -> Self {
        let kind = if statements.iter().any(Statement::is_write) {
            PlanKind::Write
        } else {
            PlanKind::Read
        };
        let mut affected_types: Vec<String> = Vec::new();
        for entity_type in statements.iter().filter_map(Statement::entity_type) {
            if !affected_types.iter().any(|t| t == entity_type) {
                affected_types.push(entity_type.to_string());
            }
        }
        Self {
            kind,
            statements,
            explanation: explanation.into(),
            affected_types,
            estimated_records: None,
            requires_confirmation: kind == PlanKind::Write,
        }
    }

    pub fn is_write(&self) -> bool {
        self.kind == PlanKind::Write || self.statements.iter().any(Statement::is_write)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<Vec<JsonValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionResult {
    /// Turn a captured failure into a `TransactionFailure` error.
    pub fn into_result(self) -> Result<Self, QuireError> {
        if self.success {
            Ok(self)
        } else {
            Err(QuireError::TransactionFailure(
                self.error.unwrap_or_else(|| self.message.clone()),
            ))
        }
    }
}

/// Translate a descriptor into a plan. The snapshot supplies record counts
/// for estimates on type-wide writes.
pub fn generate(
    descriptor: &ActionDescriptor,
    snapshot: &SchemaSnapshot,
) -> Result<ActionPlan, QuireError> {
    descriptor::check_entity_type(&descriptor.entity_type)?;
    let entity_type = descriptor.entity_type.clone();
    let active = snapshot.active_count(&entity_type);

    let (statement, explanation, estimated) = match descriptor.action {
        ActionKind::Create => {
            let data = descriptor.data.clone().ok_or_else(|| {
                QuireError::ValidationError(format!("create on '{entity_type}' requires data"))
            })?;
            descriptor::require_object(&data)?;
            (
                Statement::Insert {
                    entity_type: entity_type.clone(),
                    docs: vec![data],
                },
                format!("Create one {entity_type} record."),
                Some(1),
            )
        }
        ActionKind::CreateMany => {
            let items = descriptor.items.clone().unwrap_or_default();
            if items.is_empty() {
                return Err(QuireError::ValidationError(format!(
                    "createMany on '{entity_type}' requires at least one item"
                )));
            }
            for item in &items {
                descriptor::require_object(item)?;
            }
            let n = items.len() as u64;
            (
                Statement::Insert {
                    entity_type: entity_type.clone(),
                    docs: items,
                },
                format!("Create {n} {entity_type} records in one transaction."),
                Some(n),
            )
        }
        ActionKind::Update => {
            let filter = descriptor.required_filters()?;
            let patch = descriptor.required_updates()?;
            (
                Statement::Update {
                    entity_type: entity_type.clone(),
                    filter,
                    patch,
                    many: false,
                },
                format!("Update the first matching {entity_type} record."),
                Some(1),
            )
        }
        ActionKind::UpdateMany => {
            let filter = descriptor.filters_or_all();
            let patch = descriptor.required_updates()?;
            let estimated = Filter::parse(&filter)?.is_empty().then_some(active);
            (
                Statement::Update {
                    entity_type: entity_type.clone(),
                    filter,
                    patch,
                    many: true,
                },
                format!("Update every matching {entity_type} record."),
                estimated,
            )
        }
        ActionKind::Delete => (
            Statement::Delete {
                entity_type: entity_type.clone(),
                filter: descriptor.required_filters()?,
                many: false,
                soft: true,
            },
            format!("Delete the first matching {entity_type} record."),
            Some(1),
        ),
        ActionKind::DeleteMany => (
            Statement::Delete {
                entity_type: entity_type.clone(),
                filter: descriptor.required_filters()?,
                many: true,
                soft: true,
            },
            format!("Delete every matching {entity_type} record."),
            None,
        ),
        ActionKind::DeleteAll => (
            Statement::Delete {
                entity_type: entity_type.clone(),
                filter: JsonValue::Object(Map::new()),
                many: true,
                soft: true,
            },
            format!("Delete all {active} active {entity_type} records."),
            Some(active),
        ),
        ActionKind::Toggle => {
            let field = descriptor.field.clone().ok_or_else(|| {
                QuireError::ValidationError(format!("toggle on '{entity_type}' requires a field"))
            })?;
            crate::core::filter::check_field_name(&field)?;
            (
                Statement::Toggle {
                    entity_type: entity_type.clone(),
                    filter: descriptor.required_filters()?,
                    field: field.clone(),
                    many: false,
                },
                format!("Flip '{field}' on the first matching {entity_type} record."),
                Some(1),
            )
        }
        ActionKind::Find => {
            let filter = descriptor.filters_or_all();
            Filter::parse(&filter)?;
            (
                Statement::Select {
                    entity_type: entity_type.clone(),
                    filter,
                    order_by: descriptor.order_by.iter().map(|s| OrderBy::parse(s)).collect(),
                    limit: descriptor.limit,
                },
                format!("List matching {entity_type} records."),
                None,
            )
        }
    };

    let kind = if descriptor.action.is_write() {
        PlanKind::Write
    } else {
        PlanKind::Read
    };
    let requires_confirmation = match kind {
        PlanKind::Write => true,
        PlanKind::Read => descriptor.requires_confirmation.unwrap_or(false),
    };
    debug!(action = ?descriptor.action, entity_type = %entity_type, "action plan generated");
    Ok(ActionPlan {
        kind,
        statements: vec![statement],
        explanation,
        affected_types: vec![entity_type],
        estimated_records: estimated,
        requires_confirmation,
    })
}

/// Reject statements that could change structure or reach system tables.
pub fn validate(statement: &Statement) -> Result<(), QuireError> {
    match statement {
        Statement::Raw { sql, .. } => validate_raw(sql),
        Statement::Select { entity_type, filter, order_by, .. } => {
            descriptor::check_entity_type(entity_type).map_err(to_policy)?;
            Filter::parse(filter).map_err(to_policy)?;
            for order in order_by {
                order.sql().map_err(to_policy)?;
            }
            Ok(())
        }
        Statement::Insert { entity_type, .. } => {
            descriptor::check_entity_type(entity_type).map_err(to_policy)
        }
        Statement::Update { entity_type, filter, .. }
        | Statement::Delete { entity_type, filter, .. } => {
            descriptor::check_entity_type(entity_type).map_err(to_policy)?;
            Filter::parse(filter).map_err(to_policy)?;
            Ok(())
        }
        Statement::Toggle { entity_type, filter, field, .. } => {
            descriptor::check_entity_type(entity_type).map_err(to_policy)?;
            Filter::parse(filter).map_err(to_policy)?;
            crate::core::filter::check_field_name(field).map_err(to_policy)
        }
    }
}

fn to_policy(e: QuireError) -> QuireError {
    match e {
        QuireError::ValidationError(msg) => QuireError::PolicyViolation(msg),
        other => other,
    }
}

fn validate_raw(sql: &str) -> Result<(), QuireError> {
    let body = sql.trim().trim_end_matches(';').trim_end();
    if body.is_empty() {
        return Err(QuireError::PolicyViolation("empty statement".to_string()));
    }
    if body.contains(';') {
        return Err(QuireError::PolicyViolation(
            "multiple statements are not allowed".to_string(),
        ));
    }
    if let Some(m) = forbidden_keyword_re().find(body) {
        return Err(QuireError::PolicyViolation(format!(
            "structural keyword '{}' is not allowed",
            m.as_str().to_ascii_uppercase()
        )));
    }
    if let Some(m) = protected_table_re().find(body) {
        return Err(QuireError::PolicyViolation(format!(
            "statement references protected table '{}'",
            m.as_str()
        )));
    }
    if !raw_verb_re().is_match(body) {
        return Err(QuireError::PolicyViolation(
            "only SELECT/WITH reads and INSERT/UPDATE/DELETE writes are allowed".to_string(),
        ));
    }
    let statement = Statement::Raw {
        sql: body.to_string(),
        params: Vec::new(),
    };
    if statement.is_write() && !raw_write_target_re().is_match(body) {
        return Err(QuireError::PolicyViolation(format!(
            "raw writes may only target the {} table",
            schemas::RECORDS_TABLE
        )));
    }
    Ok(())
}

/// Validate every statement and the plan's read/write classification.
pub fn validate_plan(plan: &ActionPlan) -> Result<(), QuireError> {
    for statement in &plan.statements {
        validate(statement)?;
    }
    if plan.kind == PlanKind::Read && plan.statements.iter().any(Statement::is_write) {
        return Err(QuireError::PolicyViolation(
            "read plan contains a write statement".to_string(),
        ));
    }
    Ok(())
}

/// Run a plan. Only policy violations come back as `Err`; execution failures
/// are captured in the result (and the write transaction rolled back).
pub fn execute(store: &Store, plan: &ActionPlan) -> Result<ExecutionResult, QuireError> {
    validate_plan(plan)?;
    if plan.is_write() {
        execute_write(store, plan)
    } else {
        execute_read(store, plan)
    }
}

fn execute_read(store: &Store, plan: &ActionPlan) -> Result<ExecutionResult, QuireError> {
    let mut rows = Vec::new();
    for statement in &plan.statements {
        match read_statement(store, statement) {
            Ok(mut batch) => rows.append(&mut batch),
            Err(e @ QuireError::PolicyViolation(_)) => return Err(e),
            Err(e) => return Ok(failure(&e)),
        }
    }
    let message = format!("Found {} record(s).", rows.len());
    Ok(ExecutionResult {
        success: true,
        rows: Some(rows),
        rows_affected: None,
        message,
        error: None,
    })
}

fn read_statement(store: &Store, statement: &Statement) -> Result<Vec<JsonValue>, QuireError> {
    match statement {
        Statement::Select { entity_type, filter, order_by, limit } => {
            let opts = FindOptions {
                order_by: order_by.clone(),
                limit: *limit,
                ..FindOptions::default()
            };
            store
                .find(entity_type, filter, &opts)?
                .into_iter()
                .map(|record| serde_json::to_value(record).map_err(QuireError::from))
                .collect()
        }
        Statement::Raw { sql, params } => store.query_raw(sql, params),
        other => Err(QuireError::PolicyViolation(format!(
            "write statement in read path: {}",
            other.describe()
        ))),
    }
}

fn execute_write(store: &Store, plan: &ActionPlan) -> Result<ExecutionResult, QuireError> {
    let outcome = store.transaction("action.execute", |tx| {
        let mut affected = 0u64;
        for statement in &plan.statements {
            affected += write_statement(tx, statement)? as u64;
        }
        Ok(affected)
    });
    match outcome {
        Ok(affected) => {
            info!(affected, types = ?plan.affected_types, "write plan applied");
            Ok(ExecutionResult {
                success: true,
                rows: None,
                rows_affected: Some(affected),
                message: format!("{affected} record(s) affected."),
                error: None,
            })
        }
        Err(e @ QuireError::PolicyViolation(_)) => Err(e),
        Err(e) => Ok(failure(&e)),
    }
}

fn failure(e: &QuireError) -> ExecutionResult {
    ExecutionResult {
        success: false,
        rows: None,
        rows_affected: None,
        message: "Execution failed; no changes were applied.".to_string(),
        error: Some(e.to_string()),
    }
}

fn targets(
    tx: &StoreTx<'_>,
    entity_type: &str,
    filter: &JsonValue,
    many: bool,
) -> Result<Vec<Record>, QuireError> {
    let mut matches = tx.find(entity_type, &Filter::parse(filter)?)?;
    if !many {
        matches.truncate(1);
    }
    Ok(matches)
}

fn write_statement(tx: &StoreTx<'_>, statement: &Statement) -> Result<usize, QuireError> {
    match statement {
        Statement::Insert { entity_type, docs } => {
            Ok(tx.create_many(entity_type, docs.clone())?.len())
        }
        Statement::Update { entity_type, filter, patch, many: true } => {
            tx.update_many(entity_type, &Filter::parse(filter)?, patch.clone())
        }
        Statement::Update { entity_type, filter, patch, many: false } => {
            let mut n = 0;
            for record in targets(tx, entity_type, filter, false)? {
                if tx.update(&record.id, patch.clone())?.is_some() {
                    n += 1;
                }
            }
            Ok(n)
        }
        Statement::Delete { entity_type, filter, many: true, soft } => {
            tx.delete_many(entity_type, &Filter::parse(filter)?, *soft)
        }
        Statement::Delete { entity_type, filter, many: false, soft } => {
            let mut n = 0;
            for record in targets(tx, entity_type, filter, false)? {
                if tx.delete(&record.id, *soft)? {
                    n += 1;
                }
            }
            Ok(n)
        }
        Statement::Toggle { entity_type, filter, field, many } => {
            let mut n = 0;
            for record in targets(tx, entity_type, filter, *many)? {
                let current = record.field(field).and_then(JsonValue::as_bool).unwrap_or(false);
                let mut patch = Map::new();
                patch.insert(field.clone(), JsonValue::Bool(!current));
                if tx.update(&record.id, JsonValue::Object(patch))?.is_some() {
                    n += 1;
                }
            }
            Ok(n)
        }
        // Reads inside a write plan preview nothing and change nothing.
        Statement::Raw { .. } if !statement.is_write() => Ok(0),
        Statement::Raw { sql, params } => tx.execute_raw(sql, params),
        Statement::Select { .. } => Ok(0),
    }
}
