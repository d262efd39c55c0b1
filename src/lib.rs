//! Quire: a schema-flexible document store with confirmation-gated workflows.
//!
//! Callers store arbitrarily shaped, typed JSON documents without a fixed
//! schema, query them with a small filter DSL, and run multi-step operations
//! that pause for explicit approval before any write is applied.
//!
//! # Architecture
//!
//! ## The Thin Waist
//!
//! All state access routes through one `Store` handle, constructed once and
//! shared as `Arc<Store>`. Underneath it the `DbBroker` owns the single SQLite
//! connection and provides:
//! - Serialization (in-process lock)
//! - Transactions with rollback on error
//! - Audit logging (`broker.events.jsonl`)
//!
//! ## Storage
//!
//! Every document lives in one `records` table with a type tag, a version
//! that increases by one per mutation, and a soft-delete tombstone. Types may
//! register a `SchemaDescriptor` (validation, transforms, indexed and unique
//! fields); unregistered types are stored as-is. Reads are cached per type and
//! frequently filtered fields get partial expression indexes automatically.
//!
//! ## Subsystems (Plugins)
//!
//! - `actions`: structured action descriptors to read/write plans, policy gate
//! - `workflow`: multi-step plans that suspend on writes until approved
//! - `notify`: best-effort change notifications
//! - `codegen`: contract of the external component generator
//!
//! # Examples
//!
//! ```bash
//! quire put todo '{"text": "buy milk"}'
//! quire find todo --filter '{"completed": {"$ne": true}}'
//! quire action run '{"action": "deleteAll", "entityType": "note"}' --yes
//! quire workflow start "tidy up" --plan plan.json
//! quire workflow approve <id>
//! ```
//!
//! # Crate Structure
//!
//! - [`core`]: storage primitives (broker, store, query, cache, indexer, filter)
//! - [`plugins`]: subsystems built on the store

mod cli;
pub mod core;
pub mod plugins;

use crate::cli::{Cli, Command, SchemaCommand};
use crate::core::config::{CONFIG_FILE_NAME, EngineConfig};
use crate::core::descriptor::SchemaDescriptor;
use crate::core::error::QuireError;
use crate::core::filter::OrderBy;
use crate::core::query::{AggregateOp, FindOptions};
use crate::core::record::Record;
use crate::core::store::Store;
use crate::core::{db, output};
use crate::plugins::codegen::UnconfiguredGenerator;
use crate::plugins::workflow::WorkflowEngine;
use crate::plugins::{actions, workflow};

use clap::Parser;
use serde_json::{Value as JsonValue, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Database used by the CLI when neither config, env nor `--db` name one.
pub const DEFAULT_CLI_DATABASE: &str = ".quire/quire.db";
const DEFAULT_CLI_AUDIT_DIR: &str = ".quire";

/// Parse a JSON argument, reading it from a file when prefixed with `@`.
fn json_arg(input: &str) -> Result<JsonValue, QuireError> {
    let text = match input.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)?,
        None => input.to_string(),
    };
    serde_json::from_str(&text).map_err(|e| {
        QuireError::ValidationError(format!("invalid JSON argument: {e}"))
    })
}

fn cli_config(cli: &Cli, config_path: &Path) -> Result<EngineConfig, QuireError> {
    let mut config = EngineConfig::load(config_path)?;
    if let Some(db_path) = &cli.db {
        config.database = db_path.clone();
    } else if config.database == db::MEMORY_DB && std::env::var("QUIRE_DB").is_err() {
        config.database = DEFAULT_CLI_DATABASE.to_string();
    }
    if config.audit_dir.is_none() && config.database != db::MEMORY_DB {
        config.audit_dir = Some(PathBuf::from(DEFAULT_CLI_AUDIT_DIR));
    }
    Ok(config)
}

fn emit_records(format: &str, cmd: &str, records: &[Record]) -> Result<(), QuireError> {
    output::emit(
        format,
        cmd,
        "ok",
        json!({ "count": records.len(), "records": records }),
        || {
            for record in records {
                println!("{}", output::record_line(record));
            }
            println!("{} record(s)", records.len());
        },
    )
}

fn emit_record(format: &str, cmd: &str, record: Option<&Record>) -> Result<(), QuireError> {
    let status = if record.is_some() { "ok" } else { "not_found" };
    output::emit(format, cmd, status, json!({ "record": record }), || match record {
        Some(record) => println!("{}", output::record_line(record)),
        None => println!("{}", output::status_word(status)),
    })
}

fn emit_flag(format: &str, cmd: &str, id: &str, done: bool) -> Result<(), QuireError> {
    let status = if done { "ok" } else { "not_found" };
    output::emit(format, cmd, status, json!({ "id": id, "applied": done }), || {
        println!("{} {id}", output::status_word(status));
    })
}

pub async fn run() -> Result<(), QuireError> {
    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));
    let config = cli_config(&cli, &config_path)?;
    let store = Arc::new(Store::open(&config)?);
    let format = cli.format.as_str();

    match cli.command {
        Command::Schema(schema_cli) => match schema_cli.command {
            SchemaCommand::Register { descriptor } => {
                let schema: SchemaDescriptor = serde_json::from_value(json_arg(&descriptor)?)?;
                store.register_schema(schema.clone())?;
                // Persist so later invocations enforce it too.
                let mut file_config = EngineConfig::load_file(&config_path)?;
                file_config.upsert_schema(schema.clone());
                file_config.save(&config_path)?;
                output::emit(format, "schema.register", "ok", json!({ "schema": schema }), || {
                    println!(
                        "{} {} -> {}",
                        output::status_word("ok"),
                        schema.entity_type,
                        config_path.display()
                    );
                })
            }
            SchemaCommand::List => {
                let snapshot = store.schema_snapshot()?;
                output::emit(format, "schema.list", "ok", json!({ "snapshot": snapshot }), || {
                    for (entity_type, info) in &snapshot.types {
                        let fields = info
                            .schema
                            .as_ref()
                            .map(|s| s.fields.keys().cloned().collect::<Vec<_>>().join(", "))
                            .unwrap_or_else(|| "(unregistered)".to_string());
                        println!("{entity_type} [{}] {fields}", info.active_count);
                    }
                })
            }
        },
        Command::Put {
            entity_type,
            data,
            metadata,
        } => {
            let metadata = metadata.as_deref().map(json_arg).transpose()?;
            let record = store.create(&entity_type, json_arg(&data)?, metadata)?;
            emit_record(format, "put", Some(&record))
        }
        Command::Get { id } => emit_record(format, "get", store.find_by_id(&id)?.as_ref()),
        Command::Find {
            entity_type,
            filter,
            order,
            limit,
            offset,
            include_deleted,
            no_cache,
        } => {
            let opts = FindOptions {
                order_by: order.iter().map(|o| OrderBy::parse(o)).collect(),
                limit,
                offset,
                use_cache: !no_cache,
                include_deleted,
            };
            let records = store.find(&entity_type, &json_arg(&filter)?, &opts)?;
            emit_records(format, "find", &records)
        }
        Command::Count {
            entity_type,
            filter,
            include_deleted,
        } => {
            let opts = FindOptions {
                include_deleted,
                ..FindOptions::default()
            };
            let n = store.count(&entity_type, &json_arg(&filter)?, &opts)?;
            output::emit(format, "count", "ok", json!({ "count": n }), || println!("{n}"))
        }
        Command::Update { id, partial } => {
            let record = store.update(&id, json_arg(&partial)?)?;
            emit_record(format, "update", record.as_ref())
        }
        Command::Replace { id, data } => {
            let record = store.replace(&id, json_arg(&data)?)?;
            emit_record(format, "replace", record.as_ref())
        }
        Command::Delete { id, hard } => {
            let done = store.delete(&id, !hard)?;
            emit_flag(format, "delete", &id, done)
        }
        Command::Restore { id } => {
            let done = store.restore(&id)?;
            emit_flag(format, "restore", &id, done)
        }
        Command::Search {
            entity_type,
            needle,
            limit,
        } => {
            let opts = FindOptions {
                limit,
                ..FindOptions::default()
            };
            let records = store.search(&entity_type, &needle, &opts)?;
            emit_records(format, "search", &records)
        }
        Command::Aggregate {
            entity_type,
            field,
            op,
            filter,
        } => {
            let op: AggregateOp = op.parse()?;
            let value = store.aggregate_where(&entity_type, &field, op, &json_arg(&filter)?)?;
            output::emit(
                format,
                "aggregate",
                "ok",
                json!({ "op": op, "field": field, "value": value }),
                || println!("{value}"),
            )
        }
        Command::Indexes => {
            let catalog = store.index_catalog()?;
            output::emit(format, "indexes", "ok", json!({ "indexes": catalog }), || {
                for entry in &catalog {
                    println!(
                        "{} {}.{} ({})",
                        entry.index_name, entry.entity_type, entry.field_name, entry.origin
                    );
                }
            })
        }
        Command::Action(action_cli) => actions::run_action_cli(&store, action_cli, format),
        Command::Workflow(workflow_cli) => {
            let engine = WorkflowEngine::new(Arc::clone(&store), Arc::new(UnconfiguredGenerator))?;
            workflow::run_workflow_cli(&engine, workflow_cli, format).await
        }
    }
}
