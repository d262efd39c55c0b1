//! CLI struct definitions for the quire command-line interface.
//!
//! All clap-derived types for the top level live here. Subsystem commands
//! (`action`, `workflow`) are defined next to their plugins.

use crate::plugins::{actions, workflow};

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(
    name = "quire",
    version = env!("CARGO_PKG_VERSION"),
    about = "Schema-flexible document store with confirmation-gated workflows"
)]
pub(crate) struct Cli {
    /// Config file (defaults to ./quire.toml when present).
    #[clap(long, global = true)]
    pub config: Option<PathBuf>,
    /// Database path or `:memory:`; overrides the config file and QUIRE_DB.
    #[clap(long, global = true)]
    pub db: Option<String>,
    /// Output format: 'text' or 'json'.
    #[clap(long, global = true, default_value = "text")]
    pub format: String,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Register or list schema descriptors.
    #[clap(name = "schema", visible_alias = "s")]
    Schema(SchemaCli),
    /// Create a record. DATA is JSON or `@path`.
    #[clap(name = "put")]
    Put {
        entity_type: String,
        data: String,
        #[clap(long)]
        metadata: Option<String>,
    },
    /// Fetch one active record by id.
    #[clap(name = "get")]
    Get { id: String },
    /// Query active records of a type.
    #[clap(name = "find", visible_alias = "f")]
    Find {
        entity_type: String,
        /// Filter object, e.g. '{"completed":{"$ne":true}}'.
        #[clap(long, default_value = "{}")]
        filter: String,
        /// Sort field; prefix with '-' for descending. Repeatable.
        #[clap(long)]
        order: Vec<String>,
        #[clap(long)]
        limit: Option<u64>,
        #[clap(long)]
        offset: Option<u64>,
        /// Include tombstoned records.
        #[clap(long)]
        include_deleted: bool,
        #[clap(long)]
        no_cache: bool,
    },
    /// Count active records of a type.
    #[clap(name = "count")]
    Count {
        entity_type: String,
        #[clap(long, default_value = "{}")]
        filter: String,
        #[clap(long)]
        include_deleted: bool,
    },
    /// Shallow-merge PARTIAL into a record.
    #[clap(name = "update")]
    Update { id: String, partial: String },
    /// Replace a record's whole document.
    #[clap(name = "replace")]
    Replace { id: String, data: String },
    /// Soft-delete a record (or remove it with --hard).
    #[clap(name = "delete")]
    Delete {
        id: String,
        #[clap(long)]
        hard: bool,
    },
    /// Clear a record's tombstone.
    #[clap(name = "restore")]
    Restore { id: String },
    /// Substring scan over documents of a type.
    #[clap(name = "search")]
    Search {
        entity_type: String,
        needle: String,
        #[clap(long)]
        limit: Option<u64>,
    },
    /// sum | avg | min | max | count over a field.
    #[clap(name = "aggregate")]
    Aggregate {
        entity_type: String,
        field: String,
        op: String,
        #[clap(long, default_value = "{}")]
        filter: String,
    },
    /// List the index catalog.
    #[clap(name = "indexes")]
    Indexes,
    /// Plan and run structured actions.
    #[clap(name = "action", visible_alias = "a")]
    Action(actions::ActionCli),
    /// Start and steer multi-step workflows.
    #[clap(name = "workflow", visible_alias = "w")]
    Workflow(workflow::WorkflowCli),
}

#[derive(clap::Args, Debug)]
pub(crate) struct SchemaCli {
    #[clap(subcommand)]
    pub command: SchemaCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum SchemaCommand {
    /// Register a descriptor from JSON or `@path`.
    Register { descriptor: String },
    /// Show registered descriptors with active record counts.
    List,
}
