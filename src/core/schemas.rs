//! Centralized table definitions for the document store.
//!
//! Every document lives in one `records` table regardless of type. Indexes over
//! document fields are created on demand (schema registration or adaptive
//! indexing) and recorded in `index_catalog` so they survive restarts without
//! being re-issued.

pub const RECORDS_TABLE: &str = "records";
pub const INDEX_CATALOG_TABLE: &str = "index_catalog";

/// Type tag of the stored workflow records.
pub const WORKFLOW_ENTITY_TYPE: &str = "workflow/chat";
/// Type tag of generated components persisted by `create`/`improve` steps.
pub const COMPONENT_ENTITY_TYPE: &str = "component";

pub const RECORDS_DB_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS records (
        id TEXT PRIMARY KEY,
        entity_type TEXT NOT NULL,
        data TEXT NOT NULL,
        metadata TEXT NOT NULL DEFAULT '{}',
        version INTEGER NOT NULL DEFAULT 1,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        deleted_at INTEGER
    )
";

pub const RECORDS_DB_INDEX_TYPE: &str =
    "CREATE INDEX IF NOT EXISTS idx_records_type_active ON records(entity_type, deleted_at)";

pub const RECORDS_DB_INDEX_CREATED: &str =
    "CREATE INDEX IF NOT EXISTS idx_records_type_created ON records(entity_type, created_at)";

pub const INDEX_CATALOG_DB_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS index_catalog (
        entity_type TEXT NOT NULL,
        field_name TEXT NOT NULL,
        index_name TEXT NOT NULL UNIQUE,
        origin TEXT NOT NULL DEFAULT 'adaptive',
        created_at INTEGER NOT NULL
    )
";

/// All bootstrap statements in execution order.
pub const BOOTSTRAP: &[&str] = &[
    RECORDS_DB_SCHEMA,
    RECORDS_DB_INDEX_TYPE,
    RECORDS_DB_INDEX_CREATED,
    INDEX_CATALOG_DB_SCHEMA,
];

/// Tables raw statements may never reference, read or write.
pub const PROTECTED_TABLES: &[&str] = &[
    INDEX_CATALOG_TABLE,
    "sqlite_master",
    "sqlite_schema",
    "sqlite_sequence",
    "sqlite_temp_master",
];
