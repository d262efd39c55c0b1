//! The storage engine handle.
//!
//! A `Store` is constructed once per process and shared (`Arc<Store>`) with
//! every component that needs persistence. It owns the broker connection, the
//! schema registry, the read cache and the adaptive indexer.
//!
//! Every mutation runs inside a broker transaction through a [`StoreTx`], so
//! single-record and multi-record writes share one code path and multi-record
//! writes are all-or-nothing. Cache namespaces of every type touched by a
//! transaction are dropped after it commits.

use crate::core::broker::DbBroker;
use crate::core::cache::QueryCache;
use crate::core::config::EngineConfig;
use crate::core::descriptor::{self, PrepareMode, SchemaDescriptor};
use crate::core::error::QuireError;
use crate::core::filter::{self, Filter};
use crate::core::indexer::{self, AdaptiveIndexer, IndexOrigin};
use crate::core::record::{RECORD_COLUMNS, Record, RecordRow};
use crate::core::time;
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use rustc_hash::FxHashMap;
use serde_json::{Map, Value as JsonValue};
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::sync::RwLock;
use tracing::{debug, info};

/// Actor name recorded in the broker audit log for engine mutations.
pub const ENGINE_ACTOR: &str = "quire";

/// Cache namespace for id lookups, whose type is unknown until read.
pub(crate) const BY_ID_NAMESPACE: &str = "#by-id";

pub struct Store {
    pub(crate) broker: DbBroker,
    pub(crate) schemas: RwLock<FxHashMap<String, SchemaDescriptor>>,
    pub(crate) cache: QueryCache,
    pub(crate) indexer: AdaptiveIndexer,
}

impl Store {
    pub fn open(config: &EngineConfig) -> Result<Self, QuireError> {
        let broker = DbBroker::open(&config.database, config.audit_dir.as_deref())?;
        let store = Self {
            broker,
            schemas: RwLock::new(FxHashMap::default()),
            cache: QueryCache::new(config.cache_ttl(), config.cache.enabled),
            indexer: AdaptiveIndexer::new(config.indexing.threshold, config.indexing.enabled),
        };
        for schema in &config.schemas {
            store.register_schema(schema.clone())?;
        }
        info!(database = %config.database, schemas = config.schemas.len(), "store opened");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, QuireError> {
        Self::open(&EngineConfig::default())
    }

    /// Register (or re-register) the contract for one type. Indexes are created
    /// for indexed and unique fields; existing rows are not re-validated.
    pub fn register_schema(&self, schema: SchemaDescriptor) -> Result<(), QuireError> {
        schema.check()?;
        let created = self
            .broker
            .with_tx(ENGINE_ACTOR, "schema.register", |conn| {
                let mut created = Vec::new();
                for field in schema.indexed_fields() {
                    if let Some(name) =
                        indexer::ensure_index(conn, &schema.entity_type, field, IndexOrigin::Schema)?
                    {
                        created.push(name);
                    }
                }
                Ok(created)
            })?;
        debug!(entity_type = %schema.entity_type, indexes = ?created, "schema registered");
        let mut schemas = self.schemas.write().map_err(|_| {
            QuireError::TransactionFailure("schema registry lock poisoned".to_string())
        })?;
        schemas.insert(schema.entity_type.clone(), schema);
        Ok(())
    }

    /// Registered contract for `entity_type`; `None` means permissive.
    pub fn schema_for(&self, entity_type: &str) -> Option<SchemaDescriptor> {
        self.schemas
            .read()
            .ok()
            .and_then(|schemas| schemas.get(entity_type).cloned())
    }

    pub fn registered_schemas(&self) -> Vec<SchemaDescriptor> {
        let mut out: Vec<SchemaDescriptor> = self
            .schemas
            .read()
            .map(|schemas| schemas.values().cloned().collect())
            .unwrap_or_default();
        out.sort_by(|a, b| a.entity_type.cmp(&b.entity_type));
        out
    }

    /// Run `f` as one atomic unit. Either every mutation made through the
    /// handle commits, or none does.
    pub fn transaction<F, R>(&self, op_name: &str, f: F) -> Result<R, QuireError>
    where
        F: FnOnce(&StoreTx<'_>) -> Result<R, QuireError>,
    {
        let touched = RefCell::new(Touched::default());
        let result = self.broker.with_tx(ENGINE_ACTOR, op_name, |conn| {
            let tx = StoreTx {
                conn,
                store: self,
                touched: &touched,
            };
            f(&tx)
        });
        if result.is_ok() {
            self.invalidate(&touched.into_inner());
        }
        result
    }

    fn invalidate(&self, touched: &Touched) {
        if touched.all {
            self.cache.clear();
            return;
        }
        if touched.types.is_empty() {
            return;
        }
        self.cache.invalidate_type(BY_ID_NAMESPACE);
        for entity_type in &touched.types {
            let dropped = self.cache.invalidate_type(entity_type);
            debug!(entity_type = %entity_type, dropped, "cache invalidated");
        }
    }

    pub fn create(
        &self,
        entity_type: &str,
        data: JsonValue,
        metadata: Option<JsonValue>,
    ) -> Result<Record, QuireError> {
        self.transaction("create", |tx| tx.create(entity_type, data, metadata))
    }

    pub fn create_many(
        &self,
        entity_type: &str,
        docs: Vec<JsonValue>,
    ) -> Result<Vec<Record>, QuireError> {
        self.transaction("create_many", |tx| tx.create_many(entity_type, docs))
    }

    pub fn update(&self, id: &str, partial: JsonValue) -> Result<Option<Record>, QuireError> {
        self.transaction("update", |tx| tx.update(id, partial))
    }

    /// Compare-and-set update: applies only while the stored version still
    /// equals `expected_version`.
    pub fn update_if_version(
        &self,
        id: &str,
        expected_version: i64,
        partial: JsonValue,
    ) -> Result<Option<Record>, QuireError> {
        self.transaction("update_if_version", |tx| {
            tx.update_if_version(id, expected_version, partial)
        })
    }

    pub fn update_many(
        &self,
        entity_type: &str,
        filter: &JsonValue,
        partial: JsonValue,
    ) -> Result<usize, QuireError> {
        let filter = Filter::parse(filter)?;
        self.transaction("update_many", |tx| tx.update_many(entity_type, &filter, partial))
    }

    pub fn replace(&self, id: &str, doc: JsonValue) -> Result<Option<Record>, QuireError> {
        self.transaction("replace", |tx| tx.replace(id, doc))
    }

    pub fn delete(&self, id: &str, soft: bool) -> Result<bool, QuireError> {
        self.transaction("delete", |tx| tx.delete(id, soft))
    }

    pub fn delete_many(
        &self,
        entity_type: &str,
        filter: &JsonValue,
        soft: bool,
    ) -> Result<usize, QuireError> {
        let filter = Filter::parse(filter)?;
        self.transaction("delete_many", |tx| tx.delete_many(entity_type, &filter, soft))
    }

    pub fn restore(&self, id: &str) -> Result<bool, QuireError> {
        self.transaction("restore", |tx| tx.restore(id))
    }
}

#[derive(Default)]
struct Touched {
    types: BTreeSet<String>,
    all: bool,
}

/// Mutation handle bound to one open transaction.
pub struct StoreTx<'a> {
    conn: &'a Connection,
    store: &'a Store,
    touched: &'a RefCell<Touched>,
}

impl<'a> StoreTx<'a> {
    fn touch(&self, entity_type: &str) {
        self.touched.borrow_mut().types.insert(entity_type.to_string());
    }

    /// Raw writes have unknown scope, so every namespace goes stale.
    fn touch_all(&self) {
        self.touched.borrow_mut().all = true;
    }

    /// Execute an already-vetted raw write against the records table.
    pub fn execute_raw(&self, sql: &str, params: &[JsonValue]) -> Result<usize, QuireError> {
        let changed = self
            .conn
            .execute(sql, params_from_iter(params.iter().map(filter::json_to_sql)))?;
        self.touch_all();
        debug!(changed, "raw statement executed");
        Ok(changed)
    }

    fn prepare(
        &self,
        entity_type: &str,
        doc: &JsonValue,
        mode: PrepareMode,
    ) -> Result<JsonValue, QuireError> {
        match self.store.schema_for(entity_type) {
            Some(schema) => schema.prepare(doc, mode),
            None => Ok(JsonValue::Object(descriptor::require_object(doc)?.clone())),
        }
    }

    fn check_unique(
        &self,
        entity_type: &str,
        doc: &JsonValue,
        exclude_id: Option<&str>,
    ) -> Result<(), QuireError> {
        let Some(schema) = self.store.schema_for(entity_type) else {
            return Ok(());
        };
        for field in schema.unique_fields() {
            let value = match doc.get(field) {
                None | Some(JsonValue::Null) => continue,
                Some(value) => value,
            };
            let sql = format!(
                "SELECT id FROM records WHERE entity_type = ?1 AND deleted_at IS NULL AND {} = ?2 AND id != ?3 LIMIT 1",
                filter::json_path_sql(field)
            );
            let clash: Option<String> = self
                .conn
                .query_row(
                    &sql,
                    params![entity_type, filter::json_to_sql(value), exclude_id.unwrap_or("")],
                    |row| row.get(0),
                )
                .optional()?;
            if clash.is_some() {
                return Err(QuireError::UniquenessError {
                    entity_type: entity_type.to_string(),
                    field: field.to_string(),
                    value: value.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Load a record by id. Tombstoned rows only when `include_deleted`.
    pub fn get(&self, id: &str, include_deleted: bool) -> Result<Option<Record>, QuireError> {
        let sql = if include_deleted {
            format!("SELECT {RECORD_COLUMNS} FROM records WHERE id = ?1")
        } else {
            format!("SELECT {RECORD_COLUMNS} FROM records WHERE id = ?1 AND deleted_at IS NULL")
        };
        let row = self
            .conn
            .query_row(&sql, params![id], RecordRow::from_row)
            .optional()?;
        row.map(RecordRow::into_record).transpose()
    }

    /// Uncached read inside the transaction, active rows only.
    pub fn find(&self, entity_type: &str, filter: &Filter) -> Result<Vec<Record>, QuireError> {
        let mut sql = format!(
            "SELECT {RECORD_COLUMNS} FROM records WHERE entity_type = ? AND deleted_at IS NULL"
        );
        let mut params: Vec<SqlValue> = vec![SqlValue::Text(entity_type.to_string())];
        if let Some((clause, filter_params)) = filter.to_sql() {
            sql.push_str(" AND ");
            sql.push_str(&clause);
            params.extend(filter_params);
        }
        sql.push_str(" ORDER BY created_at ASC, rowid ASC");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params), RecordRow::from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?.into_record()?);
        }
        Ok(out)
    }

    pub fn create(
        &self,
        entity_type: &str,
        data: JsonValue,
        metadata: Option<JsonValue>,
    ) -> Result<Record, QuireError> {
        descriptor::check_entity_type(entity_type)?;
        let data = self.prepare(entity_type, &data, PrepareMode::Full)?;
        self.check_unique(entity_type, &data, None)?;

        let id = time::new_record_id();
        let now = time::now_epoch_millis();
        let metadata = metadata.unwrap_or_else(|| JsonValue::Object(Map::new()));
        self.conn.execute(
            "INSERT INTO records (id, entity_type, data, metadata, version, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, 1, ?5, ?5)",
            params![id, entity_type, data.to_string(), metadata.to_string(), now],
        )?;
        self.touch(entity_type);
        debug!(entity_type, id = %id, "record created");

        Ok(Record {
            id,
            entity_type: entity_type.to_string(),
            data,
            metadata,
            version: 1,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        })
    }

    pub fn create_many(
        &self,
        entity_type: &str,
        docs: Vec<JsonValue>,
    ) -> Result<Vec<Record>, QuireError> {
        let mut out = Vec::with_capacity(docs.len());
        for (i, doc) in docs.into_iter().enumerate() {
            let record = self.create(entity_type, doc, None).map_err(|e| match e {
                QuireError::ValidationError(msg) => {
                    QuireError::ValidationError(format!("item {i}: {msg}"))
                }
                other => other,
            })?;
            out.push(record);
        }
        Ok(out)
    }

    fn write_data(
        &self,
        existing: &Record,
        data: JsonValue,
        expected_version: Option<i64>,
    ) -> Result<Option<Record>, QuireError> {
        self.check_unique(&existing.entity_type, &data, Some(&existing.id))?;
        let now = time::now_epoch_millis();
        let changed = self.conn.execute(
            "UPDATE records SET data = ?1, version = version + 1, updated_at = ?2
             WHERE id = ?3 AND deleted_at IS NULL AND version = ?4",
            params![
                data.to_string(),
                now,
                existing.id,
                expected_version.unwrap_or(existing.version)
            ],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        self.touch(&existing.entity_type);
        self.get(&existing.id, false)
    }

    fn merged(&self, existing: &Record, partial: &JsonValue) -> Result<JsonValue, QuireError> {
        let patch = descriptor::require_object(partial)?;
        let mut merged = existing.data.as_object().cloned().unwrap_or_default();
        for (k, v) in patch {
            merged.insert(k.clone(), v.clone());
        }
        self.prepare(
            &existing.entity_type,
            &JsonValue::Object(merged),
            PrepareMode::Merged,
        )
    }

    /// Shallow-merge `partial` into the stored document. `None` when the id is
    /// absent or tombstoned.
    pub fn update(&self, id: &str, partial: JsonValue) -> Result<Option<Record>, QuireError> {
        let Some(existing) = self.get(id, false)? else {
            return Ok(None);
        };
        let data = self.merged(&existing, &partial)?;
        self.write_data(&existing, data, None)
    }

    pub fn update_if_version(
        &self,
        id: &str,
        expected_version: i64,
        partial: JsonValue,
    ) -> Result<Option<Record>, QuireError> {
        let Some(existing) = self.get(id, false)? else {
            return Ok(None);
        };
        if existing.version != expected_version {
            debug!(id, expected_version, actual = existing.version, "version moved");
            return Ok(None);
        }
        let data = self.merged(&existing, &partial)?;
        self.write_data(&existing, data, Some(expected_version))
    }

    pub fn update_many(
        &self,
        entity_type: &str,
        filter: &Filter,
        partial: JsonValue,
    ) -> Result<usize, QuireError> {
        descriptor::require_object(&partial)?;
        let mut updated = 0;
        for record in self.find(entity_type, filter)? {
            if self.update(&record.id, partial.clone())?.is_some() {
                updated += 1;
            }
        }
        Ok(updated)
    }

    /// Substitute the whole document (no merge).
    pub fn replace(&self, id: &str, doc: JsonValue) -> Result<Option<Record>, QuireError> {
        let Some(existing) = self.get(id, false)? else {
            return Ok(None);
        };
        let data = self.prepare(&existing.entity_type, &doc, PrepareMode::Full)?;
        self.write_data(&existing, data, None)
    }

    /// Soft delete sets the tombstone; hard delete removes the row for good.
    pub fn delete(&self, id: &str, soft: bool) -> Result<bool, QuireError> {
        let Some(existing) = self.get(id, !soft)? else {
            return Ok(false);
        };
        let changed = if soft {
            let now = time::now_epoch_millis();
            self.conn.execute(
                "UPDATE records SET deleted_at = ?1, updated_at = ?1, version = version + 1
                 WHERE id = ?2 AND deleted_at IS NULL",
                params![now, id],
            )?
        } else {
            self.conn
                .execute("DELETE FROM records WHERE id = ?1", params![id])?
        };
        if changed > 0 {
            self.touch(&existing.entity_type);
        }
        Ok(changed > 0)
    }

    pub fn delete_many(
        &self,
        entity_type: &str,
        filter: &Filter,
        soft: bool,
    ) -> Result<usize, QuireError> {
        let now = time::now_epoch_millis();
        let (mut sql, mut params): (String, Vec<SqlValue>) = if soft {
            (
                "UPDATE records SET deleted_at = ?, updated_at = ?, version = version + 1
                 WHERE entity_type = ? AND deleted_at IS NULL"
                    .to_string(),
                vec![
                    SqlValue::Integer(now),
                    SqlValue::Integer(now),
                    SqlValue::Text(entity_type.to_string()),
                ],
            )
        } else {
            (
                "DELETE FROM records WHERE entity_type = ? AND deleted_at IS NULL".to_string(),
                vec![SqlValue::Text(entity_type.to_string())],
            )
        };
        if let Some((clause, filter_params)) = filter.to_sql() {
            sql.push_str(" AND ");
            sql.push_str(&clause);
            params.extend(filter_params);
        }
        let changed = self.conn.execute(&sql, params_from_iter(params))?;
        if changed > 0 {
            self.touch(entity_type);
        }
        Ok(changed)
    }

    /// Clear a tombstone. `false` when the record is absent or active.
    pub fn restore(&self, id: &str) -> Result<bool, QuireError> {
        let Some(existing) = self.get(id, true)? else {
            return Ok(false);
        };
        if !existing.is_deleted() {
            return Ok(false);
        }
        self.check_unique(&existing.entity_type, &existing.data, Some(&existing.id))?;
        let now = time::now_epoch_millis();
        let changed = self.conn.execute(
            "UPDATE records SET deleted_at = NULL, updated_at = ?1, version = version + 1
             WHERE id = ?2 AND deleted_at IS NOT NULL",
            params![now, id],
        )?;
        if changed > 0 {
            self.touch(&existing.entity_type);
        }
        Ok(changed > 0)
    }
}
