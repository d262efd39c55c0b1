//! Read path of the store: filtered finds, counts, substring search,
//! aggregates and read-only raw SQL.
//!
//! Every filtered read reports its document fields to the adaptive indexer
//! (cache hits included) and results are cached per entity type unless the
//! caller opts out.

use crate::core::cache::{self, CacheStats, CachedValue};
use crate::core::descriptor::SchemaDescriptor;
use crate::core::error::QuireError;
use crate::core::filter::{self, FieldRef, Filter, OrderBy};
use crate::core::indexer::{self, IndexCatalogEntry, IndexOrigin};
use crate::core::record::{RECORD_COLUMNS, Record, RecordRow};
use crate::core::store::{BY_ID_NAMESPACE, ENGINE_ACTOR, Store};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{OptionalExtension, params, params_from_iter};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue, json};
use std::collections::BTreeMap;
use std::str::FromStr;
use tracing::{debug, info, warn};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FindOptions {
    pub order_by: Vec<OrderBy>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub use_cache: bool,
    /// Administrative escape hatch: also return tombstoned rows.
    pub include_deleted: bool,
}

impl Default for FindOptions {
    fn default() -> Self {
        Self {
            order_by: Vec::new(),
            limit: None,
            offset: None,
            use_cache: true,
            include_deleted: false,
        }
    }
}

impl FindOptions {
    pub fn uncached() -> Self {
        Self {
            use_cache: false,
            ..Self::default()
        }
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by.push(order);
        self
    }

    fn order_sql(&self) -> Result<String, QuireError> {
        if self.order_by.is_empty() {
            return Ok("created_at ASC, rowid ASC".to_string());
        }
        let mut parts = Vec::with_capacity(self.order_by.len() + 1);
        for order in &self.order_by {
            parts.push(order.sql()?);
        }
        parts.push("rowid ASC".to_string());
        Ok(parts.join(", "))
    }

    fn page_sql(&self, params: &mut Vec<SqlValue>) -> String {
        match (self.limit, self.offset) {
            (None, None) => String::new(),
            (Some(limit), offset) => {
                params.push(SqlValue::Integer(limit as i64));
                params.push(SqlValue::Integer(offset.unwrap_or(0) as i64));
                " LIMIT ? OFFSET ?".to_string()
            }
            (None, Some(offset)) => {
                params.push(SqlValue::Integer(offset as i64));
                " LIMIT -1 OFFSET ?".to_string()
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateOp {
    Sum,
    Avg,
    Min,
    Max,
    Count,
}

impl AggregateOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateOp::Sum => "sum",
            AggregateOp::Avg => "avg",
            AggregateOp::Min => "min",
            AggregateOp::Max => "max",
            AggregateOp::Count => "count",
        }
    }

    fn sql(&self, expr: &str) -> String {
        match self {
            AggregateOp::Count => format!("COUNT({expr})"),
            AggregateOp::Sum => format!("COALESCE(SUM(CAST({expr} AS REAL)), 0)"),
            AggregateOp::Avg => format!("COALESCE(AVG(CAST({expr} AS REAL)), 0)"),
            AggregateOp::Min => format!("COALESCE(MIN(CAST({expr} AS REAL)), 0)"),
            AggregateOp::Max => format!("COALESCE(MAX(CAST({expr} AS REAL)), 0)"),
        }
    }
}

impl FromStr for AggregateOp {
    type Err = QuireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sum" => Ok(AggregateOp::Sum),
            "avg" => Ok(AggregateOp::Avg),
            "min" => Ok(AggregateOp::Min),
            "max" => Ok(AggregateOp::Max),
            "count" => Ok(AggregateOp::Count),
            other => Err(QuireError::ValidationError(format!(
                "unknown aggregate operation '{other}' (expected sum|avg|min|max|count)"
            ))),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TypeSnapshot {
    pub schema: Option<SchemaDescriptor>,
    pub active_count: u64,
}

/// What is known about every type: its contract, if any, and live row count.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct SchemaSnapshot {
    pub types: BTreeMap<String, TypeSnapshot>,
}

impl SchemaSnapshot {
    pub fn get(&self, entity_type: &str) -> Option<&TypeSnapshot> {
        self.types.get(entity_type)
    }

    pub fn active_count(&self, entity_type: &str) -> u64 {
        self.get(entity_type).map(|t| t.active_count).unwrap_or(0)
    }
}

/// `WHERE` prefix shared by every typed read.
fn scope_sql(entity_type: &str, include_deleted: bool) -> (String, Vec<SqlValue>) {
    let sql = if include_deleted {
        "entity_type = ?".to_string()
    } else {
        "entity_type = ? AND deleted_at IS NULL".to_string()
    };
    (sql, vec![SqlValue::Text(entity_type.to_string())])
}

fn with_filter(mut scope: (String, Vec<SqlValue>), filter: &Filter) -> (String, Vec<SqlValue>) {
    if let Some((clause, params)) = filter.to_sql() {
        scope.0.push_str(" AND ");
        scope.0.push_str(&clause);
        scope.1.extend(params);
    }
    scope
}

fn escape_like(needle: &str) -> String {
    let mut out = String::with_capacity(needle.len() + 2);
    out.push('%');
    for c in needle.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('%');
    out
}

fn sql_to_json(column: &str, value: ValueRef<'_>) -> JsonValue {
    match value {
        ValueRef::Null => JsonValue::Null,
        ValueRef::Integer(i) => JsonValue::from(i),
        ValueRef::Real(f) => JsonValue::from(f),
        ValueRef::Text(bytes) => {
            let text = String::from_utf8_lossy(bytes).into_owned();
            if matches!(column, "data" | "metadata") {
                serde_json::from_str(&text).unwrap_or(JsonValue::String(text))
            } else {
                JsonValue::String(text)
            }
        }
        ValueRef::Blob(bytes) => {
            JsonValue::String(bytes.iter().map(|b| format!("{b:02x}")).collect())
        }
    }
}

impl Store {
    /// Count the filter's document fields and create adaptive indexes for any
    /// pair that just reached the threshold.
    fn observe_filter(&self, entity_type: &str, filter: &Filter) {
        let crossed = self.indexer.observe(entity_type, &filter.document_fields());
        for field in crossed {
            let created = self.broker.with_tx(ENGINE_ACTOR, "index.adaptive", |conn| {
                indexer::ensure_index(conn, entity_type, &field, IndexOrigin::Adaptive)
            });
            match created {
                Ok(Some(name)) => info!(entity_type, field = %field, index = %name, "adaptive index created"),
                Ok(None) => debug!(entity_type, field = %field, "adaptive index already cataloged"),
                Err(e) => warn!(entity_type, field = %field, error = %e, "adaptive index creation failed"),
            }
        }
    }

    fn cached<F>(
        &self,
        namespace: &str,
        use_cache: bool,
        op: &str,
        args: JsonValue,
        load: F,
    ) -> Result<CachedValue, QuireError>
    where
        F: FnOnce() -> Result<CachedValue, QuireError>,
    {
        if !use_cache {
            return load();
        }
        let key = cache::cache_key(op, &args);
        if let Some(hit) = self.cache.get(namespace, &key) {
            return Ok(hit);
        }
        let seen = self.cache.generation(namespace);
        let value = load()?;
        if let Some(seen) = seen
            && !self.cache.put_if_current(namespace, seen, key, value.clone())
        {
            debug!(namespace, op, "skipped caching a read that raced a write");
        }
        Ok(value)
    }

    fn load_records(&self, sql: &str, params: Vec<SqlValue>) -> Result<Vec<Record>, QuireError> {
        self.broker.with_read(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map(params_from_iter(params), RecordRow::from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?.into_record()?);
            }
            Ok(out)
        })
    }

    pub fn find(
        &self,
        entity_type: &str,
        filter: &JsonValue,
        opts: &FindOptions,
    ) -> Result<Vec<Record>, QuireError> {
        let parsed = Filter::parse(filter)?;
        self.observe_filter(entity_type, &parsed);

        let args = json!({"type": entity_type, "filter": filter, "opts": opts});
        let value = self.cached(entity_type, opts.use_cache, "find", args, || {
            let (clause, mut params) =
                with_filter(scope_sql(entity_type, opts.include_deleted), &parsed);
            let mut sql = format!(
                "SELECT {RECORD_COLUMNS} FROM records WHERE {clause} ORDER BY {}",
                opts.order_sql()?
            );
            sql.push_str(&opts.page_sql(&mut params));
            Ok(CachedValue::Records(self.load_records(&sql, params)?))
        })?;
        match value {
            CachedValue::Records(records) => Ok(records),
            _ => Ok(Vec::new()),
        }
    }

    pub fn find_one(
        &self,
        entity_type: &str,
        filter: &JsonValue,
        opts: &FindOptions,
    ) -> Result<Option<Record>, QuireError> {
        let opts = opts.clone().limit(1);
        Ok(self.find(entity_type, filter, &opts)?.into_iter().next())
    }

    /// Active record by id, whatever its type.
    pub fn find_by_id(&self, id: &str) -> Result<Option<Record>, QuireError> {
        self.find_by_id_with(id, true)
    }

    pub fn find_by_id_with(&self, id: &str, use_cache: bool) -> Result<Option<Record>, QuireError> {
        let value = self.cached(BY_ID_NAMESPACE, use_cache, "find_by_id", json!(id), || {
            let sql =
                format!("SELECT {RECORD_COLUMNS} FROM records WHERE id = ?1 AND deleted_at IS NULL");
            let record = self.broker.with_read(|conn| {
                let row = conn
                    .query_row(&sql, params![id], RecordRow::from_row)
                    .optional()?;
                row.map(RecordRow::into_record).transpose()
            })?;
            Ok(CachedValue::Record(record))
        })?;
        match value {
            CachedValue::Record(record) => Ok(record),
            _ => Ok(None),
        }
    }

    pub fn count(
        &self,
        entity_type: &str,
        filter: &JsonValue,
        opts: &FindOptions,
    ) -> Result<u64, QuireError> {
        let parsed = Filter::parse(filter)?;
        self.observe_filter(entity_type, &parsed);

        let args = json!({"type": entity_type, "filter": filter, "deleted": opts.include_deleted});
        let value = self.cached(entity_type, opts.use_cache, "count", args, || {
            let (clause, params) =
                with_filter(scope_sql(entity_type, opts.include_deleted), &parsed);
            let sql = format!("SELECT COUNT(*) FROM records WHERE {clause}");
            let n: i64 = self.broker.with_read(|conn| {
                Ok(conn.query_row(&sql, params_from_iter(params), |row| row.get(0))?)
            })?;
            Ok(CachedValue::Count(n.max(0) as u64))
        })?;
        match value {
            CachedValue::Count(n) => Ok(n),
            _ => Ok(0),
        }
    }

    /// Administrative count that also sees tombstoned rows.
    pub fn count_including_deleted(&self, entity_type: &str) -> Result<u64, QuireError> {
        let opts = FindOptions {
            include_deleted: true,
            use_cache: false,
            ..FindOptions::default()
        };
        self.count(entity_type, &JsonValue::Null, &opts)
    }

    pub fn exists(&self, entity_type: &str, filter: &JsonValue) -> Result<bool, QuireError> {
        Ok(self
            .find_one(entity_type, filter, &FindOptions::default())?
            .is_some())
    }

    /// Substring scan over the serialized document. Never uses an index.
    pub fn search(
        &self,
        entity_type: &str,
        needle: &str,
        opts: &FindOptions,
    ) -> Result<Vec<Record>, QuireError> {
        let args = json!({"type": entity_type, "needle": needle, "opts": opts});
        let value = self.cached(entity_type, opts.use_cache, "search", args, || {
            let (clause, mut params) = scope_sql(entity_type, opts.include_deleted);
            params.push(SqlValue::Text(escape_like(needle)));
            let mut sql = format!(
                "SELECT {RECORD_COLUMNS} FROM records WHERE {clause} AND data LIKE ? ESCAPE '\\' ORDER BY {}",
                opts.order_sql()?
            );
            sql.push_str(&opts.page_sql(&mut params));
            Ok(CachedValue::Records(self.load_records(&sql, params)?))
        })?;
        match value {
            CachedValue::Records(records) => Ok(records),
            _ => Ok(Vec::new()),
        }
    }

    pub fn aggregate(
        &self,
        entity_type: &str,
        field: &str,
        op: AggregateOp,
    ) -> Result<f64, QuireError> {
        self.aggregate_where(entity_type, field, op, &JsonValue::Null)
    }

    /// Aggregate over the active rows matching `filter`; 0 on the empty set.
    pub fn aggregate_where(
        &self,
        entity_type: &str,
        field: &str,
        op: AggregateOp,
        filter: &JsonValue,
    ) -> Result<f64, QuireError> {
        let target = FieldRef::parse(field)?;
        let parsed = Filter::parse(filter)?;
        self.observe_filter(entity_type, &parsed);

        let args = json!({"type": entity_type, "field": field, "op": op, "filter": filter});
        let value = self.cached(entity_type, true, "aggregate", args, || {
            let (clause, params) = with_filter(scope_sql(entity_type, false), &parsed);
            let sql = format!(
                "SELECT {} FROM records WHERE {clause}",
                op.sql(&target.sql())
            );
            let n: f64 = self.broker.with_read(|conn| {
                Ok(conn.query_row(&sql, params_from_iter(params), |row| row.get(0))?)
            })?;
            Ok(CachedValue::Number(n))
        })?;
        match value {
            CachedValue::Number(n) => Ok(n),
            CachedValue::Count(n) => Ok(n as f64),
            _ => Ok(0.0),
        }
    }

    /// Run a read-only statement and return one JSON object per row. The
    /// `data` and `metadata` columns come back parsed.
    pub fn query_raw(&self, sql: &str, params: &[JsonValue]) -> Result<Vec<JsonValue>, QuireError> {
        self.broker.with_read(|conn| {
            let mut stmt = conn.prepare(sql)?;
            if !stmt.readonly() {
                return Err(QuireError::PolicyViolation(
                    "raw query must be read-only".to_string(),
                ));
            }
            let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
            let mut rows = stmt.query(params_from_iter(params.iter().map(filter::json_to_sql)))?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let mut obj = Map::new();
                for (i, column) in columns.iter().enumerate() {
                    obj.insert(column.clone(), sql_to_json(column, row.get_ref(i)?));
                }
                out.push(JsonValue::Object(obj));
            }
            Ok(out)
        })
    }

    pub fn schema_snapshot(&self) -> Result<SchemaSnapshot, QuireError> {
        let counts: Vec<(String, i64)> = self.broker.with_read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT entity_type, COUNT(*) FROM records WHERE deleted_at IS NULL GROUP BY entity_type",
            )?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })?;

        let mut snapshot = SchemaSnapshot::default();
        for schema in self.registered_schemas() {
            snapshot.types.insert(
                schema.entity_type.clone(),
                TypeSnapshot {
                    schema: Some(schema),
                    active_count: 0,
                },
            );
        }
        for (entity_type, n) in counts {
            snapshot
                .types
                .entry(entity_type)
                .or_insert(TypeSnapshot {
                    schema: None,
                    active_count: 0,
                })
                .active_count = n.max(0) as u64;
        }
        Ok(snapshot)
    }

    pub fn index_catalog(&self) -> Result<Vec<IndexCatalogEntry>, QuireError> {
        self.broker.with_read(indexer::list_catalog)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}
