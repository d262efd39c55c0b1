//! Frequency-triggered index creation.
//!
//! Every filtered read reports the document fields it touched. When a
//! `(type, field)` pair reaches the threshold, a partial expression index
//! scoped to that type's active rows is created once. The index catalog makes
//! the creation idempotent across restarts, where counters start from zero.

use crate::core::error::QuireError;
use crate::core::filter;
use crate::core::time;
use rusqlite::{Connection, OptionalExtension, params};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexOrigin {
    Schema,
    Adaptive,
}

impl IndexOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexOrigin::Schema => "schema",
            IndexOrigin::Adaptive => "adaptive",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexCatalogEntry {
    pub entity_type: String,
    pub field_name: String,
    pub index_name: String,
    pub origin: String,
    pub created_at: i64,
}

pub struct AdaptiveIndexer {
    counters: Mutex<FxHashMap<(String, String), u64>>,
    threshold: u64,
    enabled: bool,
}

impl AdaptiveIndexer {
    pub fn new(threshold: u64, enabled: bool) -> Self {
        Self {
            counters: Mutex::new(FxHashMap::default()),
            threshold: threshold.max(1),
            enabled,
        }
    }

    /// Count one observation per field; return the fields that just reached
    /// the threshold. Each pair is returned at most once per process.
    pub fn observe(&self, entity_type: &str, fields: &[String]) -> Vec<String> {
        if !self.enabled || fields.is_empty() {
            return Vec::new();
        }
        let Ok(mut counters) = self.counters.lock() else {
            return Vec::new();
        };
        let mut crossed = Vec::new();
        for field in fields {
            let count = counters
                .entry((entity_type.to_string(), field.clone()))
                .or_insert(0);
            *count += 1;
            if *count == self.threshold {
                crossed.push(field.clone());
            }
        }
        crossed
    }

    pub fn observations(&self, entity_type: &str, field: &str) -> u64 {
        self.counters
            .lock()
            .ok()
            .and_then(|c| c.get(&(entity_type.to_string(), field.to_string())).copied())
            .unwrap_or(0)
    }
}

fn sanitize_segment(input: &str) -> String {
    input
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .take(24)
        .collect()
}

/// Stable, collision-resistant index name for `(type, field)`.
pub fn index_name(entity_type: &str, field: &str, origin: IndexOrigin) -> String {
    let mut hasher = Sha256::new();
    hasher.update(entity_type.as_bytes());
    hasher.update([0u8]);
    hasher.update(field.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!(
        "idx_{}_{}_{}_{}",
        origin.as_str(),
        sanitize_segment(entity_type),
        sanitize_segment(field),
        &digest[..8]
    )
}

/// Create the conditional index for `(type, field)` unless the catalog already
/// lists it. Returns the index name when one was created.
pub fn ensure_index(
    conn: &Connection,
    entity_type: &str,
    field: &str,
    origin: IndexOrigin,
) -> Result<Option<String>, QuireError> {
    filter::check_field_name(field)?;
    let name = index_name(entity_type, field, origin);
    let known: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM index_catalog WHERE index_name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()?;
    if known.is_some() {
        return Ok(None);
    }

    let type_literal = entity_type.replace('\'', "''");
    let ddl = format!(
        "CREATE INDEX IF NOT EXISTS {name} ON records({}) WHERE entity_type = '{type_literal}' AND deleted_at IS NULL",
        filter::json_path_sql(field)
    );
    conn.execute(&ddl, [])?;
    conn.execute(
        "INSERT OR IGNORE INTO index_catalog (entity_type, field_name, index_name, origin, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![entity_type, field, name, origin.as_str(), time::now_epoch_millis()],
    )?;
    Ok(Some(name))
}

pub fn list_catalog(conn: &Connection) -> Result<Vec<IndexCatalogEntry>, QuireError> {
    let mut stmt = conn.prepare(
        "SELECT entity_type, field_name, index_name, origin, created_at FROM index_catalog ORDER BY created_at, index_name",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(IndexCatalogEntry {
            entity_type: row.get(0)?,
            field_name: row.get(1)?,
            index_name: row.get(2)?,
            origin: row.get(3)?,
            created_at: row.get(4)?,
        })
    })?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}
