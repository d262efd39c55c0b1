use crate::core::error::QuireError;
use rusqlite::Row;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A stored document. Timestamps are unix-epoch milliseconds.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Record {
    pub id: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    pub data: JsonValue,
    pub metadata: JsonValue,
    pub version: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
}

impl Record {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Convenience accessor for a top-level document field.
    pub fn field(&self, name: &str) -> Option<&JsonValue> {
        self.data.get(name)
    }
}

pub(crate) const RECORD_COLUMNS: &str =
    "id, entity_type, data, metadata, version, created_at, updated_at, deleted_at";

/// Raw row as read from SQLite; JSON columns still serialized.
pub(crate) struct RecordRow {
    id: String,
    entity_type: String,
    data: String,
    metadata: String,
    version: i64,
    created_at: i64,
    updated_at: i64,
    deleted_at: Option<i64>,
}

impl RecordRow {
    /// Column order must match `RECORD_COLUMNS`.
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            entity_type: row.get(1)?,
            data: row.get(2)?,
            metadata: row.get(3)?,
            version: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
            deleted_at: row.get(7)?,
        })
    }

    pub(crate) fn into_record(self) -> Result<Record, QuireError> {
        Ok(Record {
            id: self.id,
            entity_type: self.entity_type,
            data: serde_json::from_str(&self.data)?,
            metadata: serde_json::from_str(&self.metadata)?,
            version: self.version,
            created_at: self.created_at,
            updated_at: self.updated_at,
            deleted_at: self.deleted_at,
        })
    }
}
