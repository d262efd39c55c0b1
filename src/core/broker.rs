use crate::core::db;
use crate::core::error;
use crate::core::time;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

/// The DB Broker is the "Thin Waist" for state access.
///
/// It owns the single engine connection, serializes access to it, and records
/// every mutation in an append-only audit log when one is configured.
pub struct DbBroker {
    conn: Mutex<Connection>,
    db_id: String,
    audit_log_path: Option<PathBuf>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BrokerEvent {
    pub ts: String,
    pub event_id: String,
    pub actor: String,
    pub op: String,
    pub db_id: String,
    pub status: String,
}

impl DbBroker {
    pub fn open(db_path: &str, audit_dir: Option<&Path>) -> Result<Self, error::QuireError> {
        let conn = db::db_connect(db_path)?;
        db::initialize_records_db(&conn)?;
        let db_id = Path::new(db_path)
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| db_path.to_string());
        Ok(Self {
            conn: Mutex::new(conn),
            db_id,
            audit_log_path: audit_dir.map(|dir| dir.join("broker.events.jsonl")),
        })
    }

    pub fn audit_log_path(&self) -> Option<&Path> {
        self.audit_log_path.as_deref()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, error::QuireError> {
        self.conn.lock().map_err(|_| {
            error::QuireError::TransactionFailure("broker connection lock poisoned".to_string())
        })
    }

    /// Execute a read-only closure. Reads are not audited.
    pub fn with_read<F, R>(&self, f: F) -> Result<R, error::QuireError>
    where
        F: FnOnce(&Connection) -> Result<R, error::QuireError>,
    {
        let conn = self.lock()?;
        f(&conn)
    }

    /// Execute a closure inside one transaction. Any error rolls the whole
    /// closure back; success commits. The outcome is audited either way.
    pub fn with_tx<F, R>(&self, actor: &str, op_name: &str, f: F) -> Result<R, error::QuireError>
    where
        F: FnOnce(&Connection) -> Result<R, error::QuireError>,
    {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let result = f(&tx);
        let result = match result {
            Ok(value) => tx.commit().map(|_| value).map_err(error::QuireError::from),
            Err(e) => {
                debug!(op = op_name, error = %e, "rolling back transaction");
                if let Err(rollback_err) = tx.rollback() {
                    warn!(op = op_name, error = %rollback_err, "rollback failed");
                }
                Err(e)
            }
        };
        drop(conn);

        let status = if result.is_ok() { "success" } else { "error" };
        self.log_event(actor, op_name, status);
        result
    }

    fn log_event(&self, actor: &str, op: &str, status: &str) {
        let Some(path) = &self.audit_log_path else {
            return;
        };
        let ev = BrokerEvent {
            ts: time::now_epoch_z(),
            event_id: time::new_event_id(),
            actor: actor.to_string(),
            op: op.to_string(),
            db_id: self.db_id.clone(),
            status: status.to_string(),
        };
        if let Err(e) = append_event(path, &ev) {
            warn!(op, error = %e, "failed to append broker audit event");
        }
    }
}

fn append_event(path: &Path, ev: &BrokerEvent) -> Result<(), error::QuireError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut f = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(f, "{}", serde_json::to_string(ev)?)?;
    Ok(())
}

/// Read back the audit trail (oldest first).
pub fn read_audit_log(path: &Path) -> Result<Vec<BrokerEvent>, error::QuireError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)?;
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(error::QuireError::from))
        .collect()
}
