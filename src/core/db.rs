use crate::core::error;
use crate::core::schemas;
use rusqlite::Connection;
use std::fs;
use std::path::Path;

/// Sentinel database path selecting a private in-memory database.
pub const MEMORY_DB: &str = ":memory:";

pub fn db_connect(db_path: &str) -> Result<Connection, error::QuireError> {
    if db_path == MEMORY_DB {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys=ON;", [])
            .map_err(error::QuireError::RusqliteError)?;
        return Ok(conn);
    }

    if let Some(parent) = Path::new(db_path).parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(error::QuireError::IoError)?;
    }
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .map_err(error::QuireError::RusqliteError)?;
    conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))
        .map_err(error::QuireError::RusqliteError)?;
    conn.execute("PRAGMA foreign_keys=ON;", [])
        .map_err(error::QuireError::RusqliteError)?;
    Ok(conn)
}

/// Create the records table, its base indexes and the index catalog.
pub fn initialize_records_db(conn: &Connection) -> Result<(), error::QuireError> {
    for stmt in schemas::BOOTSTRAP {
        conn.execute(stmt, [])?;
    }
    Ok(())
}
