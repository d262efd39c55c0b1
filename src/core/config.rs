//! Engine configuration loaded from `quire.toml`.
//!
//! A missing config file means defaults (in-memory database, 60 s cache TTL,
//! adaptive indexing at 100 observations). `QUIRE_DB` and
//! `QUIRE_CACHE_TTL_SECS` override the file.

use crate::core::db;
use crate::core::descriptor::SchemaDescriptor;
use crate::core::error::QuireError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CACHE_TTL_SECS: u64 = 60;
pub const DEFAULT_INDEX_THRESHOLD: u64 = 100;
pub const CONFIG_FILE_NAME: &str = "quire.toml";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: DEFAULT_CACHE_TTL_SECS,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexingConfig {
    pub enabled: bool,
    pub threshold: u64,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: DEFAULT_INDEX_THRESHOLD,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// SQLite file path, or `:memory:`.
    pub database: String,
    /// Directory receiving `broker.events.jsonl`. No audit log when unset.
    pub audit_dir: Option<PathBuf>,
    pub cache: CacheConfig,
    pub indexing: IndexingConfig,
    /// Schemas registered every time the store is opened.
    pub schemas: Vec<SchemaDescriptor>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database: db::MEMORY_DB.to_string(),
            audit_dir: None,
            cache: CacheConfig::default(),
            indexing: IndexingConfig::default(),
            schemas: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn with_database(path: impl AsRef<Path>) -> Self {
        Self {
            database: path.as_ref().to_string_lossy().to_string(),
            ..Self::default()
        }
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.ttl_secs)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, QuireError> {
        toml::from_str(content).map_err(|e| QuireError::ConfigError(e.to_string()))
    }

    /// Load `path` if it exists, otherwise defaults; then apply env overrides.
    pub fn load(path: &Path) -> Result<Self, QuireError> {
        let mut config = Self::load_file(path)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// File contents only, without env overrides.
    pub fn load_file(path: &Path) -> Result<Self, QuireError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).map_err(QuireError::IoError)?;
        Self::from_toml_str(&content)
    }

    pub fn save(&self, path: &Path) -> Result<(), QuireError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| QuireError::ConfigError(e.to_string()))?;
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        Ok(())
    }

    /// Add `schema`, replacing any descriptor already declared for its type.
    pub fn upsert_schema(&mut self, schema: SchemaDescriptor) {
        self.schemas.retain(|s| s.entity_type != schema.entity_type);
        self.schemas.push(schema);
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), QuireError> {
        if let Ok(db_path) = std::env::var("QUIRE_DB")
            && !db_path.trim().is_empty()
        {
            self.database = db_path;
        }
        if let Ok(ttl) = std::env::var("QUIRE_CACHE_TTL_SECS") {
            self.cache.ttl_secs = ttl.trim().parse().map_err(|_| {
                QuireError::ConfigError(format!("QUIRE_CACHE_TTL_SECS is not an integer: {ttl}"))
            })?;
        }
        Ok(())
    }
}
