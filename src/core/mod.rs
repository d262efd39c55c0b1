//! Storage primitives for quire.
//!
//! Everything that touches SQLite lives here: the broker that owns the
//! connection, the `Store` handle with its read path, and the cache, indexer
//! and filter compiler the store is built from.

pub mod broker;
pub mod cache;
pub mod config;
pub mod db;
pub mod descriptor;
pub mod error;
pub mod filter;
pub mod indexer;
pub mod output;
pub mod query;
pub mod record;
pub mod schemas;
pub mod store;
pub mod time;
