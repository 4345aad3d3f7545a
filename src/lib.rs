//! DB Bootstrap Library
//!
//! Brings a database-backed service into a ready state: connects with backoff,
//! elects one initializer across instances, applies the schema idempotently and
//! exposes named connection pools (SQLite, PostgreSQL, MySQL).

pub mod config;
pub mod db;
pub mod error;
pub mod models;

pub use config::{Config, InitConfig};
pub use db::{DatabaseManager, PoolName, SchemaDefinition};
pub use error::{DbError, DbResult};
pub use models::{DbState, HealthReport, InitProgress};
