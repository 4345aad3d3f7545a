//! Database layer.
//!
//! This module provides the bootstrap coordination pieces:
//! - Backend dispatch macros for reducing code duplication
//! - Init connections and the named connection pools
//! - The initialization state machine
//! - Connection retry with backoff
//! - The cross-process initializer lock
//! - Idempotent schema bootstrap
//! - The `DatabaseManager` façade tying them together

#[macro_use]
pub mod macros;
pub mod lock;
pub mod manager;
pub mod pool;
pub mod schema;
pub mod state_machine;
pub mod supervisor;

pub use lock::{LockAttempt, LockCoordinator, LockHandle, lock_id_for};
pub use manager::DatabaseManager;
pub use pool::{DbConnection, DbPool, InitConnection, PoolName, PoolRegistry};
pub use schema::{SchemaBootstrapper, SchemaDefinition, TableDef};
pub use state_machine::{ObserverError, StateMachine, StateObserver};
pub use supervisor::{ConnectionSupervisor, RetryPolicy};
