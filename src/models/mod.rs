//! Data models for database bootstrap coordination.
//!
//! This module re-exports all model types used throughout the application.

pub mod connection;
pub mod health;
pub mod state;

// Re-export commonly used types
pub use connection::{DatabaseType, masked_dsn};
pub use health::HealthReport;
pub use state::{DbState, InitProgress};
