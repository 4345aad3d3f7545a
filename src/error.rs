//! Error types for database bootstrap coordination.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Lock contention is deliberately absent: losing the initializer race is an
//! expected branch, not a failure.

use crate::models::DbState;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    /// Transient: retried with backoff by the connection supervisor.
    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    /// Authentication or configuration problems. Never retried.
    #[error("Fatal connection error: {message}")]
    FatalConnection { message: String, suggestion: String },

    #[error("Connection retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Schema bootstrap failed: {message}")]
    SchemaBootstrap {
        message: String,
        /// Statement that failed, if the failure came from DDL execution.
        statement: Option<String>,
    },

    #[error("Schema validation failed, missing tables: {}", missing.join(", "))]
    Validation { missing: Vec<String> },

    #[error("Timed out after {waited_ms}ms waiting for the initializer to finish")]
    WaiterTimeout { waited_ms: u64 },

    #[error("Lock error: {message}")]
    Lock { message: String },

    #[error("Database not ready (state: {state})")]
    NotReady { state: DbState },

    #[error("Pool not available: {name}")]
    PoolNotFound { name: String },

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: DbState, to: DbState },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Timeout: {operation} exceeded {elapsed_secs}s")]
    Timeout {
        operation: String,
        elapsed_secs: u32,
    },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a transient connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a fatal (non-retryable) connection error.
    pub fn fatal_connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::FatalConnection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    pub fn retries_exhausted(attempts: u32, last_error: impl Into<String>) -> Self {
        Self::RetriesExhausted {
            attempts,
            last_error: last_error.into(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    /// Create a schema bootstrap error, optionally naming the failing statement.
    pub fn schema_bootstrap(message: impl Into<String>, statement: Option<&str>) -> Self {
        Self::SchemaBootstrap {
            message: message.into(),
            statement: statement.map(String::from),
        }
    }

    pub fn validation(missing: Vec<String>) -> Self {
        Self::Validation { missing }
    }

    pub fn waiter_timeout(waited: std::time::Duration) -> Self {
        Self::WaiterTimeout {
            waited_ms: waited.as_millis() as u64,
        }
    }

    pub fn lock(message: impl Into<String>) -> Self {
        Self::Lock {
            message: message.into(),
        }
    }

    pub fn not_ready(state: DbState) -> Self {
        Self::NotReady { state }
    }

    pub fn pool_not_found(name: impl Into<String>) -> Self {
        Self::PoolNotFound { name: name.into() }
    }

    pub fn invalid_transition(from: DbState, to: DbState) -> Self {
        Self::InvalidTransition { from, to }
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_secs: u32) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_secs,
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::FatalConnection { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            _ => None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }

    /// Classify an error raised while establishing a connection.
    ///
    /// Network-level failures are transient. Bad configuration and credentials are
    /// fatal, since retrying cannot fix them.
    pub fn from_connect_error(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::fatal_connection(
                msg.to_string(),
                "Check the connection string format and credentials",
            ),
            sqlx::Error::Tls(tls_err) => DbError::fatal_connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Database(db_err) => {
                if is_fatal_server_error(db_err.as_ref()) {
                    DbError::fatal_connection(
                        db_err.message().to_string(),
                        "Verify the username, password and database name in the connection string",
                    )
                } else {
                    DbError::connection(
                        db_err.message().to_string(),
                        "The database server rejected the connection; it may be starting up or overloaded",
                    )
                }
            }
            sqlx::Error::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::PoolTimedOut => DbError::connection(
                "Timed out establishing a connection",
                "Check that the database server is reachable",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::WorkerCrashed => DbError::connection(
                "Database worker crashed",
                "Retry the connection",
            ),
            other => DbError::from(other),
        }
    }
}

/// Authentication failures and unknown databases, per backend.
fn is_fatal_server_error(db_err: &dyn sqlx::error::DatabaseError) -> bool {
    if let Some(mysql) = db_err.try_downcast_ref::<sqlx::mysql::MySqlDatabaseError>() {
        // ER_DBACCESS_DENIED_ERROR, ER_ACCESS_DENIED_ERROR, ER_BAD_DB_ERROR
        return matches!(mysql.number(), 1044 | 1045 | 1049);
    }

    let code = db_err.code();
    let code = code.as_deref().unwrap_or_default();

    if db_err
        .try_downcast_ref::<sqlx::sqlite::SqliteError>()
        .is_some()
    {
        // Primary result code lives in the low byte of extended codes.
        // BUSY (5), LOCKED (6) and CANTOPEN (14) can clear up on their own.
        return match code.parse::<i32>() {
            Ok(extended) => !matches!(extended & 0xff, 5 | 6 | 14),
            Err(_) => true,
        };
    }

    matches!(code, "28000" | "28P01" | "3D000")
}

/// SQLSTATE class 08 (connection exception) and Postgres shutdown/termination
/// codes (57P01 admin_shutdown, 57P02 crash_shutdown, 57P03 cannot_connect_now).
fn is_lost_session_code(code: &str) -> bool {
    code.starts_with("08") || matches!(code, "57P01" | "57P02" | "57P03")
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::fatal_connection(
                msg.to_string(),
                "Check the connection string format and credentials",
            ),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                if code.as_deref().is_some_and(is_lost_session_code) {
                    return DbError::connection(
                        db_err.message().to_string(),
                        "The server ended the session; reconnect and retry",
                    );
                }
                DbError::database(
                    db_err.message(),
                    code,
                    "Check the SQL syntax and referenced objects",
                )
            }
            sqlx::Error::RowNotFound => DbError::database(
                "No rows returned",
                None,
                "Verify the query conditions match existing data",
            ),
            sqlx::Error::PoolTimedOut => DbError::timeout("connection pool acquire", 30),
            sqlx::Error::PoolClosed => {
                DbError::connection("Connection pool is closed", "Reinitialize the database")
            }
            sqlx::Error::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::fatal_connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::ColumnNotFound(col) => {
                DbError::internal(format!("Column not found: {}", col))
            }
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => DbError::internal("Database worker crashed"),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
