//! Distributed initializer election.
//!
//! Every instance makes one non-blocking attempt to take the lock and classifies
//! itself as initializer or waiter immediately. Waiters poll schema state instead
//! of queueing on the lock with an idle connection.
//!
//! # Backends
//!
//! - PostgreSQL: session advisory lock (`pg_try_advisory_lock`)
//! - MySQL: session named lock (`GET_LOCK` with zero timeout)
//! - SQLite: a row in `_bootstrap_locks`. SQLite has no session locks, so rows
//!   carry an owner and a timestamp, and rows older than `stale_after` are
//!   reclaimed as leftovers of a crashed initializer.
//!
//! # Release
//!
//! [`LockHandle`] owns the connection the lock was taken on. `release().await` is
//! the normal path. If a handle is dropped while held (error unwinding, task
//! cancellation) the connection is closed, which ends the session and frees
//! session locks; for SQLite a cleanup task deletes the row.

use crate::db::pool::InitConnection;
use crate::db::schema::SchemaBootstrapper;
use crate::error::{DbError, DbResult};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const SQLITE_LOCK_TABLE: &str = "_bootstrap_locks";

mod queries {
    pub mod postgres {
        pub const TRY_LOCK: &str = "SELECT pg_try_advisory_lock($1)";
        pub const UNLOCK: &str = "SELECT pg_advisory_unlock($1)";
    }

    pub mod mysql {
        pub const TRY_LOCK: &str = "SELECT GET_LOCK(?, 0)";
        pub const UNLOCK: &str = "SELECT RELEASE_LOCK(?)";
    }

    pub mod sqlite {
        pub const CREATE_TABLE: &str = r#"
            CREATE TABLE IF NOT EXISTS _bootstrap_locks (
                lock_id INTEGER PRIMARY KEY,
                owner TEXT NOT NULL,
                acquired_at INTEGER NOT NULL
            )
            "#;
        pub const RECLAIM_STALE: &str =
            "DELETE FROM _bootstrap_locks WHERE lock_id = ?1 AND acquired_at < ?2";
        pub const TRY_LOCK: &str = "INSERT OR IGNORE INTO _bootstrap_locks (lock_id, owner, acquired_at) VALUES (?1, ?2, ?3)";
        pub const UNLOCK: &str = "DELETE FROM _bootstrap_locks WHERE lock_id = ?1 AND owner = ?2";
    }
}

/// Derive a stable 64-bit lock id from a namespace string.
///
/// Uses the first 8 bytes of SHA-256 so every process and build agrees on the id.
pub fn lock_id_for(namespace: &str) -> i64 {
    let digest = Sha256::digest(namespace.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

/// Outcome of a lock attempt.
#[derive(Debug)]
pub enum LockAttempt {
    /// This instance is the initializer.
    Won(LockHandle),
    /// Another instance holds the lock; the connection is handed back.
    Lost(InitConnection),
}

#[derive(Debug, Clone)]
pub struct LockCoordinator {
    namespace: String,
    lock_id: i64,
    /// Identifies this instance in SQLite lock rows.
    owner: String,
    stale_after: Duration,
}

impl LockCoordinator {
    pub fn new(namespace: impl Into<String>, stale_after: Duration) -> Self {
        let namespace = namespace.into();
        Self {
            lock_id: lock_id_for(&namespace),
            namespace,
            owner: uuid::Uuid::new_v4().to_string(),
            stale_after,
        }
    }

    pub fn lock_id(&self) -> i64 {
        self.lock_id
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn mysql_lock_name(&self) -> String {
        format!("db_init_{:016x}", self.lock_id as u64)
    }

    /// Non-blocking attempt to become the initializer.
    pub async fn try_become_initializer(&self, conn: &mut InitConnection) -> DbResult<bool> {
        let won = match conn {
            InitConnection::Postgres(c) => {
                sqlx::query_scalar::<_, bool>(queries::postgres::TRY_LOCK)
                    .bind(self.lock_id)
                    .fetch_one(&mut *c)
                    .await?
            }
            InitConnection::MySql(c) => {
                let result = sqlx::query_scalar::<_, Option<i64>>(queries::mysql::TRY_LOCK)
                    .bind(self.mysql_lock_name())
                    .fetch_one(&mut *c)
                    .await?;
                match result {
                    Some(flag) => flag == 1,
                    None => return Err(DbError::lock("GET_LOCK returned NULL")),
                }
            }
            InitConnection::SQLite(c) => {
                sqlx::query(queries::sqlite::CREATE_TABLE)
                    .execute(&mut *c)
                    .await?;

                let now = chrono::Utc::now().timestamp();
                let stale_before = now - self.stale_after.as_secs() as i64;
                let reclaimed = sqlx::query(queries::sqlite::RECLAIM_STALE)
                    .bind(self.lock_id)
                    .bind(stale_before)
                    .execute(&mut *c)
                    .await?
                    .rows_affected();
                if reclaimed > 0 {
                    warn!(
                        lock_id = self.lock_id,
                        table = SQLITE_LOCK_TABLE,
                        "Reclaimed stale initialization lock"
                    );
                }

                sqlx::query(queries::sqlite::TRY_LOCK)
                    .bind(self.lock_id)
                    .bind(&self.owner)
                    .bind(now)
                    .execute(&mut *c)
                    .await?
                    .rows_affected()
                    == 1
            }
        };

        debug!(namespace = %self.namespace, lock_id = self.lock_id, won, "Lock attempt");
        Ok(won)
    }

    /// Release a lock taken by [`try_become_initializer`](Self::try_become_initializer)
    /// on the same connection.
    pub async fn release(&self, conn: &mut InitConnection) -> DbResult<()> {
        let released = match conn {
            InitConnection::Postgres(c) => {
                sqlx::query_scalar::<_, bool>(queries::postgres::UNLOCK)
                    .bind(self.lock_id)
                    .fetch_one(&mut *c)
                    .await?
            }
            InitConnection::MySql(c) => {
                sqlx::query_scalar::<_, Option<i64>>(queries::mysql::UNLOCK)
                    .bind(self.mysql_lock_name())
                    .fetch_one(&mut *c)
                    .await?
                    == Some(1)
            }
            InitConnection::SQLite(c) => {
                sqlx::query(queries::sqlite::UNLOCK)
                    .bind(self.lock_id)
                    .bind(&self.owner)
                    .execute(&mut *c)
                    .await?
                    .rows_affected()
                    == 1
            }
        };

        if released {
            debug!(lock_id = self.lock_id, "Lock released");
        } else {
            warn!(lock_id = self.lock_id, "Lock was not held at release time");
        }
        Ok(())
    }

    /// Try to become the initializer, wrapping a win in a scoped [`LockHandle`].
    pub async fn acquire(&self, mut conn: InitConnection) -> DbResult<LockAttempt> {
        if self.try_become_initializer(&mut conn).await? {
            info!(namespace = %self.namespace, "Won initialization lock");
            Ok(LockAttempt::Won(LockHandle {
                lock_id: self.lock_id,
                held: true,
                conn: Some(conn),
                coordinator: self.clone(),
            }))
        } else {
            info!(namespace = %self.namespace, "Another instance is initializing");
            Ok(LockAttempt::Lost(conn))
        }
    }

    /// Poll until every required table exists. Returns `false` on timeout.
    ///
    /// Query errors are logged and polling continues. A lost session (a retryable
    /// error) ends the wait with that error so the caller can reconnect.
    pub async fn wait_for_initializer(
        &self,
        conn: &mut InitConnection,
        schema: &SchemaBootstrapper,
        poll_interval: Duration,
        timeout: Duration,
    ) -> DbResult<bool> {
        let deadline = Instant::now() + timeout;
        let mut polls = 0u32;

        loop {
            polls += 1;
            match schema.schema_exists(conn).await {
                Ok(true) => {
                    info!(polls, "Schema created by another instance");
                    return Ok(true);
                }
                Ok(false) => debug!(polls, "Schema not ready yet"),
                Err(e) if e.is_retryable() => {
                    warn!(polls, error = %e, "Lost connection while waiting for initializer");
                    return Err(e);
                }
                Err(e) => warn!(polls, error = %e, "Schema poll failed"),
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    polls,
                    timeout_ms = timeout.as_millis() as u64,
                    "Timed out waiting for initializer"
                );
                return Ok(false);
            }
            tokio::time::sleep(poll_interval.min(deadline - now)).await;
        }
    }
}

/// A held initialization lock and the connection it lives on.
#[derive(Debug)]
pub struct LockHandle {
    pub lock_id: i64,
    pub held: bool,
    conn: Option<InitConnection>,
    coordinator: LockCoordinator,
}

impl LockHandle {
    /// The connection holding the lock. Schema work must run on it.
    pub fn connection(&mut self) -> DbResult<&mut InitConnection> {
        self.conn
            .as_mut()
            .ok_or_else(|| DbError::internal("lock handle has no connection"))
    }

    /// Release the lock and hand back the connection.
    ///
    /// On a release error the connection is closed instead, which frees
    /// session locks server-side, and the error is returned.
    pub async fn release(mut self) -> DbResult<InitConnection> {
        let mut conn = self
            .conn
            .take()
            .ok_or_else(|| DbError::internal("lock handle has no connection"))?;
        self.held = false;

        match self.coordinator.release(&mut conn).await {
            Ok(()) => Ok(conn),
            Err(e) => {
                warn!(lock_id = self.lock_id, error = %e, "Lock release failed, closing connection");
                conn.close().await;
                Err(e)
            }
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if !self.held {
            return;
        }
        let Some(conn) = self.conn.take() else {
            return;
        };

        warn!(
            lock_id = self.lock_id,
            "Lock handle dropped while held - consider using explicit release()"
        );

        // Closing the session frees session locks.
        if conn.db_type().has_session_locks() {
            drop(conn);
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(
                lock_id = self.lock_id,
                "No runtime to release SQLite lock; it expires after the stale window"
            );
            return;
        };
        let coordinator = self.coordinator.clone();
        handle.spawn(async move {
            let mut conn = conn;
            if let Err(e) = coordinator.release(&mut conn).await {
                warn!(error = %e, "Deferred SQLite lock release failed");
            }
            conn.close().await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolSpec;
    use tempfile::TempDir;

    async fn sqlite_conn(dir: &TempDir) -> InitConnection {
        let dsn = format!("sqlite:{}", dir.path().join("lock.db").display());
        InitConnection::connect(&dsn, &PoolSpec::init(), Duration::from_secs(5))
            .await
            .unwrap()
    }

    #[test]
    fn test_lock_id_is_stable() {
        assert_eq!(lock_id_for("db_init:orders"), lock_id_for("db_init:orders"));
        assert_ne!(lock_id_for("db_init:orders"), lock_id_for("db_init:billing"));
    }

    #[test]
    fn test_lock_id_known_value() {
        // SHA-256("") starts with e3b0c44298fc1c14.
        assert_eq!(lock_id_for(""), 0xe3b0c44298fc1c14_u64 as i64);
    }

    #[tokio::test]
    async fn test_sqlite_lock_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let first = LockCoordinator::new("db_init:test", Duration::from_secs(300));
        let second = LockCoordinator::new("db_init:test", Duration::from_secs(300));

        let mut a = sqlite_conn(&dir).await;
        let mut b = sqlite_conn(&dir).await;

        assert!(first.try_become_initializer(&mut a).await.unwrap());
        assert!(!second.try_become_initializer(&mut b).await.unwrap());

        first.release(&mut a).await.unwrap();
        assert!(second.try_become_initializer(&mut b).await.unwrap());
        second.release(&mut b).await.unwrap();
    }

    #[tokio::test]
    async fn test_release_by_non_owner_is_noop() {
        let dir = TempDir::new().unwrap();
        let owner = LockCoordinator::new("db_init:test", Duration::from_secs(300));
        let other = LockCoordinator::new("db_init:test", Duration::from_secs(300));
        let mut a = sqlite_conn(&dir).await;
        let mut b = sqlite_conn(&dir).await;

        assert!(owner.try_become_initializer(&mut a).await.unwrap());
        other.release(&mut b).await.unwrap();
        assert!(!other.try_become_initializer(&mut b).await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_sqlite_lock_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let crashed = LockCoordinator::new("db_init:test", Duration::from_secs(0));
        let mut a = sqlite_conn(&dir).await;
        assert!(crashed.try_become_initializer(&mut a).await.unwrap());
        drop(a);

        // Any row older than "now" is stale with a zero window.
        tokio::time::sleep(Duration::from_millis(1100)).await;
        let successor = LockCoordinator::new("db_init:test", Duration::from_secs(0));
        let mut b = sqlite_conn(&dir).await;
        assert!(successor.try_become_initializer(&mut b).await.unwrap());
    }

    #[tokio::test]
    async fn test_handle_release_returns_connection() {
        let dir = TempDir::new().unwrap();
        let coordinator = LockCoordinator::new("db_init:test", Duration::from_secs(300));
        let conn = sqlite_conn(&dir).await;

        let LockAttempt::Won(mut handle) = coordinator.acquire(conn).await.unwrap() else {
            panic!("expected to win an uncontended lock");
        };
        assert!(handle.held);
        assert!(handle.connection().is_ok());

        let conn = handle.release().await.unwrap();
        let LockAttempt::Won(handle) = coordinator.acquire(conn).await.unwrap() else {
            panic!("lock should be free after release");
        };
        handle.release().await.unwrap().close().await;
    }

    #[tokio::test]
    async fn test_dropped_handle_releases_sqlite_lock() {
        let dir = TempDir::new().unwrap();
        let coordinator = LockCoordinator::new("db_init:test", Duration::from_secs(300));
        let other = LockCoordinator::new("db_init:test", Duration::from_secs(300));

        let attempt = coordinator.acquire(sqlite_conn(&dir).await).await.unwrap();
        assert!(matches!(attempt, LockAttempt::Won(_)));
        drop(attempt);

        let mut conn = sqlite_conn(&dir).await;
        let mut won = false;
        for _ in 0..50 {
            if other.try_become_initializer(&mut conn).await.unwrap() {
                won = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(won, "deferred release should free the lock");
    }
}
