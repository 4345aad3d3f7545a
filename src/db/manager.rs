//! Database manager: the façade that brings a service to a ready state.
//!
//! # Flow
//!
//! `initialize()` connects (with backoff), contends for the initializer lock, and
//! then either bootstraps the schema (winner) or waits for another instance to do
//! it (waiter). Every step is a [`StateMachine`] transition. Pools are built only
//! after the schema is confirmed.
//!
//! # Single-flight
//!
//! Concurrent `initialize()` calls in one process serialize on an async gate. A
//! caller that waited behind a running attempt returns that attempt's outcome
//! instead of starting another one.
//!
//! # Error boundary
//!
//! No error crosses `initialize()` or `health_check()`. Failures become state
//! transitions: an unreachable database degrades the service, fatal errors end in
//! `Error` and a `false` return.

use crate::config::InitConfig;
use crate::db::lock::{LockAttempt, LockCoordinator, LockHandle};
use crate::db::pool::{DbConnection, DbPool, InitConnection, PoolName, PoolRegistry};
use crate::db::schema::{SchemaBootstrapper, SchemaDefinition};
use crate::db::state_machine::{ObserverError, StateMachine};
use crate::db::supervisor::ConnectionSupervisor;
use crate::error::{DbError, DbResult};
use crate::models::{DbState, HealthReport, InitProgress, masked_dsn};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

mod progress {
    pub const ACQUIRING_LOCK: u8 = 20;
    pub const CHECKING_SCHEMA: u8 = 40;
    pub const MIGRATING: u8 = 60;
    pub const VALIDATING: u8 = 80;
    pub const DONE: u8 = 100;
}

/// How a contention round ended when it did not reach a terminal state.
enum RoundOutcome {
    /// The initializer never confirmed; the connection is still usable.
    TimedOut(InitConnection),
    /// The session died mid-round.
    Lost(DbError),
}

pub struct DatabaseManager {
    config: InitConfig,
    state: StateMachine,
    supervisor: ConnectionSupervisor,
    coordinator: LockCoordinator,
    bootstrapper: SchemaBootstrapper,
    pools: RwLock<Option<PoolRegistry>>,
    /// Serializes attempts within this process.
    init_gate: Mutex<()>,
    /// Completed attempts. Lets a caller that waited on the gate detect that an
    /// attempt finished while it was queued.
    attempts: AtomicU64,
    last_outcome: AtomicBool,
}

impl std::fmt::Debug for DatabaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseManager")
            .field("dsn", &masked_dsn(&self.config.dsn))
            .field("state", &self.state.state())
            .field("lock_namespace", &self.coordinator.namespace())
            .field("attempts", &self.attempts.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl DatabaseManager {
    /// Create a manager. Validates configuration and schema; performs no I/O.
    pub fn new(config: InitConfig, schema: SchemaDefinition) -> DbResult<Self> {
        config.validate()?;
        schema.validate()?;

        let state = StateMachine::new();
        state.register_callback(log_transition);

        Ok(Self {
            supervisor: ConnectionSupervisor::from_config(&config),
            coordinator: LockCoordinator::new(config.lock_namespace(), config.lock_stale_after()),
            bootstrapper: SchemaBootstrapper::new(schema),
            state,
            pools: RwLock::new(None),
            init_gate: Mutex::new(()),
            attempts: AtomicU64::new(0),
            last_outcome: AtomicBool::new(false),
            config,
        })
    }

    /// Bring the database to an operable state.
    ///
    /// Returns `true` for `Ready` and `Degraded`, `false` for `Error`. Idempotent
    /// once operable.
    pub async fn initialize(&self) -> bool {
        let seen = self.attempts.load(Ordering::Acquire);
        let _gate = self.init_gate.lock().await;

        if self.attempts.load(Ordering::Acquire) != seen {
            let outcome = self.last_outcome.load(Ordering::Acquire);
            debug!(outcome, "Joined in-flight initialization");
            return outcome;
        }

        let state = self.state.state();
        if state.is_operable() {
            debug!(state = %state, "Already initialized");
            return true;
        }
        if state.is_initializing() {
            // Holding the gate means no attempt is running: the last one was cancelled.
            warn!(state = %state, "Previous initialization was interrupted");
            let interrupted = DbError::internal("initialization attempt was cancelled");
            self.state.set_error(&interrupted);
            let percent = self.state.snapshot().percent;
            if let Err(e) = self
                .state
                .transition_to(DbState::Error, percent, "Initialization interrupted")
            {
                error!(error = %e, "Could not record interrupted attempt");
            }
        }

        let outcome = self.run_attempt().await;
        self.last_outcome.store(outcome, Ordering::Release);
        self.attempts.fetch_add(1, Ordering::AcqRel);
        outcome
    }

    /// Close pools, reset to `Uninitialized`, and initialize again.
    pub async fn reinitialize(&self) -> bool {
        {
            let _gate = self.init_gate.lock().await;
            self.close_pools().await;
            self.state.reset();
            info!("Reinitializing database");
        }
        self.initialize().await
    }

    async fn run_attempt(&self) -> bool {
        info!(
            dsn = %masked_dsn(&self.config.dsn),
            namespace = %self.coordinator.namespace(),
            "Initializing database"
        );
        match self.try_initialize().await {
            Ok(()) => {
                let state = self.state.state();
                info!(
                    state = %state,
                    elapsed_ms = self.state.snapshot().elapsed().num_milliseconds(),
                    "Initialization finished"
                );
                state.is_operable()
            }
            Err(e) => {
                error!(error = %e, "Database initialization failed");
                self.state.set_error(&e);
                let percent = self.state.snapshot().percent;
                if let Err(te) =
                    self.state
                        .transition_to(DbState::Error, percent, format!("Initialization failed: {e}"))
                {
                    error!(error = %te, "Could not record initialization failure");
                }
                false
            }
        }
    }

    async fn try_initialize(&self) -> DbResult<()> {
        self.state.begin_attempt("Connecting to database")?;

        let conn = match self.supervisor.connect_with_retry(&self.config.dsn).await {
            Ok(conn) => conn,
            Err(e @ DbError::RetriesExhausted { .. }) => {
                warn!(error = %e, "Database unreachable, continuing in degraded mode");
                self.degrade(&e, "Database unreachable; running without persistence")?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        self.state.transition_to(
            DbState::AcquiringLock,
            progress::ACQUIRING_LOCK,
            "Acquiring initialization lock",
        )?;
        self.contend(conn).await
    }

    /// Alternate between lock contention and waiting, bounded by `max_role_retries`.
    ///
    /// A waiter that times out contends again on the same connection. A lost
    /// session is closed and replaced through the supervisor before the next round.
    async fn contend(&self, mut conn: InitConnection) -> DbResult<()> {
        let max_role_retries = self.config.max_role_retries;
        let mut role_retries = 0;

        loop {
            let outcome = match self.coordinator.acquire(conn).await {
                Ok(LockAttempt::Won(handle)) => return self.run_as_initializer(handle).await,
                Ok(LockAttempt::Lost(mut waiting)) => {
                    self.state.transition_to(
                        DbState::AcquiringLock,
                        progress::ACQUIRING_LOCK,
                        "Waiting for another instance to initialize the schema",
                    )?;

                    let waited = self
                        .coordinator
                        .wait_for_initializer(
                            &mut waiting,
                            &self.bootstrapper,
                            self.config.waiter_poll_interval(),
                            self.config.waiter_timeout(),
                        )
                        .await;
                    match waited {
                        Ok(true) => return self.run_as_waiter(waiting).await,
                        Ok(false) => RoundOutcome::TimedOut(waiting),
                        Err(e) => {
                            waiting.close().await;
                            if !e.is_retryable() {
                                return Err(e);
                            }
                            RoundOutcome::Lost(e)
                        }
                    }
                }
                Err(e) if e.is_retryable() => RoundOutcome::Lost(e),
                Err(e) => return Err(e),
            };

            if role_retries >= max_role_retries {
                let cause = match outcome {
                    RoundOutcome::TimedOut(waiting) => {
                        waiting.close().await;
                        DbError::waiter_timeout(self.config.waiter_timeout())
                    }
                    RoundOutcome::Lost(e) => e,
                };
                warn!(role_retries, error = %cause, "Initialization never confirmed, degrading");
                return self.degrade(
                    &cause,
                    "Schema not initialized by any instance; running without persistence",
                );
            }
            role_retries += 1;

            conn = match outcome {
                RoundOutcome::TimedOut(waiting) => {
                    warn!(role_retries, max_role_retries, "Initializer timed out, contending again");
                    waiting
                }
                RoundOutcome::Lost(e) => {
                    warn!(role_retries, max_role_retries, error = %e, "Init connection lost, reconnecting");
                    match self.supervisor.connect_with_retry(&self.config.dsn).await {
                        Ok(conn) => conn,
                        Err(e @ DbError::RetriesExhausted { .. }) => {
                            warn!(error = %e, "Database unreachable after losing the session, degrading");
                            return self.degrade(&e, "Database unreachable; running without persistence");
                        }
                        Err(e) => return Err(e),
                    }
                }
            };

            self.state.transition_to(
                DbState::AcquiringLock,
                progress::ACQUIRING_LOCK,
                format!("Contending for lock again ({role_retries}/{max_role_retries})"),
            )?;
        }
    }

    async fn run_as_initializer(&self, mut handle: LockHandle) -> DbResult<()> {
        let result = match handle.connection() {
            Ok(conn) => self.bootstrap_schema(conn).await,
            Err(e) => Err(e),
        };

        // Release on every path, before anything else can fail.
        match handle.release().await {
            Ok(conn) => conn.close().await,
            Err(e) => warn!(error = %e, "Lock release failed; session closed instead"),
        }

        result?;
        self.build_pools().await
    }

    async fn bootstrap_schema(&self, conn: &mut InitConnection) -> DbResult<()> {
        self.state.transition_to(
            DbState::CheckingSchema,
            progress::CHECKING_SCHEMA,
            "Checking schema",
        )?;
        if self.bootstrapper.schema_exists(conn).await? {
            info!("Schema already present, skipping bootstrap");
            return Ok(());
        }

        self.state
            .transition_to(DbState::Migrating, progress::MIGRATING, "Applying schema")?;
        self.bootstrapper.bootstrap(conn).await?;

        self.state
            .transition_to(DbState::Validating, progress::VALIDATING, "Validating schema")?;
        let missing = self.bootstrapper.validate(conn).await?;
        if !missing.is_empty() {
            return Err(DbError::validation(missing));
        }
        Ok(())
    }

    async fn run_as_waiter(&self, mut conn: InitConnection) -> DbResult<()> {
        self.state.transition_to(
            DbState::Validating,
            progress::VALIDATING,
            "Validating schema created by another instance",
        )?;
        let missing = self.bootstrapper.validate(&mut conn).await;
        conn.close().await;

        let missing = missing?;
        if !missing.is_empty() {
            return Err(DbError::validation(missing));
        }
        self.build_pools().await
    }

    async fn build_pools(&self) -> DbResult<()> {
        match PoolRegistry::build(&self.config.dsn, &self.config.pools).await {
            Ok(registry) => {
                *self.pools.write().await = Some(registry);
                self.state
                    .transition_to(DbState::Ready, progress::DONE, "Database ready")?;
                Ok(())
            }
            Err(e) if e.is_retryable() => {
                warn!(error = %e, "Pool creation failed after bootstrap, degrading");
                self.degrade(&e, "Could not build connection pools; running without persistence")
            }
            Err(e) => Err(e),
        }
    }

    fn degrade(&self, cause: &DbError, message: &str) -> DbResult<()> {
        self.state.set_error(cause);
        self.state
            .transition_to(DbState::Degraded, progress::DONE, message)?;
        Ok(())
    }

    /// Readiness payload derived from the current state.
    ///
    /// Runs at most one liveness query, only when ready.
    pub async fn health_check(&self) -> HealthReport {
        let snapshot = self.state.snapshot();
        let mut report = HealthReport::from_progress(&snapshot);
        if snapshot.state != DbState::Ready {
            return report;
        }

        let registry = self.pools.read().await.clone();
        let Some(registry) = registry else {
            report.healthy = false;
            report.error = Some("pools not built".to_string());
            return report;
        };

        let app = registry.app();
        report.pool_size = Some(app.size());
        report.pool_available = Some(app.num_idle());
        if let Err(e) = app.ping().await {
            warn!(error = %e, "Liveness query failed");
            report.healthy = false;
            report.error = Some(e.to_string());
        }
        report
    }

    /// Check out a connection from the named pool.
    pub async fn get_connection(&self, pool: PoolName) -> DbResult<DbConnection> {
        self.pool(pool).await?.acquire().await
    }

    /// The named pool itself, for callers that manage checkout themselves.
    pub async fn pool(&self, name: PoolName) -> DbResult<DbPool> {
        let state = self.state.state();
        if state != DbState::Ready {
            return Err(DbError::not_ready(state));
        }
        let pools = self.pools.read().await;
        let registry = pools.as_ref().ok_or_else(|| DbError::not_ready(state))?;
        Ok(registry.get(name)?.clone())
    }

    /// Ready or degraded.
    pub fn is_ready(&self) -> bool {
        self.state.state().is_operable()
    }

    pub fn is_degraded(&self) -> bool {
        self.state.state() == DbState::Degraded
    }

    pub fn is_initializing(&self) -> bool {
        self.state.is_initializing()
    }

    pub fn state(&self) -> DbState {
        self.state.state()
    }

    pub fn progress(&self) -> InitProgress {
        self.state.snapshot()
    }

    /// Every transition recorded since construction or the last reinitialize.
    pub fn history(&self) -> Vec<InitProgress> {
        self.state.history()
    }

    pub fn register_callback<F>(&self, observer: F)
    where
        F: Fn(DbState, DbState, &InitProgress) -> Result<(), ObserverError>
            + Send
            + Sync
            + 'static,
    {
        self.state.register_callback(observer);
    }

    /// Successful schema bootstraps performed by this instance.
    pub fn bootstrap_runs(&self) -> usize {
        self.bootstrapper.runs()
    }

    /// Backoff delays slept during the last connection attempt.
    pub fn last_backoff_delays(&self) -> Vec<Duration> {
        self.supervisor.last_delays()
    }

    pub fn lock_id(&self) -> i64 {
        self.coordinator.lock_id()
    }

    pub fn config(&self) -> &InitConfig {
        &self.config
    }

    /// Close all pools. State is left as is.
    pub async fn close(&self) {
        self.close_pools().await;
    }

    async fn close_pools(&self) {
        if let Some(registry) = self.pools.write().await.take() {
            registry.close_all().await;
        }
    }
}

fn log_transition(old: DbState, new: DbState, progress: &InitProgress) -> Result<(), ObserverError> {
    info!(
        from = %old,
        to = %new,
        percent = progress.percent,
        message = %progress.message,
        "Database state changed"
    );
    Ok(())
}
