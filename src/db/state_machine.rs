//! Initialization state machine.
//!
//! Holds the current `InitProgress`, records every transition, and notifies
//! observers. Pure in-memory; no I/O. Observers exist for health reporting and
//! logging only. Their failures are logged and never reach the caller.

use crate::error::{DbError, DbResult};
use crate::models::{DbState, InitProgress};
use chrono::Utc;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Mutex, RwLock};
use tracing::warn;

pub type ObserverError = Box<dyn std::error::Error + Send + Sync>;

/// Called with (old state, new state, snapshot after the transition).
pub type StateObserver =
    Box<dyn Fn(DbState, DbState, &InitProgress) -> Result<(), ObserverError> + Send + Sync>;

#[derive(Debug)]
struct Inner {
    progress: InitProgress,
    history: Vec<InitProgress>,
}

pub struct StateMachine {
    inner: Mutex<Inner>,
    observers: RwLock<Vec<StateObserver>>,
}

impl std::fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachine")
            .field("state", &self.state())
            .field(
                "observers",
                &self.observers.read().map(|o| o.len()).unwrap_or_default(),
            )
            .finish()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        let progress = InitProgress::new();
        Self {
            inner: Mutex::new(Inner {
                history: vec![progress.clone()],
                progress,
            }),
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Register an observer. Observers run in registration order.
    pub fn register_callback<F>(&self, observer: F)
    where
        F: Fn(DbState, DbState, &InitProgress) -> Result<(), ObserverError>
            + Send
            + Sync
            + 'static,
    {
        if let Ok(mut observers) = self.observers.write() {
            observers.push(Box::new(observer));
        }
    }

    /// Move to `state`, recording a snapshot and notifying observers.
    ///
    /// Percent never decreases within an attempt, except on `Error`.
    /// `completed_at` is set when entering a terminal state.
    pub fn transition_to(
        &self,
        state: DbState,
        percent: u8,
        message: impl Into<String>,
    ) -> DbResult<InitProgress> {
        let (old, snapshot) = {
            let mut inner = self.lock_inner()?;
            let old = inner.progress.state;
            if !old.can_transition_to(state) {
                return Err(DbError::invalid_transition(old, state));
            }

            let progress = &mut inner.progress;
            progress.state = state;
            progress.percent = if state == DbState::Error {
                percent.min(100)
            } else {
                percent.max(progress.percent).min(100)
            };
            progress.message = message.into();
            if state.is_terminal() {
                progress.completed_at = Some(Utc::now());
            }

            let snapshot = progress.clone();
            inner.history.push(snapshot.clone());
            (old, snapshot)
        };

        self.notify(old, &snapshot);
        Ok(snapshot)
    }

    /// Start a new attempt: reset timing, percent and error, then enter `Connecting`.
    ///
    /// Only accepted from `Uninitialized` or a terminal state.
    pub fn begin_attempt(&self, message: impl Into<String>) -> DbResult<InitProgress> {
        let (old, snapshot) = {
            let mut inner = self.lock_inner()?;
            let old = inner.progress.state;
            if !old.accepts_fresh_start() {
                return Err(DbError::invalid_transition(old, DbState::Connecting));
            }

            inner.progress = InitProgress {
                state: DbState::Connecting,
                percent: 5,
                message: message.into(),
                error: None,
                started_at: Utc::now(),
                completed_at: None,
            };
            let snapshot = inner.progress.clone();
            inner.history.push(snapshot.clone());
            (old, snapshot)
        };

        self.notify(old, &snapshot);
        Ok(snapshot)
    }

    /// Attach an error to the current progress without transitioning.
    pub fn set_error(&self, error: &DbError) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.progress.error = Some(error.to_string());
        }
    }

    /// Return to `Uninitialized` and clear history. Observers are not notified.
    pub fn reset(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            let progress = InitProgress::new();
            inner.history = vec![progress.clone()];
            inner.progress = progress;
        }
    }

    pub fn snapshot(&self) -> InitProgress {
        self.inner
            .lock()
            .map(|inner| inner.progress.clone())
            .unwrap_or_default()
    }

    pub fn state(&self) -> DbState {
        self.inner
            .lock()
            .map(|inner| inner.progress.state)
            .unwrap_or(DbState::Error)
    }

    /// Every snapshot recorded since construction or the last reset.
    pub fn history(&self) -> Vec<InitProgress> {
        self.inner
            .lock()
            .map(|inner| inner.history.clone())
            .unwrap_or_default()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == DbState::Ready
    }

    pub fn is_initializing(&self) -> bool {
        self.state().is_initializing()
    }

    fn lock_inner(&self) -> DbResult<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| DbError::internal("state machine lock poisoned"))
    }

    fn notify(&self, old: DbState, snapshot: &InitProgress) {
        let Ok(observers) = self.observers.read() else {
            warn!("State observers lock poisoned, skipping notification");
            return;
        };
        for (index, observer) in observers.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| observer(old, snapshot.state, snapshot))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(observer = index, error = %e, "State observer failed"),
                Err(_) => warn!(observer = index, "State observer panicked"),
            }
        }
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}
