//! Initialization state and progress models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Phase of database initialization.
///
/// Progression is forward-only. `Error` and `Degraded` are reachable from any
/// non-terminal state. `Ready` and `Degraded` are both operable terminals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DbState {
    Uninitialized,
    Connecting,
    AcquiringLock,
    CheckingSchema,
    Migrating,
    Validating,
    Ready,
    Degraded,
    Error,
}

impl DbState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Connecting => "connecting",
            Self::AcquiringLock => "acquiring_lock",
            Self::CheckingSchema => "checking_schema",
            Self::Migrating => "migrating",
            Self::Validating => "validating",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
            Self::Error => "error",
        }
    }

    /// Position along the happy path. Terminal failure states share the top rank.
    fn rank(&self) -> u8 {
        match self {
            Self::Uninitialized => 0,
            Self::Connecting => 1,
            Self::AcquiringLock => 2,
            Self::CheckingSchema => 3,
            Self::Migrating => 4,
            Self::Validating => 5,
            Self::Ready | Self::Degraded | Self::Error => 6,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready | Self::Degraded | Self::Error)
    }

    /// Ready or degraded: the service can run, with or without persistence.
    pub fn is_operable(&self) -> bool {
        matches!(self, Self::Ready | Self::Degraded)
    }

    /// An attempt is in flight.
    pub fn is_initializing(&self) -> bool {
        !matches!(
            self,
            Self::Uninitialized | Self::Ready | Self::Degraded | Self::Error
        )
    }

    /// States from which `initialize()` may begin a new attempt.
    pub fn accepts_fresh_start(&self) -> bool {
        !self.is_initializing()
    }

    /// Whether moving from `self` to `next` respects forward-only progression.
    ///
    /// Re-entering the same in-flight state is allowed (waiters retrying the lock).
    /// Leaving a terminal state requires starting a new attempt.
    pub fn can_transition_to(&self, next: DbState) -> bool {
        if self.is_terminal() {
            return false;
        }
        if *self == DbState::Uninitialized {
            return matches!(next, DbState::Connecting | DbState::Error);
        }
        if matches!(next, DbState::Error | DbState::Degraded) {
            return true;
        }
        next == *self || next.rank() > self.rank()
    }
}

impl std::fmt::Display for DbState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of initialization progress.
#[derive(Debug, Clone, Serialize)]
pub struct InitProgress {
    pub state: DbState,
    /// 0-100, non-decreasing within an attempt unless the attempt errors.
    pub percent: u8,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl InitProgress {
    pub fn new() -> Self {
        Self {
            state: DbState::Uninitialized,
            percent: 0,
            message: "Not initialized".to_string(),
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Wall time of the attempt so far, or in total once it completed.
    pub fn elapsed(&self) -> chrono::Duration {
        self.completed_at
            .unwrap_or_else(Utc::now)
            .signed_duration_since(self.started_at)
    }
}

impl Default for InitProgress {
    fn default() -> Self {
        Self::new()
    }
}
