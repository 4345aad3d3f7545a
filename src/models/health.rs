//! Health/readiness payload consumed by startup sequencing and health endpoints.

use crate::models::{DbState, InitProgress};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub state: DbState,
    /// True once the service is operable (ready or degraded).
    pub initialized: bool,
    pub degraded: bool,
    pub progress: u8,
    pub message: String,
    pub error: Option<String>,
    /// Size of the app pool. None unless pools are built.
    pub pool_size: Option<u32>,
    /// Idle connections in the app pool. None unless pools are built.
    pub pool_available: Option<usize>,
}

impl HealthReport {
    /// Build a report from a progress snapshot without pool information.
    pub fn from_progress(progress: &InitProgress) -> Self {
        Self {
            healthy: progress.state.is_operable(),
            state: progress.state,
            initialized: progress.state.is_operable(),
            degraded: progress.state == DbState::Degraded,
            progress: progress.percent,
            message: progress.message.clone(),
            error: progress.error.clone(),
            pool_size: None,
            pool_available: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degraded_report_is_healthy() {
        let mut progress = InitProgress::new();
        progress.state = DbState::Degraded;
        progress.percent = 100;

        let report = HealthReport::from_progress(&progress);
        assert!(report.healthy);
        assert!(report.degraded);
        assert!(report.initialized);
        assert!(report.pool_size.is_none());
    }

    #[test]
    fn test_report_serializes_all_fields() {
        let report = HealthReport::from_progress(&InitProgress::new());
        let json = serde_json::to_value(&report).unwrap();
        for key in [
            "healthy",
            "state",
            "initialized",
            "degraded",
            "progress",
            "message",
            "error",
            "pool_size",
            "pool_available",
        ] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
        assert_eq!(json["state"], "uninitialized");
        assert_eq!(json["healthy"], false);
    }
}
