//! Structured observability hooks for promotion lifecycle events.
//!
//! This module provides:
//! - Version-scoped tracing spans via the `VersionSpan` RAII guard
//! - Emission functions for the daemon-level events the orchestrator does
//!   not log itself: validation verdicts, worker exits, resume planning
//!
//! Events are emitted at `info!` level and respect `RUST_LOG` filtering.
//! For JSON output, set `DRYDOCK_LOG_FORMAT=json`.

use tracing::info;

use drydock_state::VersionKey;

/// RAII guard that enters a version-scoped tracing span.
///
/// # Example
///
/// ```ignore
/// let _span = VersionSpan::enter(&key);
/// // All tracing calls below carry key = "vision-ranker@2.1.0"
/// ```
pub struct VersionSpan {
    _span: tracing::span::EnteredSpan,
}

impl VersionSpan {
    /// Create and enter a span tagged with the version key.
    pub fn enter(key: &VersionKey) -> Self {
        let span = tracing::info_span!("drydock.version", key = %key);
        Self {
            _span: span.entered(),
        }
    }
}

/// Emit event: the validation gate finished judging a version.
pub fn emit_validation_evaluated(key: &VersionKey, passed: bool, checks_failed: usize) {
    info!(
        event = "validation.evaluated",
        key = %key,
        passed = passed,
        checks_failed = checks_failed,
    );
}

/// Emit event: a canary worker stopped.
pub fn emit_worker_exit(key: &VersionKey, exit: &str) {
    info!(event = "canary.worker_exit", key = %key, exit = %exit);
}

/// Emit event: the daemon planned its restart recovery.
pub fn emit_resume_planned(in_flight: usize) {
    info!(event = "daemon.resume_planned", in_flight = in_flight);
}

/// Emit event: the daemon finished wiring and is serving.
pub fn emit_daemon_ready(backend: &str) {
    info!(event = "daemon.ready", backend = %backend);
}

/// Emit event: the background sweep expired unanswered approvals.
pub fn emit_sweep_expired(count: usize) {
    info!(event = "approvals.swept", expired = count);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_span_create() {
        // Just ensure VersionSpan::enter doesn't panic
        let key = VersionKey::new("vision-ranker", "2.1.0");
        let _span = VersionSpan::enter(&key);
        emit_validation_evaluated(&key, true, 0);
        emit_worker_exit(&key, "promoted");
    }
}
