//! Restore mode.
//!
//! While a backup is being restored, the agent restricts client
//! admission. The mode is a small state machine - idle, preparing,
//! running - driven by the restore-info watcher on controller hosts:
//! a pending restore prepares the agent, an in-progress restore locks it
//! down, and a failed restore releases it (a successful one restarts the
//! agent, so no transition is needed).

use std::sync::Arc;

use fleetd_core::runner::{self, WorkerFactory};
use fleetd_core::watcher::Watcher;
use fleetd_core::worker::{WorkerError, WorkerHandle};
use tracing::{info, warn};

use crate::agent::AgentState;

/// Restore status as reported by the restore-info watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreStatus {
    /// A restore has been requested.
    Pending,
    /// The restore is being applied.
    InProgress,
    /// The restore failed; normal service resumes.
    Failed,
}

/// The agent-wide restore phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestorePhase {
    /// No restore activity.
    #[default]
    Idle,
    /// A restore is about to begin; writes are fenced off.
    Preparing,
    /// The restore is running; only the local agent may connect.
    Running,
}

/// Errors from restore-phase transitions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RestoreError {
    /// Prepare was requested while already in restore mode.
    #[error("already in restore mode")]
    AlreadyInRestoreMode,

    /// Begin was requested without a preceding prepare.
    #[error("not in restore mode, cannot begin restoration")]
    NotPreparing,

    /// Begin was requested twice.
    #[error("already restoring")]
    AlreadyRunning,
}

/// The restore-phase state machine: `idle -> preparing -> running ->
/// idle`.
#[derive(Debug, Default)]
pub struct RestoreMode {
    phase: RestorePhase,
}

impl RestoreMode {
    /// The current phase.
    #[must_use]
    pub const fn phase(&self) -> RestorePhase {
        self.phase
    }

    /// Move from idle to preparing.
    ///
    /// # Errors
    ///
    /// Returns an error unless the mode is idle.
    pub fn prepare(&mut self) -> Result<(), RestoreError> {
        match self.phase {
            RestorePhase::Idle => {
                self.phase = RestorePhase::Preparing;
                Ok(())
            }
            RestorePhase::Preparing | RestorePhase::Running => {
                Err(RestoreError::AlreadyInRestoreMode)
            }
        }
    }

    /// Move from preparing to running.
    ///
    /// # Errors
    ///
    /// Returns an error unless the mode is preparing.
    pub fn begin(&mut self) -> Result<(), RestoreError> {
        match self.phase {
            RestorePhase::Preparing => {
                self.phase = RestorePhase::Running;
                Ok(())
            }
            RestorePhase::Idle => Err(RestoreError::NotPreparing),
            RestorePhase::Running => Err(RestoreError::AlreadyRunning),
        }
    }

    /// Return to idle from any phase.
    pub fn end(&mut self) {
        self.phase = RestorePhase::Idle;
    }
}

/// Factory for the restore watcher worker: applies restore statuses to
/// the agent state as they arrive.
pub(crate) fn watcher_factory<W>(state: Arc<AgentState>, watch: W) -> WorkerFactory
where
    W: Fn() -> Box<dyn Watcher<RestoreStatus>> + Send + Sync + 'static,
{
    runner::factory(move || {
        let state = state.clone();
        let mut watcher = watch();
        std::future::ready(Ok(WorkerHandle::spawn(move |stop| async move {
            loop {
                tokio::select! {
                    () = stop.cancelled() => return Ok(()),
                    status = watcher.next() => {
                        match status {
                            Some(status) => apply_status(&state, status),
                            None => {
                                return Err(WorkerError::Disconnected(
                                    "restore watcher closed".to_string(),
                                ));
                            }
                        }
                    }
                }
            }
        })))
    })
}

fn apply_status(state: &AgentState, status: RestoreStatus) {
    info!(?status, "restore status changed");
    let outcome = match status {
        RestoreStatus::Pending => state.restore_prepare(),
        RestoreStatus::InProgress => state.restore_begin(),
        RestoreStatus::Failed => {
            state.restore_end();
            Ok(())
        }
    };
    if let Err(error) = outcome {
        // Duplicate watcher events are routine; the phase is left as is.
        warn!(%error, "ignoring restore transition");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_transitions() {
        let mut mode = RestoreMode::default();
        assert_eq!(mode.phase(), RestorePhase::Idle);

        mode.prepare().expect("prepare failed");
        assert_eq!(mode.phase(), RestorePhase::Preparing);

        mode.begin().expect("begin failed");
        assert_eq!(mode.phase(), RestorePhase::Running);

        mode.end();
        assert_eq!(mode.phase(), RestorePhase::Idle);
    }

    #[test]
    fn test_invalid_transitions_are_rejected() {
        let mut mode = RestoreMode::default();
        assert_eq!(mode.begin(), Err(RestoreError::NotPreparing));

        mode.prepare().expect("prepare failed");
        assert_eq!(mode.prepare(), Err(RestoreError::AlreadyInRestoreMode));

        mode.begin().expect("begin failed");
        assert_eq!(mode.begin(), Err(RestoreError::AlreadyRunning));
        assert_eq!(mode.prepare(), Err(RestoreError::AlreadyInRestoreMode));
    }

    #[test]
    fn test_end_is_idempotent() {
        let mut mode = RestoreMode::default();
        mode.end();
        assert_eq!(mode.phase(), RestorePhase::Idle);
    }
}
