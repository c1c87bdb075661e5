//! Worker primitive module.
//!
//! A worker is a named, stoppable activity with a terminal error. Every
//! supervised task in the agent - runner children, engine manifolds, the
//! singular flag, per-model sub-trees - is expressed as a [`WorkerHandle`]:
//! a spawned task paired with a cancellation token that delivers stop
//! requests.

use std::future::Future;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Result type returned by every worker when it terminates.
pub type WorkerResult = Result<(), WorkerError>;

/// A lifecycle intent raised by a worker to request a host-level action.
///
/// Intents are sentinel values recognized by the top-level wait: they are
/// distinct from ordinary failures and are pattern-matched into uninstall,
/// reboot, or shutdown handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    /// The agent should stop and, if the uninstall marker is present,
    /// remove itself from the host.
    Terminate,
    /// The host should be rebooted once in-flight work has settled.
    Reboot,
    /// The host should be shut down once in-flight work has settled.
    Shutdown,
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Terminate => write!(f, "terminate agent"),
            Self::Reboot => write!(f, "reboot machine"),
            Self::Shutdown => write!(f, "shutdown machine"),
        }
    }
}

/// Terminal errors a worker can report.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerError {
    /// A lifecycle intent; fatal to every runner up to the agent loop.
    #[error("lifecycle intent: {0}")]
    Intent(Intent),

    /// The worker asks to be restarted immediately, bypassing the
    /// runner's restart delay.
    #[error("worker requested immediate restart")]
    RestartRequested,

    /// A dependency is not (or no longer) available. Engine-internal:
    /// converted into a clean bounce and never propagated further up.
    #[error("dependency not met")]
    Unmet,

    /// The worker's configuration is unusable.
    #[error("configuration error: {0}")]
    Config(String),

    /// A connection the worker relies on was lost.
    #[error("connection lost: {0}")]
    Disconnected(String),

    /// Any other failure.
    #[error("{0}")]
    Failed(String),
}

impl WorkerError {
    /// Returns the lifecycle intent carried by this error, if any.
    #[must_use]
    pub const fn intent(&self) -> Option<Intent> {
        match self {
            Self::Intent(intent) => Some(*intent),
            _ => None,
        }
    }

    /// Returns `true` if this error carries a lifecycle intent.
    #[must_use]
    pub const fn is_intent(&self) -> bool {
        matches!(self, Self::Intent(_))
    }

    /// Total importance order over worker errors. Runners keep the most
    /// important error seen among exited children as their own terminal
    /// error.
    #[must_use]
    pub const fn importance(&self) -> u8 {
        match self {
            Self::Intent(Intent::Terminate) => 100,
            Self::Intent(Intent::Reboot | Intent::Shutdown) => 90,
            Self::Disconnected(_) => 40,
            Self::Config(_) => 30,
            Self::Failed(_) => 20,
            Self::RestartRequested => 10,
            Self::Unmet => 0,
        }
    }
}

/// Returns `true` when `candidate` is strictly more important than
/// `current`. The default importance comparator for runners.
#[must_use]
pub fn more_important(candidate: &WorkerError, current: &WorkerError) -> bool {
    candidate.importance() > current.importance()
}

/// Handle to a running worker.
///
/// The handle owns the task: `stop` is an idempotent hint, and the
/// terminal error is observed exactly once, by whoever consumes the
/// handle through [`wait`](Self::wait).
#[derive(Debug)]
pub struct WorkerHandle {
    stop: CancellationToken,
    join: JoinHandle<WorkerResult>,
}

impl WorkerHandle {
    /// Spawn a new worker task. The closure receives the worker's stop
    /// token; every blocking operation inside it must be selectable
    /// against `stop.cancelled()`.
    pub fn spawn<F, Fut>(f: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = WorkerResult> + Send + 'static,
    {
        let stop = CancellationToken::new();
        let join = tokio::spawn(f(stop.clone()));
        Self { stop, join }
    }

    /// Assemble a handle from an existing stop token and task.
    #[must_use]
    pub const fn from_parts(stop: CancellationToken, join: JoinHandle<WorkerResult>) -> Self {
        Self { stop, join }
    }

    /// A worker that does nothing until asked to stop. Used by value
    /// manifolds whose only job is to publish a resource.
    #[must_use]
    pub fn idle() -> Self {
        Self::spawn(|stop| async move {
            stop.cancelled().await;
            Ok(())
        })
    }

    /// Request the worker to stop. A hint, not a guarantee of immediate
    /// exit; further requests after termination are no-ops.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// A clone of the worker's stop token.
    #[must_use]
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Split the handle into its stop token and task.
    #[must_use]
    pub fn into_parts(self) -> (CancellationToken, JoinHandle<WorkerResult>) {
        (self.stop, self.join)
    }

    /// Block until the worker has terminated and return its terminal
    /// error. A panicked task surfaces as [`WorkerError::Failed`].
    pub async fn wait(self) -> WorkerResult {
        join_result(self.join.await)
    }

    /// Wait for the worker, relaying an external stop request to it. When
    /// `external` fires first the worker is asked to stop and its actual
    /// terminal error is still awaited and returned.
    pub async fn wait_or_stop(self, external: &CancellationToken) -> WorkerResult {
        let token = self.stop_token();
        let mut wait = std::pin::pin!(self.wait());
        tokio::select! {
            result = &mut wait => result,
            () = external.cancelled() => {
                token.cancel();
                wait.await
            }
        }
    }
}

/// Fold a join outcome into a worker result. Cancellation of the
/// underlying task (which fleetd itself never does) reads as a clean exit.
pub(crate) fn join_result(joined: Result<WorkerResult, tokio::task::JoinError>) -> WorkerResult {
    match joined {
        Ok(result) => result,
        Err(err) if err.is_cancelled() => Ok(()),
        Err(err) => Err(WorkerError::Failed(format!("worker task panicked: {err}"))),
    }
}
