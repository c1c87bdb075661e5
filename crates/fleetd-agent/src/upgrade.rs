//! Upgrade gating.
//!
//! Two gates throttle the agent across upgrade windows. The upgrader
//! worker opens the initial-upgrade-check gate once it has confirmed no
//! binary upgrade is immediately pending; the upgrade-steps worker runs
//! every step between the previously recorded version and the current
//! one, persists the new version, and opens the upgrade-complete gate.
//! Workers that must not run during an upgrade are started through
//! [`start_after_upgrade`], which waits on both gates while still
//! honoring stop requests.

use std::sync::Arc;

use fleetd_core::runner::{self, RunnerControl, RunnerError, WorkerFactory};
use fleetd_core::worker::{WorkerError, WorkerHandle};
use tracing::{debug, info};

use crate::agent::{AGENT_VERSION, AgentState};
use crate::collaborators::{Collaborators, ControlPlane};

/// Factory for the upgrader worker: checks for a pending binary upgrade
/// and opens the initial-check gate when there is none.
pub(crate) fn upgrader_factory(
    state: Arc<AgentState>,
    conn: Arc<dyn ControlPlane>,
) -> WorkerFactory {
    runner::factory(move || {
        let state = state.clone();
        let conn = conn.clone();
        async move {
            Ok(WorkerHandle::spawn(move |stop| async move {
                let pending = tokio::select! {
                    () = stop.cancelled() => return Ok(()),
                    pending = conn.pending_binary_upgrade() => pending?,
                };
                if pending {
                    info!("binary upgrade pending; holding the initial upgrade check gate");
                } else {
                    debug!("no binary upgrade pending");
                    state.initial_upgrade_check().open();
                }
                stop.cancelled().await;
                Ok(())
            }))
        }
    })
}

/// Factory for the upgrade-steps worker: runs the steps from the
/// previously recorded version to the current one, persists the new
/// version, and opens the upgrade-complete gate.
pub(crate) fn upgrade_steps_factory(state: Arc<AgentState>, deps: Collaborators) -> WorkerFactory {
    runner::factory(move || {
        let state = state.clone();
        let deps = deps.clone();
        async move {
            Ok(WorkerHandle::spawn(move |stop| async move {
                if !state.upgrade_complete().is_open() {
                    let config = state.current_config();
                    let previous = config.upgraded_to_version.clone();
                    if previous.as_deref() == Some(AGENT_VERSION) {
                        debug!(version = AGENT_VERSION, "no upgrade steps to run");
                    } else {
                        let run = tokio::select! {
                            () = stop.cancelled() => return Ok(()),
                            run = deps.upgrades.run(previous.as_deref(), AGENT_VERSION) => run,
                        };
                        // A failed run leaves the gate shut; the parent
                        // runner restarts this worker to retry.
                        run?;
                        let mut config = state.current_config();
                        config.upgraded_to_version = Some(AGENT_VERSION.to_string());
                        deps.config_io
                            .write(&config)
                            .map_err(|err| WorkerError::Config(err.to_string()))?;
                        state.set_config(config);
                        info!(
                            from = previous.as_deref().unwrap_or("none"),
                            to = AGENT_VERSION,
                            "upgrade steps complete",
                        );
                    }
                    state.upgrade_complete().open();
                }
                stop.cancelled().await;
                Ok(())
            }))
        }
    })
}

/// Start `inner` on the runner, delayed until both upgrade gates are
/// open. The wrapper keeps honoring stop requests during the wait, and
/// never invokes the inner factory if stopped first.
///
/// # Errors
///
/// Returns [`RunnerError::Stopping`] if the runner is shutting down.
pub fn start_after_upgrade(
    state: &Arc<AgentState>,
    control: &RunnerControl,
    name: &str,
    inner: WorkerFactory,
) -> Result<(), RunnerError> {
    let state = state.clone();
    let worker_name = name.to_string();
    let wrapped = runner::factory(move || {
        let state = state.clone();
        let inner = inner.clone();
        let worker_name = worker_name.clone();
        async move {
            Ok(WorkerHandle::spawn(move |stop| async move {
                for gate in [
                    state.upgrade_complete().clone(),
                    state.initial_upgrade_check().clone(),
                ] {
                    tokio::select! {
                        () = stop.cancelled() => return Ok(()),
                        () = gate.opened() => {}
                    }
                }
                debug!(worker = %worker_name, "upgrades done; starting worker");
                let handle = inner().await?;
                handle.wait_or_stop(&stop).await
            }))
        }
    });
    control.start_worker(name, wrapped)
}
