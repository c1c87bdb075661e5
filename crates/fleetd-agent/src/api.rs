//! The api worker.
//!
//! Dials the control plane, verifies this host's own entity is still
//! wanted, and supervises the workers that need the connection: the
//! upgrader and the upgrade-steps runner. The connection is closed only
//! after every worker using it has terminated; losing it is fatal to the
//! sub-runner so the whole worker bounces and redials.

use std::sync::Arc;
use std::time::Duration;

use fleetd_core::runner::{self, Runner, RunnerConfig, WorkerFactory};
use fleetd_core::worker::{Intent, WorkerError, WorkerHandle};
use tracing::error;

use crate::agent::AgentState;
use crate::collaborators::{Collaborators, ControlPlane};
use crate::{install, upgrade};

/// Factory for the api worker.
pub(crate) fn api_worker_factory(state: Arc<AgentState>, deps: Collaborators) -> WorkerFactory {
    runner::factory(move || {
        let state = state.clone();
        let deps = deps.clone();
        async move {
            let config = state.current_config();
            let conn = deps.dialer.dial(&config).await?;

            match conn.entity_life(state.tag()).await {
                Ok(Some(life)) if !life.is_dead() => {}
                Ok(_) => {
                    // Dead or gone: this host is no longer wanted. A
                    // factory error would only be retried, so the intent
                    // is reported by the worker itself.
                    error!(tag = %state.tag(), "host entity is dead; terminating agent");
                    conn.close().await;
                    install::write_uninstall_marker(&config).map_err(|err| {
                        WorkerError::Failed(format!("cannot write uninstall marker: {err}"))
                    })?;
                    return Ok(WorkerHandle::spawn(|_stop| async {
                        Err(WorkerError::Intent(Intent::Terminate))
                    }));
                }
                Err(err) => {
                    conn.close().await;
                    return Err(err);
                }
            }

            Ok(build_api_worker(state, deps, conn))
        }
    })
}

fn build_api_worker(
    state: Arc<AgentState>,
    deps: Collaborators,
    conn: Arc<dyn ControlPlane>,
) -> WorkerHandle {
    WorkerHandle::spawn(move |stop| async move {
        let mut runner = Runner::new(RunnerConfig::connection_fatal(deps.restart_delay));
        let control = runner.control();

        // The upgrader and the upgrade steps run without waiting for the
        // upgrade gates; everything else in the process does.
        let _ = control.start_worker(
            "upgrader",
            upgrade::upgrader_factory(state.clone(), conn.clone()),
        );
        let _ = control.start_worker(
            "upgrade-steps",
            upgrade::upgrade_steps_factory(state.clone(), deps.clone()),
        );
        let _ = upgrade::start_after_upgrade(
            &state,
            &control,
            "log-forwarder",
            sync_worker_factory(conn.clone(), SyncKind::LogForwarding),
        );
        let _ = upgrade::start_after_upgrade(
            &state,
            &control,
            "key-updater",
            sync_worker_factory(conn.clone(), SyncKind::AuthorizedKeys),
        );

        let kill = runner.stop_token();
        let finished = tokio::select! {
            result = runner.wait() => Some(result),
            () = stop.cancelled() => None,
        };
        let result = match finished {
            Some(result) => result,
            None => {
                kill.cancel();
                runner.wait().await
            }
        };
        conn.close().await;
        result
    })
}

/// How often the facade workers re-sync host-side configuration.
const SYNC_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Clone, Copy)]
enum SyncKind {
    LogForwarding,
    AuthorizedKeys,
}

/// A worker syncing one piece of host configuration through the control
/// plane: one pass immediately, then periodically.
fn sync_worker_factory(conn: Arc<dyn ControlPlane>, kind: SyncKind) -> WorkerFactory {
    runner::factory(move || {
        let conn = conn.clone();
        async move {
            Ok(WorkerHandle::spawn(move |stop| async move {
                loop {
                    match kind {
                        SyncKind::LogForwarding => conn.sync_log_forwarding().await?,
                        SyncKind::AuthorizedKeys => conn.sync_authorized_keys().await?,
                    }
                    tokio::select! {
                        () = stop.cancelled() => return Ok(()),
                        () = tokio::time::sleep(SYNC_INTERVAL) => {}
                    }
                }
            }))
        }
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use fleetd_core::models::Life;
    use fleetd_core::tag::Tag;

    use super::*;
    use crate::testing;

    fn fixture() -> (tempfile::TempDir, Arc<AgentState>, testing::Fakes) {
        let root = tempfile::tempdir().expect("tempdir failed");
        let config = testing::config_in(root.path());
        let fakes = testing::Fakes::new(config.clone());
        (root, Arc::new(AgentState::new(config)), fakes)
    }

    #[tokio::test]
    async fn test_api_worker_runs_upgrade_workers() {
        let (_root, state, fakes) = fixture();
        fakes.plane.set_life(Tag::Host("0".to_string()), Some(Life::Alive));

        let factory = api_worker_factory(state.clone(), fakes.collaborators());
        let handle = factory().await.expect("factory failed");

        // Both gates open once the upgrade workers have run.
        state.upgrade_complete().opened().await;
        state.initial_upgrade_check().opened().await;

        // The facade workers start behind the gates.
        for _ in 0..200 {
            if fakes.plane.log_syncs() > 0 && fakes.plane.key_syncs() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(fakes.plane.log_syncs() > 0);
        assert!(fakes.plane.key_syncs() > 0);

        handle.stop();
        assert_eq!(handle.wait().await, Ok(()));
        assert!(fakes.plane.closes() >= 1);
    }

    #[tokio::test]
    async fn test_dead_host_terminates_agent() {
        let (_root, state, fakes) = fixture();
        fakes.plane.set_life(Tag::Host("0".to_string()), Some(Life::Dead));

        let factory = api_worker_factory(state.clone(), fakes.collaborators());
        let handle = factory().await.expect("factory failed");
        assert_eq!(
            handle.wait().await,
            Err(WorkerError::Intent(Intent::Terminate))
        );
        assert!(state.current_config().uninstall_marker().exists());
    }

    #[tokio::test]
    async fn test_gone_host_terminates_agent() {
        let (_root, state, fakes) = fixture();
        // No entity record at all.
        let factory = api_worker_factory(state.clone(), fakes.collaborators());
        let handle = factory().await.expect("factory failed");
        assert_eq!(
            handle.wait().await,
            Err(WorkerError::Intent(Intent::Terminate))
        );
    }

    #[tokio::test]
    async fn test_dial_failure_surfaces_for_retry() {
        let (_root, state, fakes) = fixture();
        fakes.dialer.set_failing(true);

        let factory = api_worker_factory(state.clone(), fakes.collaborators());
        assert!(matches!(
            factory().await,
            Err(WorkerError::Disconnected(_))
        ));
        assert_eq!(fakes.dialer.dials(), 1);

        // The factory redials on the next invocation.
        fakes.dialer.set_failing(false);
        fakes.plane.set_life(Tag::Host("0".to_string()), Some(Life::Alive));
        let handle = factory().await.expect("factory failed");
        assert_eq!(fakes.dialer.dials(), 2);

        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.stop();
        assert_eq!(handle.wait().await, Ok(()));
    }
}
