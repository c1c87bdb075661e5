//! The state worker.
//!
//! Controller hosts run the state worker: it performs one-time store
//! initialization, opens the shared store session, and supervises the
//! per-model worker manager and the restore watcher - both held behind
//! the upgrade gates. The shared session closes only in the worker's
//! epilogue, after every child (and thus every watcher) has terminated.
//! Per-model trees open their own model-scoped store session and
//! control-plane connection, closed in reverse order when the tree ends.

use std::sync::Arc;

use fleetd_core::engine::{Engine, EngineConfig};
use fleetd_core::models::{
    self, ModelManagerConfig, ModelWorkerFactory, ModelWorkerManager,
};
use fleetd_core::runner::{self, Runner, RunnerConfig, WorkerFactory};
use fleetd_core::worker::{WorkerError, WorkerHandle};
use tracing::debug;

use crate::agent::AgentState;
use crate::collaborators::{Collaborators, ControlPlane, SessionModelProvider, StoreSession};
use crate::manifolds::{self, ModelManifoldsConfig};
use crate::{restore, upgrade};

/// Factory for the state worker, started by the state-starter whenever
/// the configuration carries serving info.
pub(crate) fn state_worker_factory(state: Arc<AgentState>, deps: Collaborators) -> WorkerFactory {
    runner::factory(move || {
        let state = state.clone();
        let deps = deps.clone();
        async move {
            let config = state.current_config();
            if !config.is_controller() {
                return Err(WorkerError::Config(
                    "state worker requires serving configuration".to_string(),
                ));
            }
            state.ensure_store_ready(&deps.store).await?;
            let session = deps.store.open(&config).await?;
            Ok(build_state_worker(state, deps, session))
        }
    })
}

fn build_state_worker(
    state: Arc<AgentState>,
    deps: Collaborators,
    session: Arc<dyn StoreSession>,
) -> WorkerHandle {
    WorkerHandle::spawn(move |stop| async move {
        let mut runner = Runner::new(RunnerConfig::connection_fatal(deps.restart_delay));
        let control = runner.control();

        let _ = upgrade::start_after_upgrade(
            &state,
            &control,
            "model-manager",
            model_manager_factory(state.clone(), deps.clone(), session.clone()),
        );
        let restore_session = session.clone();
        let _ = upgrade::start_after_upgrade(
            &state,
            &control,
            "restore-watcher",
            restore::watcher_factory(state.clone(), move || restore_session.watch_restore()),
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
        // All watchers are gone now; the session may close.
        session.close().await;
        result
    })
}

fn model_manager_factory(
    state: Arc<AgentState>,
    deps: Collaborators,
    session: Arc<dyn StoreSession>,
) -> WorkerFactory {
    runner::factory(move || {
        let state = state.clone();
        let deps = deps.clone();
        let session = session.clone();
        async move {
            let config = ModelManagerConfig {
                provider: Arc::new(SessionModelProvider::new(session.clone())),
                start_alive: model_tree_factory(state.clone(), deps.clone(), TreeKind::Alive),
                start_dying: model_tree_factory(state, deps.clone(), TreeKind::Dying),
                restart_delay: deps.restart_delay,
            };
            Ok(ModelWorkerManager::spawn(config, session.watch_models()))
        }
    })
}

#[derive(Clone, Copy)]
enum TreeKind {
    Alive,
    Dying,
}

/// Factory for one model's worker tree. Opens the model-scoped store
/// session and control-plane connection, runs the tree's manifolds on a
/// dedicated engine, and closes both connections - reverse of the open
/// order - once the engine is done.
fn model_tree_factory(
    state: Arc<AgentState>,
    deps: Collaborators,
    kind: TreeKind,
) -> ModelWorkerFactory {
    models::model_factory(move |uuid| {
        let state = state.clone();
        let deps = deps.clone();
        async move {
            let agent_config = state.current_config();
            let model_session = deps.store.open_model(&agent_config, &uuid).await?;
            let conn = match deps.dialer.dial_model(&agent_config, &uuid).await {
                Ok(conn) => conn,
                Err(err) => {
                    model_session.close().await;
                    return Err(err);
                }
            };

            let config = ModelManifoldsConfig {
                uuid,
                conn: conn.clone(),
                provider: Arc::new(SessionModelProvider::new(model_session.clone())),
                ops: deps.model_ops.clone(),
                lease_store: deps.lease_store.clone(),
                holder: state.tag().clone(),
                lease_duration: agent_config.lease_duration,
                poll_interval: deps.model_poll_interval,
            };
            let catalog = match kind {
                TreeKind::Alive => manifolds::alive_manifolds(&config),
                TreeKind::Dying => manifolds::dying_manifolds(&config),
            };

            let mut engine = Engine::new(EngineConfig {
                error_delay: deps.restart_delay,
                ..EngineConfig::default()
            });
            for (name, manifold) in catalog {
                if let Err(err) = engine.install(name, manifold).await {
                    engine.kill();
                    let _ = engine.wait().await;
                    conn.close().await;
                    model_session.close().await;
                    return Err(WorkerError::Config(err.to_string()));
                }
            }
            debug!(model = %uuid, "model worker tree started");
            Ok(wrap_model_engine(engine, conn, model_session))
        }
    })
}

fn wrap_model_engine(
    engine: Engine,
    conn: Arc<dyn ControlPlane>,
    session: Arc<dyn StoreSession>,
) -> WorkerHandle {
    WorkerHandle::spawn(move |stop| async move {
        let mut engine = engine;
        let kill = engine.stop_token();
        let finished = tokio::select! {
            result = engine.wait() => Some(result),
            () = stop.cancelled() => None,
        };
        let result = match finished {
            Some(result) => result,
            None => {
                kill.cancel();
                engine.wait().await
            }
        };
        conn.close().await;
        session.close().await;
        result
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use fleetd_core::config::ServingConfig;
    use fleetd_core::models::{Life, ModelUuid};
    use uuid::Uuid;

    use super::*;
    use crate::restore::RestoreStatus;
    use crate::testing;

    fn controller_fixture() -> (Arc<AgentState>, testing::Fakes) {
        let root = tempfile::tempdir().expect("tempdir failed");
        let mut config = testing::config_in(root.path());
        config.serving = Some(ServingConfig {
            cert: "CERT".to_string(),
            private_key: "KEY".to_string(),
            ca_private_key: String::new(),
            api_port: 17070,
            shared_secret: "hush".to_string(),
        });
        let fakes = testing::Fakes::new(config.clone());
        let state = Arc::new(AgentState::new(config));
        // Open the upgrade gates so the controller children start.
        state.upgrade_complete().open();
        state.initial_upgrade_check().open();
        (state, fakes)
    }

    #[tokio::test]
    async fn test_state_worker_requires_serving_config() {
        let root = tempfile::tempdir().expect("tempdir failed");
        let config = testing::config_in(root.path());
        let fakes = testing::Fakes::new(config.clone());
        let state = Arc::new(AgentState::new(config));

        let factory = state_worker_factory(state, fakes.collaborators());
        assert!(matches!(factory().await, Err(WorkerError::Config(_))));
    }

    #[tokio::test]
    async fn test_state_worker_runs_model_trees() {
        let (state, fakes) = controller_fixture();
        let uuid = ModelUuid::new(Uuid::new_v4());
        fakes.session.set_model(uuid, Some(Life::Alive));

        let factory = state_worker_factory(state, fakes.collaborators());
        let handle = factory().await.expect("factory failed");

        // Feed the model watcher once the manager is subscribed.
        for _ in 0..100 {
            fakes.session.push_models(vec![uuid.to_string()]);
            if fakes.model_ops.cleanups() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(fakes.model_ops.cleanups() > 0, "model keeper never ran");

        handle.stop();
        assert_eq!(handle.wait().await, Ok(()));
        // The shared session closes after the children are gone.
        assert!(fakes.session.closes() >= 1);
    }

    #[tokio::test]
    async fn test_store_initialization_runs_once_per_process() {
        let (state, fakes) = controller_fixture();

        let factory = state_worker_factory(state, fakes.collaborators());
        let first = factory().await.expect("factory failed");
        first.stop();
        assert_eq!(first.wait().await, Ok(()));

        let second = factory().await.expect("factory failed");
        second.stop();
        assert_eq!(second.wait().await, Ok(()));

        assert_eq!(fakes.store.ready_calls(), 1);
    }

    #[tokio::test]
    async fn test_restore_watcher_drives_agent_state() {
        let (state, fakes) = controller_fixture();

        let factory = state_worker_factory(state.clone(), fakes.collaborators());
        let handle = factory().await.expect("factory failed");

        for _ in 0..100 {
            fakes.session.push_restore(RestoreStatus::Pending);
            if state.is_restore_preparing() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(state.is_restore_preparing());

        fakes.session.push_restore(RestoreStatus::InProgress);
        for _ in 0..100 {
            if state.is_restore_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(state.is_restore_running());

        handle.stop();
        assert_eq!(handle.wait().await, Ok(()));
    }
}
