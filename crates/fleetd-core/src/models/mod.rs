//! Per-model worker manager module.
//!
//! Every model the cluster manages gets its own sub-tree of workers,
//! keyed by model UUID and dictated by the model's life: an alive model
//! runs its maintenance tree, a dying model runs its undertaker tree, a
//! dead or vanished model runs nothing. The manager subscribes to the
//! model-list watcher and reconciles an inner runner against each batch.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::runner::{Runner, RunnerConfig};
use crate::watcher::Watcher;
use crate::worker::{WorkerError, WorkerHandle};

/// The discrete lifecycle state of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Life {
    /// The model is in service.
    Alive,
    /// The model is being torn down.
    Dying,
    /// Tear-down has finished; only the record remains.
    Dead,
}

impl Life {
    /// Returns `true` for a model still in service.
    #[must_use]
    pub const fn is_alive(self) -> bool {
        matches!(self, Self::Alive)
    }

    /// Returns `true` once tear-down has finished.
    #[must_use]
    pub const fn is_dead(self) -> bool {
        matches!(self, Self::Dead)
    }
}

impl std::fmt::Display for Life {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Alive => write!(f, "alive"),
            Self::Dying => write!(f, "dying"),
            Self::Dead => write!(f, "dead"),
        }
    }
}

/// A model identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModelUuid(Uuid);

impl ModelUuid {
    /// Wrap a raw UUID.
    #[must_use]
    pub const fn new(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for ModelUuid {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl std::fmt::Display for ModelUuid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Read access to model records, as exposed by the backing store.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// The model's current life, or `None` once its record is gone.
    async fn model_life(&self, uuid: &ModelUuid) -> Result<Option<Life>, WorkerError>;
}

/// A thunk producing the worker sub-tree for one model.
pub type ModelWorkerFactory =
    Arc<dyn Fn(ModelUuid) -> BoxFuture<'static, Result<WorkerHandle, WorkerError>> + Send + Sync>;

/// Wrap an async closure as a [`ModelWorkerFactory`].
pub fn model_factory<F, Fut>(f: F) -> ModelWorkerFactory
where
    F: Fn(ModelUuid) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<WorkerHandle, WorkerError>> + Send + 'static,
{
    Arc::new(move |uuid| Box::pin(f(uuid)))
}

/// Configuration of a [`ModelWorkerManager`].
#[derive(Clone)]
pub struct ModelManagerConfig {
    /// Model record lookups.
    pub provider: Arc<dyn ModelProvider>,
    /// Builds the worker tree of an alive model.
    pub start_alive: ModelWorkerFactory,
    /// Builds the undertaker tree of a dying model.
    pub start_dying: ModelWorkerFactory,
    /// Restart delay for failed model sub-trees.
    pub restart_delay: Duration,
}

impl std::fmt::Debug for ModelManagerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelManagerConfig")
            .field("restart_delay", &self.restart_delay)
            .finish_non_exhaustive()
    }
}

/// Maintains one worker sub-tree per model, reflecting model lifecycle.
pub struct ModelWorkerManager;

fn dying_worker_id(uuid: ModelUuid) -> String {
    format!("dying:{uuid}")
}

impl ModelWorkerManager {
    /// Start the manager over the given model-list watcher.
    ///
    /// A model sub-tree's terminal error is never fatal to the manager:
    /// the sub-tree is restarted after the configured delay unless the
    /// model has since been stopped.
    #[must_use]
    pub fn spawn(
        config: ModelManagerConfig,
        mut models: Box<dyn Watcher<Vec<String>>>,
    ) -> WorkerHandle {
        WorkerHandle::spawn(move |stop| async move {
            let mut runner = Runner::new(RunnerConfig::never_fatal(config.restart_delay));
            let control = runner.control();
            let kill = runner.stop_token();

            let result = loop {
                tokio::select! {
                    () = stop.cancelled() => break Ok(()),
                    result = runner.wait() => {
                        // The inner runner died underneath us.
                        break result;
                    }
                    batch = models.next() => {
                        match batch {
                            Some(uuids) => {
                                if let Err(error) = apply_batch(&config, &control, &uuids).await {
                                    break Err(error);
                                }
                            }
                            None => {
                                break Err(WorkerError::Disconnected(
                                    "model watcher closed".to_string(),
                                ));
                            }
                        }
                    }
                }
            };

            kill.cancel();
            let runner_result = runner.wait().await;
            result.and(runner_result)
        })
    }
}

async fn apply_batch(
    config: &ModelManagerConfig,
    control: &crate::runner::RunnerControl,
    uuids: &[String],
) -> Result<(), WorkerError> {
    for raw in uuids {
        let Ok(uuid) = raw.parse::<ModelUuid>() else {
            warn!(model = %raw, "ignoring malformed model uuid");
            continue;
        };
        let life = config.provider.model_life(&uuid).await?;
        debug!(model = %uuid, life = ?life, "model changed");
        // The runner is only stopping when the manager is; ignore late
        // control failures and let the shutdown finish.
        let _ = match life {
            None => control
                .stop_worker(uuid.to_string())
                .and_then(|()| control.stop_worker(dying_worker_id(uuid))),
            Some(Life::Alive) => {
                let factory = config.start_alive.clone();
                control.start_worker(
                    uuid.to_string(),
                    crate::runner::factory(move || factory(uuid)),
                )
            }
            Some(Life::Dying) => {
                let factory = config.start_dying.clone();
                control
                    .stop_worker(uuid.to_string())
                    .and_then(|()| {
                        control.start_worker(
                            dying_worker_id(uuid),
                            crate::runner::factory(move || factory(uuid)),
                        )
                    })
            }
            Some(Life::Dead) => control
                .stop_worker(uuid.to_string())
                .and_then(|()| control.stop_worker(dying_worker_id(uuid))),
        };
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::watcher;

    #[derive(Default)]
    struct MapProvider {
        lives: Mutex<HashMap<ModelUuid, Life>>,
    }

    impl MapProvider {
        fn set(&self, uuid: ModelUuid, life: Option<Life>) {
            let mut lives = self.lives.lock().expect("lock poisoned");
            match life {
                Some(life) => lives.insert(uuid, life),
                None => lives.remove(&uuid),
            };
        }
    }

    #[async_trait]
    impl ModelProvider for MapProvider {
        async fn model_life(&self, uuid: &ModelUuid) -> Result<Option<Life>, WorkerError> {
            Ok(self.lives.lock().expect("lock poisoned").get(uuid).copied())
        }
    }

    struct Fixture {
        provider: Arc<MapProvider>,
        alive_running: Arc<AtomicUsize>,
        dying_running: Arc<AtomicUsize>,
        batches: tokio::sync::mpsc::Sender<Vec<String>>,
        handle: WorkerHandle,
    }

    fn tracking_factory(running: Arc<AtomicUsize>) -> ModelWorkerFactory {
        model_factory(move |_uuid| {
            let running = running.clone();
            async move {
                running.fetch_add(1, Ordering::SeqCst);
                let running = running.clone();
                Ok(WorkerHandle::spawn(move |stop| async move {
                    stop.cancelled().await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }))
            }
        })
    }

    fn fixture() -> Fixture {
        let provider = Arc::new(MapProvider::default());
        let alive_running = Arc::new(AtomicUsize::new(0));
        let dying_running = Arc::new(AtomicUsize::new(0));
        let (batches, models) = watcher::channel(8);

        let config = ModelManagerConfig {
            provider: provider.clone(),
            start_alive: tracking_factory(alive_running.clone()),
            start_dying: tracking_factory(dying_running.clone()),
            restart_delay: Duration::from_millis(10),
        };
        let handle = ModelWorkerManager::spawn(config, Box::new(models));

        Fixture {
            provider,
            alive_running,
            dying_running,
            batches,
            handle,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(40)).await;
    }

    #[tokio::test]
    async fn test_alive_model_gets_worker_tree() {
        let fx = fixture();
        let uuid = ModelUuid::new(Uuid::new_v4());

        fx.provider.set(uuid, Some(Life::Alive));
        fx.batches
            .send(vec![uuid.to_string()])
            .await
            .expect("send failed");
        settle().await;

        assert_eq!(fx.alive_running.load(Ordering::SeqCst), 1);
        assert_eq!(fx.dying_running.load(Ordering::SeqCst), 0);

        fx.handle.stop();
        assert_eq!(fx.handle.wait().await, Ok(()));
        assert_eq!(fx.alive_running.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_model_lifecycle_teardown() {
        let fx = fixture();
        let uuid = ModelUuid::new(Uuid::new_v4());

        fx.provider.set(uuid, Some(Life::Alive));
        fx.batches
            .send(vec![uuid.to_string()])
            .await
            .expect("send failed");
        settle().await;
        assert_eq!(fx.alive_running.load(Ordering::SeqCst), 1);

        // Alive -> Dying: the alive tree stops, the undertaker starts.
        fx.provider.set(uuid, Some(Life::Dying));
        fx.batches
            .send(vec![uuid.to_string()])
            .await
            .expect("send failed");
        settle().await;
        assert_eq!(fx.alive_running.load(Ordering::SeqCst), 0);
        assert_eq!(fx.dying_running.load(Ordering::SeqCst), 1);

        // Dying -> Dead: nothing runs for the model.
        fx.provider.set(uuid, Some(Life::Dead));
        fx.batches
            .send(vec![uuid.to_string()])
            .await
            .expect("send failed");
        settle().await;
        assert_eq!(fx.alive_running.load(Ordering::SeqCst), 0);
        assert_eq!(fx.dying_running.load(Ordering::SeqCst), 0);

        // Record removed: still nothing, and the manager stays healthy.
        fx.provider.set(uuid, None);
        fx.batches
            .send(vec![uuid.to_string()])
            .await
            .expect("send failed");
        settle().await;
        assert_eq!(fx.alive_running.load(Ordering::SeqCst), 0);
        assert_eq!(fx.dying_running.load(Ordering::SeqCst), 0);

        fx.handle.stop();
        assert_eq!(fx.handle.wait().await, Ok(()));
    }

    #[tokio::test]
    async fn test_converges_on_steady_state() {
        let fx = fixture();
        let alive = ModelUuid::new(Uuid::new_v4());
        let dying = ModelUuid::new(Uuid::new_v4());

        fx.provider.set(alive, Some(Life::Alive));
        fx.provider.set(dying, Some(Life::Dying));

        // Repeated batches with the same lives are idempotent.
        for _ in 0..3 {
            fx.batches
                .send(vec![alive.to_string(), dying.to_string()])
                .await
                .expect("send failed");
        }
        settle().await;

        assert_eq!(fx.alive_running.load(Ordering::SeqCst), 1);
        assert_eq!(fx.dying_running.load(Ordering::SeqCst), 1);

        fx.handle.stop();
        assert_eq!(fx.handle.wait().await, Ok(()));
    }

    #[tokio::test]
    async fn test_watcher_close_is_an_error() {
        let fx = fixture();
        drop(fx.batches);
        assert!(matches!(
            fx.handle.wait().await,
            Err(WorkerError::Disconnected(_))
        ));
    }

    #[tokio::test]
    async fn test_malformed_uuid_is_ignored() {
        let fx = fixture();
        fx.batches
            .send(vec!["not-a-uuid".to_string()])
            .await
            .expect("send failed");
        settle().await;

        assert_eq!(fx.alive_running.load(Ordering::SeqCst), 0);
        fx.handle.stop();
        assert_eq!(fx.handle.wait().await, Ok(()));
    }
}
