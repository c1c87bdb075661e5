//! Life flag module.
//!
//! A life flag publishes a boolean predicate over a model's life as a
//! [`FlagHandle`] resource: "not dead", "not alive", and so on. The flag
//! worker polls the model record and bounces as soon as the predicate
//! value changes, so manifolds wrapped on the flag are stopped and
//! re-evaluated whenever the model moves through its lifecycle.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::engine::flag::FlagHandle;
use crate::engine::{Manifold, StartedWorker};
use crate::models::{Life, ModelProvider, ModelUuid};
use crate::worker::{WorkerError, WorkerHandle};

/// A predicate over a model's life; `None` means the record is gone.
pub type LifePredicate = fn(Option<Life>) -> bool;

/// Satisfied while the model record exists and is not dead.
#[must_use]
pub fn is_not_dead(life: Option<Life>) -> bool {
    matches!(life, Some(Life::Alive | Life::Dying))
}

/// Satisfied while the model is dying or dead (or already gone); the
/// undertaker's gate.
#[must_use]
pub fn is_not_alive(life: Option<Life>) -> bool {
    !matches!(life, Some(Life::Alive))
}

/// Configuration of a life flag.
#[derive(Clone)]
pub struct LifeFlagConfig {
    /// Model record lookups.
    pub provider: Arc<dyn ModelProvider>,
    /// The model the flag is scoped to.
    pub uuid: ModelUuid,
    /// The predicate the flag publishes.
    pub predicate: LifePredicate,
    /// How often the record is re-checked.
    pub poll_interval: Duration,
}

impl std::fmt::Debug for LifeFlagConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifeFlagConfig")
            .field("uuid", &self.uuid)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

/// A manifold publishing the configured life predicate as a flag.
#[must_use]
pub fn manifold(config: LifeFlagConfig) -> Manifold {
    Manifold::new(Vec::<String>::new(), move |_ctx| {
        let config = config.clone();
        async move {
            let life = config.provider.model_life(&config.uuid).await?;
            let captured = (config.predicate)(life);
            debug!(model = %config.uuid, life = ?life, value = captured, "life flag started");

            let handle = WorkerHandle::spawn(move |stop| async move {
                loop {
                    tokio::select! {
                        () = stop.cancelled() => return Ok(()),
                        () = tokio::time::sleep(config.poll_interval) => {
                            let life = config.provider.model_life(&config.uuid).await?;
                            if (config.predicate)(life) != captured {
                                debug!(model = %config.uuid, "life flag value changed");
                                return Err(WorkerError::Unmet);
                            }
                        }
                    }
                }
            });
            Ok(StartedWorker::with_resource(handle, FlagHandle::new(captured)))
        }
    })
}
