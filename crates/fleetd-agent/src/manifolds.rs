//! Per-model manifold catalogs.
//!
//! The declarative worker graph run for each model. Both trees share a
//! foundation - the api-caller resource, the singular run flag, and a
//! life flag - and every operative worker is wrapped on the run flag so
//! only one controller administers a model at a time, plus the life flag
//! matching its tree: maintenance workers require the model not dead,
//! the undertaker requires it not alive.

use std::sync::Arc;
use std::time::Duration;

use fleetd_core::engine::flag::with_flag;
use fleetd_core::engine::{Manifold, StartedWorker};
use fleetd_core::lifeflag::{self, LifeFlagConfig};
use fleetd_core::models::{ModelProvider, ModelUuid};
use fleetd_core::singular::{self, LeaseStore, SingularConfig};
use fleetd_core::tag::Tag;
use fleetd_core::worker::WorkerHandle;

use crate::collaborators::{ControlPlane, ModelOps};

/// Name of the manifold publishing the model-scoped control-plane
/// connection.
pub const API_CALLER: &str = "api-caller";

/// Name of the singular run flag.
pub const RUN_FLAG: &str = "run-flag";

/// Name of the not-dead life flag.
pub const NOT_DEAD_FLAG: &str = "not-dead-flag";

/// Name of the not-alive life flag.
pub const NOT_ALIVE_FLAG: &str = "not-alive-flag";

/// Name of the maintenance worker for alive models.
pub const MODEL_KEEPER: &str = "model-keeper";

/// Name of the undertaker worker for dying models.
pub const UNDERTAKER: &str = "undertaker";

/// Everything needed to build one model's manifolds.
#[derive(Clone)]
pub struct ModelManifoldsConfig {
    /// The model administered by this graph.
    pub uuid: ModelUuid,
    /// The model-scoped control-plane connection.
    pub conn: Arc<dyn ControlPlane>,
    /// Model record lookups for the life flags.
    pub provider: Arc<dyn ModelProvider>,
    /// Model maintenance operations.
    pub ops: Arc<dyn ModelOps>,
    /// Lease store for the run flag.
    pub lease_store: Arc<dyn LeaseStore>,
    /// This controller's identity, used as the lease holder.
    pub holder: Tag,
    /// Lease duration for the run flag.
    pub lease_duration: Duration,
    /// Poll and tick interval for life flags and model workers.
    pub poll_interval: Duration,
}

impl std::fmt::Debug for ModelManifoldsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelManifoldsConfig")
            .field("uuid", &self.uuid)
            .field("holder", &self.holder)
            .field("lease_duration", &self.lease_duration)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

fn foundation(config: &ModelManifoldsConfig) -> Vec<(String, Manifold)> {
    vec![
        (
            API_CALLER.to_string(),
            Manifold::value(config.conn.clone()),
        ),
        (
            RUN_FLAG.to_string(),
            singular::manifold(SingularConfig::new(
                config.lease_store.clone(),
                format!("model-{}", config.uuid),
                config.holder.to_string(),
                config.lease_duration,
            )),
        ),
    ]
}

fn life_flag(config: &ModelManifoldsConfig, predicate: lifeflag::LifePredicate) -> Manifold {
    lifeflag::manifold(LifeFlagConfig {
        provider: config.provider.clone(),
        uuid: config.uuid,
        predicate,
        poll_interval: config.poll_interval,
    })
}

/// Wrap an operative manifold on the run flag and the given life flag.
fn guarded(manifold: Manifold, life_flag_name: &str) -> Manifold {
    with_flag(with_flag(manifold, life_flag_name), RUN_FLAG)
}

/// The graph run for an alive model.
#[must_use]
pub fn alive_manifolds(config: &ModelManifoldsConfig) -> Vec<(String, Manifold)> {
    let mut manifolds = foundation(config);
    manifolds.push((NOT_DEAD_FLAG.to_string(), life_flag(config, lifeflag::is_not_dead)));
    manifolds.push((
        MODEL_KEEPER.to_string(),
        guarded(keeper_manifold(config), NOT_DEAD_FLAG),
    ));
    manifolds
}

/// The graph run for a dying model.
#[must_use]
pub fn dying_manifolds(config: &ModelManifoldsConfig) -> Vec<(String, Manifold)> {
    let mut manifolds = foundation(config);
    manifolds.push((
        NOT_ALIVE_FLAG.to_string(),
        life_flag(config, lifeflag::is_not_alive),
    ));
    manifolds.push((
        UNDERTAKER.to_string(),
        guarded(undertaker_manifold(config), NOT_ALIVE_FLAG),
    ));
    manifolds
}

/// Periodic upkeep over an alive model.
fn keeper_manifold(config: &ModelManifoldsConfig) -> Manifold {
    let ops = config.ops.clone();
    let uuid = config.uuid;
    let interval = config.poll_interval;
    Manifold::new([API_CALLER], move |ctx| {
        let ops = ops.clone();
        async move {
            let _conn: Arc<dyn ControlPlane> = ctx.get(API_CALLER)?;
            Ok(StartedWorker::new(WorkerHandle::spawn(
                move |stop| async move {
                    loop {
                        ops.cleanup_pass(&uuid).await?;
                        tokio::select! {
                            () = stop.cancelled() => return Ok(()),
                            () = tokio::time::sleep(interval) => {}
                        }
                    }
                },
            )))
        }
    })
}

/// Stepwise tear-down of a dying model.
fn undertaker_manifold(config: &ModelManifoldsConfig) -> Manifold {
    let ops = config.ops.clone();
    let uuid = config.uuid;
    let interval = config.poll_interval;
    Manifold::new([API_CALLER], move |ctx| {
        let ops = ops.clone();
        async move {
            let _conn: Arc<dyn ControlPlane> = ctx.get(API_CALLER)?;
            Ok(StartedWorker::new(WorkerHandle::spawn(
                move |stop| async move {
                    loop {
                        ops.process_dying(&uuid).await?;
                        tokio::select! {
                            () = stop.cancelled() => return Ok(()),
                            () = tokio::time::sleep(interval) => {}
                        }
                    }
                },
            )))
        }
    })
}
