//! Singular flag module.
//!
//! The singular flag answers "does this process currently hold exclusive
//! responsibility for entity E?" by holding a lease against an external
//! lease store. The flag is expressed as a manifold publishing a
//! [`FlagHandle`]: each incarnation captures the held/not-held answer at
//! start, renews at half the lease duration while holding, retries
//! acquisition with jittered back-off while not, and bounces whenever the
//! answer changes so the engine restarts leader-only dependents.
//!
//! An unavailable lease store always reads as not-leader; there is no
//! partition grace period.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::flag::FlagHandle;
use crate::engine::{Manifold, StartedWorker};
use crate::worker::{WorkerError, WorkerHandle, WorkerResult};

/// The outcome of an acquire or renew request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseGrant {
    /// Whether the caller holds the lease.
    pub granted: bool,
    /// When the lease expires if granted.
    pub expires_at: DateTime<Utc>,
}

/// Errors from the lease store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LeaseError {
    /// The store could not be reached. Reads as not-leader.
    #[error("lease store unavailable: {0}")]
    Unavailable(String),

    /// The store rejected the request outright.
    #[error("lease request rejected: {0}")]
    Rejected(String),
}

/// An external lease store keyed by entity.
///
/// Acquiring a lease the caller already holds must succeed and extend it,
/// so that a bounced flag incarnation re-establishes its claim instead of
/// losing it.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Try to acquire the lease on `key` for `holder`.
    async fn acquire(
        &self,
        key: &str,
        holder: &str,
        duration: Duration,
    ) -> Result<LeaseGrant, LeaseError>;

    /// Extend a held lease. Not granted if the caller no longer holds it.
    async fn renew(
        &self,
        key: &str,
        holder: &str,
        duration: Duration,
    ) -> Result<LeaseGrant, LeaseError>;

    /// Give the lease up so another holder can claim it immediately.
    async fn release(&self, key: &str, holder: &str) -> Result<(), LeaseError>;
}

/// Configuration of a singular flag.
#[derive(Clone)]
pub struct SingularConfig {
    /// The lease store coordinating holders.
    pub store: Arc<dyn LeaseStore>,
    /// The entity the flag is scoped to.
    pub key: String,
    /// This process's identity, recorded as the lease holder.
    pub holder: String,
    /// Lease duration D; renewal runs at D/2.
    pub duration: Duration,
    /// Base interval between acquisition attempts while not holding.
    pub retry_interval: Duration,
}

impl SingularConfig {
    /// Configuration with the default retry interval of a tenth of the
    /// lease duration.
    #[must_use]
    pub fn new(
        store: Arc<dyn LeaseStore>,
        key: impl Into<String>,
        holder: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self {
            store,
            key: key.into(),
            holder: holder.into(),
            duration,
            retry_interval: duration / 10,
        }
    }
}

impl std::fmt::Debug for SingularConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingularConfig")
            .field("key", &self.key)
            .field("holder", &self.holder)
            .field("duration", &self.duration)
            .field("retry_interval", &self.retry_interval)
            .finish_non_exhaustive()
    }
}

/// A manifold publishing the singular flag for `config.key`.
#[must_use]
pub fn manifold(config: SingularConfig) -> Manifold {
    Manifold::new(Vec::<String>::new(), move |_ctx| {
        let config = config.clone();
        async move {
            let held = match config
                .store
                .acquire(&config.key, &config.holder, config.duration)
                .await
            {
                Ok(grant) => grant.granted,
                Err(error) => {
                    warn!(key = %config.key, %error, "lease acquisition failed; not leader");
                    false
                }
            };
            if held {
                info!(key = %config.key, holder = %config.holder, "holding singular lease");
            } else {
                debug!(key = %config.key, "singular lease held elsewhere");
            }
            let handle = WorkerHandle::spawn(move |stop| flag_loop(config, held, stop));
            Ok(StartedWorker::with_resource(handle, FlagHandle::new(held)))
        }
    })
}

async fn flag_loop(config: SingularConfig, held: bool, stop: CancellationToken) -> WorkerResult {
    if held {
        hold_lease(&config, &stop).await
    } else {
        chase_lease(&config, &stop).await
    }
}

/// Renew at half the lease duration until renewal fails, then bounce so
/// dependents observe the flag going down before any other holder's
/// lease can begin.
async fn hold_lease(config: &SingularConfig, stop: &CancellationToken) -> WorkerResult {
    let period = config.duration / 2;
    loop {
        tokio::select! {
            () = stop.cancelled() => {
                if let Err(error) = config.store.release(&config.key, &config.holder).await {
                    warn!(key = %config.key, %error, "failed to release lease on shutdown");
                }
                return Ok(());
            }
            () = tokio::time::sleep(period) => {
                match config
                    .store
                    .renew(&config.key, &config.holder, config.duration)
                    .await
                {
                    Ok(grant) if grant.granted => {}
                    Ok(_) => {
                        info!(key = %config.key, "singular lease lost");
                        return Err(WorkerError::Unmet);
                    }
                    Err(error) => {
                        warn!(key = %config.key, %error, "lease renewal failed; dropping leadership");
                        return Err(WorkerError::Unmet);
                    }
                }
            }
        }
    }
}

/// Poll for the lease with jittered back-off; bounce once acquired so the
/// next incarnation publishes the flag as held.
async fn chase_lease(config: &SingularConfig, stop: &CancellationToken) -> WorkerResult {
    loop {
        let wait = jittered(config.retry_interval);
        tokio::select! {
            () = stop.cancelled() => return Ok(()),
            () = tokio::time::sleep(wait) => {
                match config
                    .store
                    .acquire(&config.key, &config.holder, config.duration)
                    .await
                {
                    Ok(grant) if grant.granted => {
                        debug!(key = %config.key, "singular lease acquired");
                        return Err(WorkerError::Unmet);
                    }
                    Ok(_) => {}
                    Err(error) => {
                        debug!(key = %config.key, %error, "lease store unavailable; staying follower");
                    }
                }
            }
        }
    }
}

fn jittered(base: Duration) -> Duration {
    let half = base.as_millis() / 2;
    if half == 0 {
        return base;
    }
    #[allow(clippy::cast_possible_truncation)] // intervals are far below u64::MAX millis
    let jitter = rand::thread_rng().gen_range(0..half as u64);
    base + Duration::from_millis(jitter)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;
    use crate::engine::{Engine, EngineConfig, ManifoldStatus};
    use crate::engine::flag::with_flag;

    /// In-memory lease store honoring expiry, for coordination tests.
    #[derive(Default)]
    struct MemoryLeaseStore {
        leases: Mutex<HashMap<String, (String, DateTime<Utc>)>>,
    }

    impl MemoryLeaseStore {
        fn claim(
            &self,
            key: &str,
            holder: &str,
            duration: Duration,
            renew_only: bool,
        ) -> LeaseGrant {
            let mut leases = self.leases.lock().expect("lock poisoned");
            let now = Utc::now();
            let expires_at = now + chrono::Duration::from_std(duration).expect("bad duration");
            match leases.get(key) {
                Some((owner, expiry)) if *expiry > now && owner != holder => LeaseGrant {
                    granted: false,
                    expires_at: *expiry,
                },
                Some((owner, expiry)) if renew_only && (owner != holder || *expiry <= now) => {
                    LeaseGrant {
                        granted: false,
                        expires_at: *expiry,
                    }
                }
                None if renew_only => LeaseGrant {
                    granted: false,
                    expires_at: now,
                },
                _ => {
                    leases.insert(key.to_string(), (holder.to_string(), expires_at));
                    LeaseGrant {
                        granted: true,
                        expires_at,
                    }
                }
            }
        }
    }

    #[async_trait]
    impl LeaseStore for MemoryLeaseStore {
        async fn acquire(
            &self,
            key: &str,
            holder: &str,
            duration: Duration,
        ) -> Result<LeaseGrant, LeaseError> {
            Ok(self.claim(key, holder, duration, false))
        }

        async fn renew(
            &self,
            key: &str,
            holder: &str,
            duration: Duration,
        ) -> Result<LeaseGrant, LeaseError> {
            Ok(self.claim(key, holder, duration, true))
        }

        async fn release(&self, key: &str, holder: &str) -> Result<(), LeaseError> {
            let mut leases = self.leases.lock().expect("lock poisoned");
            if let Some((owner, _)) = leases.get(key) {
                if owner == holder {
                    leases.remove(key);
                }
            }
            Ok(())
        }
    }

    /// A store that is always unreachable.
    struct DownLeaseStore;

    #[async_trait]
    impl LeaseStore for DownLeaseStore {
        async fn acquire(
            &self,
            _key: &str,
            _holder: &str,
            _duration: Duration,
        ) -> Result<LeaseGrant, LeaseError> {
            Err(LeaseError::Unavailable("no route to store".to_string()))
        }

        async fn renew(
            &self,
            _key: &str,
            _holder: &str,
            _duration: Duration,
        ) -> Result<LeaseGrant, LeaseError> {
            Err(LeaseError::Unavailable("no route to store".to_string()))
        }

        async fn release(&self, _key: &str, _holder: &str) -> Result<(), LeaseError> {
            Err(LeaseError::Unavailable("no route to store".to_string()))
        }
    }

    async fn wait_for_leader_status(engine: &Engine, name: &str, running: bool) {
        for _ in 0..400 {
            let report = engine.report().await;
            let is_running = report
                .get(name)
                .is_some_and(|entry| entry.status == ManifoldStatus::Running);
            if is_running == running {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("leader-only worker never became running={running}");
    }

    fn leader_only_engine(store: Arc<dyn LeaseStore>, holder: &str) -> Engine {
        let engine = Engine::new(EngineConfig {
            bounce_delay: Duration::from_millis(5),
            error_delay: Duration::from_millis(20),
            ..EngineConfig::default()
        });
        let config = SingularConfig {
            store,
            key: "ctrl".to_string(),
            holder: holder.to_string(),
            duration: Duration::from_millis(400),
            retry_interval: Duration::from_millis(40),
        };
        let handle = engine.handle();
        let flag = manifold(config);
        let worker = with_flag(
            Manifold::new(Vec::<String>::new(), |_ctx| async {
                Ok(StartedWorker::new(WorkerHandle::idle()))
            }),
            "run-flag",
        );
        tokio::spawn(async move {
            handle.install("run-flag", flag).await.expect("install failed");
            handle.install("worker", worker).await.expect("install failed");
        });
        engine
    }

    #[tokio::test]
    async fn test_mutual_exclusion_between_holders() {
        let store = Arc::new(MemoryLeaseStore::default());
        let p1 = leader_only_engine(store.clone(), "host-1");
        let p2 = leader_only_engine(store.clone(), "host-2");

        // Exactly one of the two engines runs its leader-only worker.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let r1 = p1.report().await;
        let r2 = p2.report().await;
        let leaders = [&r1, &r2]
            .iter()
            .filter(|report| {
                report
                    .get("worker")
                    .is_some_and(|entry| entry.status == ManifoldStatus::Running)
            })
            .count();
        assert_eq!(leaders, 1, "expected exactly one leader; got {leaders}");

        p1.kill();
        p2.kill();
    }

    #[tokio::test]
    async fn test_leadership_moves_after_holder_crashes() {
        let store = Arc::new(MemoryLeaseStore::default());

        // P1 takes the lease and then crashes without releasing.
        store
            .acquire("ctrl", "host-1", Duration::from_millis(400))
            .await
            .expect("acquire failed");

        let p2 = leader_only_engine(store.clone(), "host-2");
        // Not leader while P1's lease is live.
        wait_for_leader_status(&p2, "worker", false).await;

        // Once the lease expires, P2 claims it from its polling loop.
        wait_for_leader_status(&p2, "worker", true).await;
        p2.kill();
    }

    #[tokio::test]
    async fn test_clean_shutdown_releases_lease() {
        let store = Arc::new(MemoryLeaseStore::default());
        let p1 = leader_only_engine(store.clone(), "host-1");
        wait_for_leader_status(&p1, "worker", true).await;

        let mut p1 = p1;
        p1.kill();
        assert_eq!(p1.wait().await, Ok(()));

        // The release lets the next holder in without waiting for expiry.
        let grant = store
            .acquire("ctrl", "host-2", Duration::from_millis(400))
            .await
            .expect("acquire failed");
        assert!(grant.granted);
    }

    #[tokio::test]
    async fn test_unavailable_store_reads_as_not_leader() {
        let engine = leader_only_engine(Arc::new(DownLeaseStore), "host-1");
        tokio::time::sleep(Duration::from_millis(150)).await;
        let report = engine.report().await;
        assert_eq!(report["worker"].status, ManifoldStatus::Stopped);
        engine.kill();
    }
}
