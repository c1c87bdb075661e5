//! In-memory collaborator doubles.
//!
//! Every external interface has a recording, in-memory implementation
//! here so lifecycle behavior can be exercised without a cluster. Used
//! by this crate's own tests and usable by embedders for theirs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleetd_core::config::{AgentConfig, ConfigError, StoreConfig};
use fleetd_core::models::{Life, ModelUuid};
use fleetd_core::singular::{LeaseError, LeaseGrant, LeaseStore};
use fleetd_core::tag::Tag;
use fleetd_core::watcher::{self, Watcher};
use fleetd_core::worker::WorkerError;
use tokio::sync::mpsc;

use crate::collaborators::{
    AgentConfigIo, Collaborators, ContainerProbe, ControlPlane, ControlPlaneDialer, HostActions,
    HostError, HostServices, LoopDeviceManager, ModelOps, StoreOpener, StoreSession, UpgradeSteps,
};
use crate::restore::RestoreStatus;

/// A minimal valid configuration rooted under `root`: data and log
/// directories are created beneath it.
#[must_use]
pub fn config_in(root: &Path) -> AgentConfig {
    let data_dir = root.join("data");
    let log_dir = root.join("log");
    std::fs::create_dir_all(&data_dir).expect("failed to create data dir");
    std::fs::create_dir_all(&log_dir).expect("failed to create log dir");
    AgentConfig {
        tag: Tag::Host("0".to_string()),
        data_dir,
        log_dir,
        control_plane: vec!["10.0.0.2:17070".to_string()],
        store: StoreConfig {
            addresses: vec!["10.0.0.2:37017".to_string()],
            username: "host-0".to_string(),
            password: "sekrit".to_string(),
            ca_cert: None,
        },
        serving: None,
        upgraded_to_version: None,
        provider_type: None,
        namespace: None,
        nonce: None,
        allows_secure_connection: false,
        service_name: None,
        lease_duration: Duration::from_millis(400),
    }
}

/// Configuration I/O over an in-memory record.
#[derive(Debug)]
pub struct MemoryConfigIo {
    config: Mutex<AgentConfig>,
}

impl MemoryConfigIo {
    /// Create I/O seeded with `config`.
    #[must_use]
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config: Mutex::new(config),
        }
    }

    /// The currently stored configuration.
    #[must_use]
    pub fn stored(&self) -> AgentConfig {
        self.config.lock().expect("lock poisoned").clone()
    }
}

impl AgentConfigIo for MemoryConfigIo {
    fn read(&self) -> Result<AgentConfig, ConfigError> {
        Ok(self.stored())
    }

    fn write(&self, config: &AgentConfig) -> Result<(), ConfigError> {
        *self.config.lock().expect("lock poisoned") = config.clone();
        Ok(())
    }
}

/// A recording in-memory control plane.
#[derive(Debug, Default)]
pub struct FakeControlPlane {
    lives: Mutex<HashMap<Tag, Life>>,
    pending_upgrade: AtomicBool,
    reboot_waits: AtomicUsize,
    log_syncs: AtomicUsize,
    key_syncs: AtomicUsize,
    closes: AtomicUsize,
}

impl FakeControlPlane {
    /// Set an entity's life; `None` removes the record.
    pub fn set_life(&self, tag: Tag, life: Option<Life>) {
        let mut lives = self.lives.lock().expect("lock poisoned");
        match life {
            Some(life) => lives.insert(tag, life),
            None => lives.remove(&tag),
        };
    }

    /// Mark a binary upgrade as pending (or not).
    pub fn set_pending_upgrade(&self, pending: bool) {
        self.pending_upgrade.store(pending, Ordering::SeqCst);
    }

    /// How many times the reboot finalizer was awaited.
    #[must_use]
    pub fn reboot_waits(&self) -> usize {
        self.reboot_waits.load(Ordering::SeqCst)
    }

    /// How many log-forwarding syncs ran.
    #[must_use]
    pub fn log_syncs(&self) -> usize {
        self.log_syncs.load(Ordering::SeqCst)
    }

    /// How many authorized-key syncs ran.
    #[must_use]
    pub fn key_syncs(&self) -> usize {
        self.key_syncs.load(Ordering::SeqCst)
    }

    /// How many times the connection was closed.
    #[must_use]
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn entity_life(&self, tag: &Tag) -> Result<Option<Life>, WorkerError> {
        Ok(self.lives.lock().expect("lock poisoned").get(tag).copied())
    }

    async fn pending_binary_upgrade(&self) -> Result<bool, WorkerError> {
        Ok(self.pending_upgrade.load(Ordering::SeqCst))
    }

    async fn await_reboot_ready(&self) -> Result<(), WorkerError> {
        self.reboot_waits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn sync_log_forwarding(&self) -> Result<(), WorkerError> {
        self.log_syncs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn sync_authorized_keys(&self) -> Result<(), WorkerError> {
        self.key_syncs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// A dialer handing out one shared [`FakeControlPlane`].
pub struct FakeDialer {
    /// The connection every dial returns.
    pub plane: Arc<FakeControlPlane>,
    dials: AtomicUsize,
    fail: AtomicBool,
}

impl FakeDialer {
    /// Create a dialer over the given plane.
    #[must_use]
    pub fn new(plane: Arc<FakeControlPlane>) -> Self {
        Self {
            plane,
            dials: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        }
    }

    /// Make subsequent dials fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }

    /// How many dials have been attempted.
    #[must_use]
    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    fn dial_inner(&self) -> Result<Arc<dyn ControlPlane>, WorkerError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(WorkerError::Disconnected(
                "control plane unreachable".to_string(),
            ));
        }
        Ok(self.plane.clone())
    }
}

#[async_trait]
impl ControlPlaneDialer for FakeDialer {
    async fn dial(&self, _config: &AgentConfig) -> Result<Arc<dyn ControlPlane>, WorkerError> {
        self.dial_inner()
    }

    async fn dial_model(
        &self,
        _config: &AgentConfig,
        _model: &ModelUuid,
    ) -> Result<Arc<dyn ControlPlane>, WorkerError> {
        self.dial_inner()
    }
}

/// A recording in-memory store session.
#[derive(Default)]
pub struct FakeStoreSession {
    lives: Mutex<HashMap<ModelUuid, Life>>,
    model_feeds: Mutex<Vec<mpsc::Sender<Vec<String>>>>,
    restore_feeds: Mutex<Vec<mpsc::Sender<RestoreStatus>>>,
    closes: AtomicUsize,
}

impl FakeStoreSession {
    /// Set a model's life; `None` removes the record.
    pub fn set_model(&self, uuid: ModelUuid, life: Option<Life>) {
        let mut lives = self.lives.lock().expect("lock poisoned");
        match life {
            Some(life) => lives.insert(uuid, life),
            None => lives.remove(&uuid),
        };
    }

    /// Push a model-change batch to every model watcher.
    pub fn push_models(&self, batch: Vec<String>) {
        for feed in &*self.model_feeds.lock().expect("lock poisoned") {
            let _ = feed.try_send(batch.clone());
        }
    }

    /// Push a restore status to every restore watcher.
    pub fn push_restore(&self, status: RestoreStatus) {
        for feed in &*self.restore_feeds.lock().expect("lock poisoned") {
            let _ = feed.try_send(status);
        }
    }

    /// How many times the session was closed.
    #[must_use]
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StoreSession for FakeStoreSession {
    fn watch_models(&self) -> Box<dyn Watcher<Vec<String>>> {
        let (tx, watcher) = watcher::channel(16);
        self.model_feeds.lock().expect("lock poisoned").push(tx);
        Box::new(watcher)
    }

    fn watch_restore(&self) -> Box<dyn Watcher<RestoreStatus>> {
        let (tx, watcher) = watcher::channel(16);
        self.restore_feeds.lock().expect("lock poisoned").push(tx);
        Box::new(watcher)
    }

    async fn model_life(&self, uuid: &ModelUuid) -> Result<Option<Life>, WorkerError> {
        Ok(self.lives.lock().expect("lock poisoned").get(uuid).copied())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// A store opener handing out one shared [`FakeStoreSession`].
pub struct FakeStore {
    /// The session every open returns.
    pub session: Arc<FakeStoreSession>,
    ready_calls: AtomicUsize,
}

impl FakeStore {
    /// Create an opener over the given session.
    #[must_use]
    pub fn new(session: Arc<FakeStoreSession>) -> Self {
        Self {
            session,
            ready_calls: AtomicUsize::new(0),
        }
    }

    /// How many times one-time initialization ran.
    #[must_use]
    pub fn ready_calls(&self) -> usize {
        self.ready_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StoreOpener for FakeStore {
    async fn ensure_ready(&self, _config: &AgentConfig) -> Result<(), WorkerError> {
        self.ready_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn open(&self, _config: &AgentConfig) -> Result<Arc<dyn StoreSession>, WorkerError> {
        Ok(self.session.clone())
    }

    async fn open_model(
        &self,
        _config: &AgentConfig,
        _model: &ModelUuid,
    ) -> Result<Arc<dyn StoreSession>, WorkerError> {
        // Model-scoped opens share the one in-memory session so tests
        // can steer model lives from a single place.
        Ok(self.session.clone())
    }
}

/// Recording model maintenance operations.
#[derive(Debug, Default)]
pub struct FakeModelOps {
    cleanups: AtomicUsize,
    dying_steps: AtomicUsize,
}

impl FakeModelOps {
    /// How many upkeep passes ran.
    #[must_use]
    pub fn cleanups(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }

    /// How many undertaker steps ran.
    #[must_use]
    pub fn dying_steps(&self) -> usize {
        self.dying_steps.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelOps for FakeModelOps {
    async fn cleanup_pass(&self, _uuid: &ModelUuid) -> Result<(), WorkerError> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn process_dying(&self, _uuid: &ModelUuid) -> Result<(), WorkerError> {
        self.dying_steps.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Records service-unit removals.
#[derive(Debug, Default)]
pub struct RecordingHostServices {
    removed: Mutex<Vec<String>>,
}

impl RecordingHostServices {
    /// The units removed so far.
    #[must_use]
    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().expect("lock poisoned").clone()
    }
}

impl HostServices for RecordingHostServices {
    fn remove_service(&self, name: &str) -> Result<(), HostError> {
        self.removed
            .lock()
            .expect("lock poisoned")
            .push(name.to_string());
        Ok(())
    }
}

/// A container probe answering from fixed values.
#[derive(Debug, Default)]
pub struct StaticContainerProbe {
    /// Whether LXC containers are supported.
    pub lxc: bool,
    /// Whether KVM containers are supported.
    pub kvm: bool,
    /// Whether the agent runs inside a container.
    pub inside: bool,
}

impl ContainerProbe for StaticContainerProbe {
    fn supports_lxc(&self) -> Result<bool, HostError> {
        Ok(self.lxc)
    }

    fn supports_kvm(&self) -> Result<bool, HostError> {
        Ok(self.kvm)
    }

    fn running_inside(&self) -> Result<bool, HostError> {
        Ok(self.inside)
    }
}

/// Records loop-device detach requests.
#[derive(Debug, Default)]
pub struct RecordingLoopDevices {
    detached: Mutex<Vec<PathBuf>>,
}

impl RecordingLoopDevices {
    /// The data directories detach was requested for.
    #[must_use]
    pub fn detached(&self) -> Vec<PathBuf> {
        self.detached.lock().expect("lock poisoned").clone()
    }
}

impl LoopDeviceManager for RecordingLoopDevices {
    fn detach_loop_devices(&self, _root_dir: &Path, data_dir: &Path) -> Result<(), HostError> {
        self.detached
            .lock()
            .expect("lock poisoned")
            .push(data_dir.to_path_buf());
        Ok(())
    }
}

/// Records host power actions.
#[derive(Debug, Default)]
pub struct RecordingHostActions {
    reboots: AtomicUsize,
    shutdowns: AtomicUsize,
}

impl RecordingHostActions {
    /// How many reboots were scheduled.
    #[must_use]
    pub fn reboots(&self) -> usize {
        self.reboots.load(Ordering::SeqCst)
    }

    /// How many shutdowns were scheduled.
    #[must_use]
    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

impl HostActions for RecordingHostActions {
    fn schedule_reboot(&self) -> Result<(), HostError> {
        self.reboots.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn schedule_shutdown(&self) -> Result<(), HostError> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Upgrade steps that complete immediately.
#[derive(Debug, Default)]
pub struct InstantUpgradeSteps {
    runs: Mutex<Vec<(Option<String>, String)>>,
}

impl InstantUpgradeSteps {
    /// The `(previous, current)` pairs run so far.
    #[must_use]
    pub fn runs(&self) -> Vec<(Option<String>, String)> {
        self.runs.lock().expect("lock poisoned").clone()
    }
}

#[async_trait]
impl UpgradeSteps for InstantUpgradeSteps {
    async fn run(&self, previous: Option<&str>, current: &str) -> Result<(), WorkerError> {
        self.runs
            .lock()
            .expect("lock poisoned")
            .push((previous.map(ToString::to_string), current.to_string()));
        Ok(())
    }
}

/// An in-memory lease store honoring expiry.
#[derive(Debug, Default)]
pub struct MemoryLeaseStore {
    leases: Mutex<HashMap<String, (String, DateTime<Utc>)>>,
}

impl MemoryLeaseStore {
    fn claim(&self, key: &str, holder: &str, duration: Duration, renew_only: bool) -> LeaseGrant {
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

/// Every fake in one place, with concrete handles kept for assertions.
pub struct Fakes {
    /// Configuration I/O.
    pub config_io: Arc<MemoryConfigIo>,
    /// The shared control plane.
    pub plane: Arc<FakeControlPlane>,
    /// The dialer over [`Self::plane`].
    pub dialer: Arc<FakeDialer>,
    /// The shared store session.
    pub session: Arc<FakeStoreSession>,
    /// The opener over [`Self::session`].
    pub store: Arc<FakeStore>,
    /// The lease store.
    pub lease_store: Arc<MemoryLeaseStore>,
    /// Model operations.
    pub model_ops: Arc<FakeModelOps>,
    /// Host services.
    pub host_services: Arc<RecordingHostServices>,
    /// Container probe.
    pub containers: Arc<StaticContainerProbe>,
    /// Loop devices.
    pub loop_devices: Arc<RecordingLoopDevices>,
    /// Power actions.
    pub host_actions: Arc<RecordingHostActions>,
    /// Upgrade steps.
    pub upgrades: Arc<InstantUpgradeSteps>,
}

impl Fakes {
    /// Build the full fake set around `config`.
    #[must_use]
    pub fn new(config: AgentConfig) -> Self {
        let plane = Arc::new(FakeControlPlane::default());
        let session = Arc::new(FakeStoreSession::default());
        Self {
            config_io: Arc::new(MemoryConfigIo::new(config)),
            dialer: Arc::new(FakeDialer::new(plane.clone())),
            plane,
            store: Arc::new(FakeStore::new(session.clone())),
            session,
            lease_store: Arc::new(MemoryLeaseStore::default()),
            model_ops: Arc::new(FakeModelOps::default()),
            host_services: Arc::new(RecordingHostServices::default()),
            containers: Arc::new(StaticContainerProbe::default()),
            loop_devices: Arc::new(RecordingLoopDevices::default()),
            host_actions: Arc::new(RecordingHostActions::default()),
            upgrades: Arc::new(InstantUpgradeSteps::default()),
        }
    }

    /// A [`Collaborators`] view over the fakes.
    #[must_use]
    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            config_io: self.config_io.clone(),
            dialer: self.dialer.clone(),
            store: self.store.clone(),
            lease_store: self.lease_store.clone(),
            model_ops: self.model_ops.clone(),
            host_services: self.host_services.clone(),
            containers: self.containers.clone(),
            loop_devices: self.loop_devices.clone(),
            host_actions: self.host_actions.clone(),
            certs: None,
            upgrades: self.upgrades.clone(),
            model_poll_interval: Duration::from_millis(10),
            restart_delay: Duration::from_millis(10),
        }
    }
}
