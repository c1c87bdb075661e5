//! External collaborator interfaces.
//!
//! Everything the agent reaches outside its own process - the control
//! plane, the backing store, the lease store, host services, container
//! probes - is defined here as a narrow trait and gathered into one
//! [`Collaborators`] struct passed through construction. Production
//! wiring supplies the provider-specific clients; tests inject fakes.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleetd_core::config::{AgentConfig, ConfigError, ServingConfig};
use fleetd_core::models::{Life, ModelProvider, ModelUuid};
use fleetd_core::singular::LeaseStore;
use fleetd_core::tag::Tag;
use fleetd_core::watcher::Watcher;
use fleetd_core::worker::WorkerError;

use crate::restore::RestoreStatus;

/// An error from a host-level operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct HostError(pub String);

impl From<HostError> for WorkerError {
    fn from(err: HostError) -> Self {
        Self::Failed(err.0)
    }
}

/// A dialed control-plane connection.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Look up an entity's life; `None` once the record is gone.
    async fn entity_life(&self, tag: &Tag) -> Result<Option<Life>, WorkerError>;

    /// Whether a binary upgrade is pending for this agent.
    async fn pending_binary_upgrade(&self) -> Result<bool, WorkerError>;

    /// Block until the reboot coordinator reports that hosted units and
    /// containers are ready for this host to go down.
    async fn await_reboot_ready(&self) -> Result<(), WorkerError>;

    /// Pull the cluster's logging configuration and apply it to the
    /// local log forwarder.
    async fn sync_log_forwarding(&self) -> Result<(), WorkerError>;

    /// Refresh the host's authorized operator keys.
    async fn sync_authorized_keys(&self) -> Result<(), WorkerError>;

    /// Close the connection. Called only after every worker using the
    /// connection has terminated.
    async fn close(&self);
}

/// Dials control-plane connections.
#[async_trait]
pub trait ControlPlaneDialer: Send + Sync {
    /// Dial a host-scoped connection.
    async fn dial(&self, config: &AgentConfig) -> Result<Arc<dyn ControlPlane>, WorkerError>;

    /// Dial a model-scoped connection.
    async fn dial_model(
        &self,
        config: &AgentConfig,
        model: &ModelUuid,
    ) -> Result<Arc<dyn ControlPlane>, WorkerError>;
}

/// An open backing-store session.
#[async_trait]
pub trait StoreSession: Send + Sync {
    /// Watch the model list: batches of UUIDs whose state may have
    /// changed.
    fn watch_models(&self) -> Box<dyn Watcher<Vec<String>>>;

    /// Watch the restore-info record.
    fn watch_restore(&self) -> Box<dyn Watcher<RestoreStatus>>;

    /// A model's current life; `None` once its record is gone.
    async fn model_life(&self, uuid: &ModelUuid) -> Result<Option<Life>, WorkerError>;

    /// Close the session. Called only after every watcher and worker
    /// using the session has terminated.
    async fn close(&self);
}

/// Opens backing-store sessions on controller hosts.
#[async_trait]
pub trait StoreOpener: Send + Sync {
    /// One-time store initialization (service install, replica wiring).
    /// Guarded by the agent so it runs at most once per process.
    async fn ensure_ready(&self, config: &AgentConfig) -> Result<(), WorkerError>;

    /// Open the shared controller session.
    async fn open(&self, config: &AgentConfig) -> Result<Arc<dyn StoreSession>, WorkerError>;

    /// Open a model-scoped session.
    async fn open_model(
        &self,
        config: &AgentConfig,
        model: &ModelUuid,
    ) -> Result<Arc<dyn StoreSession>, WorkerError>;
}

/// Model maintenance operations, performed by per-model workers.
#[async_trait]
pub trait ModelOps: Send + Sync {
    /// One upkeep pass over an alive model.
    async fn cleanup_pass(&self, uuid: &ModelUuid) -> Result<(), WorkerError>;

    /// One undertaker step over a dying model: reap remaining resources
    /// and, when nothing is left, mark the model dead.
    async fn process_dying(&self, uuid: &ModelUuid) -> Result<(), WorkerError>;
}

/// Reads and writes the on-disk agent configuration.
pub trait AgentConfigIo: Send + Sync {
    /// Read the configuration from disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is unreadable or invalid.
    fn read(&self) -> Result<AgentConfig, ConfigError>;

    /// Persist the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    fn write(&self, config: &AgentConfig) -> Result<(), ConfigError>;
}

/// [`AgentConfigIo`] over a single file path.
#[derive(Debug, Clone)]
pub struct FileConfigIo {
    path: std::path::PathBuf,
}

impl FileConfigIo {
    /// Create a file-backed configuration I/O over `path`.
    #[must_use]
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl AgentConfigIo for FileConfigIo {
    fn read(&self) -> Result<AgentConfig, ConfigError> {
        AgentConfig::from_file(&self.path)
    }

    fn write(&self, config: &AgentConfig) -> Result<(), ConfigError> {
        config.to_file(&self.path)
    }
}

/// Host service-unit management.
pub trait HostServices: Send + Sync {
    /// Remove the named service unit.
    ///
    /// # Errors
    ///
    /// Returns an error if the unit cannot be removed.
    fn remove_service(&self, name: &str) -> Result<(), HostError>;
}

/// Container environment probes.
pub trait ContainerProbe: Send + Sync {
    /// Whether LXC containers can be hosted here.
    ///
    /// # Errors
    ///
    /// Returns an error if support cannot be determined.
    fn supports_lxc(&self) -> Result<bool, HostError>;

    /// Whether KVM containers can be hosted here.
    ///
    /// # Errors
    ///
    /// Returns an error if support cannot be determined.
    fn supports_kvm(&self) -> Result<bool, HostError>;

    /// Whether this agent itself runs inside a container.
    ///
    /// # Errors
    ///
    /// Returns an error if the probe fails.
    fn running_inside(&self) -> Result<bool, HostError>;
}

/// Loop-device housekeeping for containerized hosts.
pub trait LoopDeviceManager: Send + Sync {
    /// Detach loop devices backed by files under `data_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if any device cannot be detached.
    fn detach_loop_devices(&self, root_dir: &Path, data_dir: &Path) -> Result<(), HostError>;
}

/// Host power actions.
pub trait HostActions: Send + Sync {
    /// Schedule an immediate host reboot.
    ///
    /// # Errors
    ///
    /// Returns an error if the reboot cannot be scheduled.
    fn schedule_reboot(&self) -> Result<(), HostError>;

    /// Schedule an immediate host shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if the shutdown cannot be scheduled.
    fn schedule_shutdown(&self) -> Result<(), HostError>;
}

/// A reissued server certificate.
#[derive(Debug, Clone)]
pub struct ReissuedCert {
    /// PEM certificate.
    pub cert: String,
    /// PEM private key.
    pub private_key: String,
}

/// Serving-certificate inspection and reissue.
pub trait ServingCertManager: Send + Sync {
    /// The DNS names carried by a PEM certificate.
    ///
    /// # Errors
    ///
    /// Returns an error if the certificate cannot be parsed.
    fn dns_names(&self, cert_pem: &str) -> Result<Vec<String>, HostError>;

    /// Reissue the server certificate with the given DNS names.
    ///
    /// # Errors
    ///
    /// Returns an error if issuing fails.
    fn reissue(
        &self,
        serving: &ServingConfig,
        dns_names: &[String],
    ) -> Result<ReissuedCert, HostError>;
}

/// Runs the version-to-version upgrade steps.
#[async_trait]
pub trait UpgradeSteps: Send + Sync {
    /// Run every step between `previous` and `current`.
    async fn run(&self, previous: Option<&str>, current: &str) -> Result<(), WorkerError>;
}

/// Every external interface the agent needs, gathered for construction.
#[derive(Clone)]
pub struct Collaborators {
    /// Agent configuration I/O.
    pub config_io: Arc<dyn AgentConfigIo>,
    /// Control-plane dialer.
    pub dialer: Arc<dyn ControlPlaneDialer>,
    /// Backing-store opener.
    pub store: Arc<dyn StoreOpener>,
    /// Lease store for singular flags.
    pub lease_store: Arc<dyn LeaseStore>,
    /// Model maintenance operations.
    pub model_ops: Arc<dyn ModelOps>,
    /// Host service-unit management.
    pub host_services: Arc<dyn HostServices>,
    /// Container probes.
    pub containers: Arc<dyn ContainerProbe>,
    /// Loop-device housekeeping.
    pub loop_devices: Arc<dyn LoopDeviceManager>,
    /// Host power actions.
    pub host_actions: Arc<dyn HostActions>,
    /// Serving-certificate management; absent when the host cannot
    /// reissue certificates.
    pub certs: Option<Arc<dyn ServingCertManager>>,
    /// Upgrade-step runner.
    pub upgrades: Arc<dyn UpgradeSteps>,
    /// How often per-model workers poll and tick.
    pub model_poll_interval: Duration,
    /// Restart delay applied by every runner the agent builds.
    pub restart_delay: Duration,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("certs", &self.certs.is_some())
            .field("model_poll_interval", &self.model_poll_interval)
            .finish_non_exhaustive()
    }
}

/// [`ModelProvider`] over a store session.
pub struct SessionModelProvider {
    session: Arc<dyn StoreSession>,
}

impl SessionModelProvider {
    /// Wrap a session as a model provider.
    #[must_use]
    pub fn new(session: Arc<dyn StoreSession>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl ModelProvider for SessionModelProvider {
    async fn model_life(&self, uuid: &ModelUuid) -> Result<Option<Life>, WorkerError> {
        self.session.model_life(uuid).await
    }
}
