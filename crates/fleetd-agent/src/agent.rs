//! Agent lifecycle.
//!
//! The top-level process: read the configuration, make sure the serving
//! certificate carries the required service DNS names, create the
//! upgrade gates and the well-known command symlinks, then run the root
//! worker set - `api`, `state-starter`, and `termination` - until a
//! terminal error arrives. Lifecycle intents are turned into host
//! actions: terminate uninstalls when the marker file is present, reboot
//! and shutdown wait for the reboot coordinator before scheduling the
//! host action.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use fleetd_core::config::{AgentConfig, ConfigError};
use fleetd_core::gate::Gate;
use fleetd_core::runner::{self, Runner, RunnerConfig, RunnerControl, WorkerFactory};
use fleetd_core::tag::Tag;
use fleetd_core::value::{ValueCell, ValueWatch};
use fleetd_core::worker::{Intent, WorkerError, WorkerHandle};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, info, warn};

use crate::collaborators::{Collaborators, HostError, StoreOpener};
use crate::install::UninstallError;
use crate::restore::{RestoreError, RestoreMode};
use crate::{api, controller, install};

/// The version this binary upgrades hosts to.
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// DNS names the serving certificate must carry for in-cluster clients.
pub const REQUIRED_DNS_NAMES: &[&str] = &["local", "fleet-api", "fleet-store"];

/// Shared lifecycle state: the configuration cell, the upgrade gates,
/// restore mode, and the one-time store-initialization guard.
pub struct AgentState {
    tag: Tag,
    config: ValueCell<AgentConfig>,
    upgrade_complete: Gate,
    initial_upgrade_check: Gate,
    restore: Mutex<RestoreMode>,
    store_ready: tokio::sync::OnceCell<()>,
}

impl AgentState {
    /// Create the state around an initial configuration.
    #[must_use]
    pub fn new(config: AgentConfig) -> Self {
        Self {
            tag: config.tag.clone(),
            config: ValueCell::with_value(config),
            upgrade_complete: Gate::new(),
            initial_upgrade_check: Gate::new(),
            restore: Mutex::new(RestoreMode::default()),
            store_ready: tokio::sync::OnceCell::new(),
        }
    }

    /// This agent's identity tag.
    #[must_use]
    pub const fn tag(&self) -> &Tag {
        &self.tag
    }

    /// The current configuration.
    ///
    /// # Panics
    ///
    /// Never in practice: the cell is seeded at construction.
    #[must_use]
    pub fn current_config(&self) -> AgentConfig {
        self.config
            .get()
            .expect("configuration cell is seeded at construction")
    }

    /// Publish an updated configuration.
    pub fn set_config(&self, config: AgentConfig) {
        self.config.set(config);
    }

    /// Observe configuration changes; the first observation yields the
    /// current configuration.
    #[must_use]
    pub fn config_watch(&self) -> ValueWatch<AgentConfig> {
        self.config.watch()
    }

    /// The gate opened when all upgrade steps have completed.
    #[must_use]
    pub const fn upgrade_complete(&self) -> &Gate {
        &self.upgrade_complete
    }

    /// The gate opened when no binary upgrade is immediately pending.
    #[must_use]
    pub const fn initial_upgrade_check(&self) -> &Gate {
        &self.initial_upgrade_check
    }

    /// Whether upgrade steps are still running.
    #[must_use]
    pub fn is_upgrade_running(&self) -> bool {
        !self.upgrade_complete.is_open()
    }

    /// Whether the initial binary-upgrade check is still outstanding.
    #[must_use]
    pub fn is_upgrade_pending(&self) -> bool {
        !self.initial_upgrade_check.is_open()
    }

    /// Whether a restore is about to begin.
    #[must_use]
    pub fn is_restore_preparing(&self) -> bool {
        self.restore.lock().expect("lock poisoned").phase()
            == crate::restore::RestorePhase::Preparing
    }

    /// Whether a restore is running.
    #[must_use]
    pub fn is_restore_running(&self) -> bool {
        self.restore.lock().expect("lock poisoned").phase()
            == crate::restore::RestorePhase::Running
    }

    /// Enter restore-preparing mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the agent is already in restore mode.
    pub fn restore_prepare(&self) -> Result<(), RestoreError> {
        self.restore.lock().expect("lock poisoned").prepare()
    }

    /// Enter restore-running mode.
    ///
    /// # Errors
    ///
    /// Returns an error unless the agent is preparing a restore.
    pub fn restore_begin(&self) -> Result<(), RestoreError> {
        self.restore.lock().expect("lock poisoned").begin()
    }

    /// Leave restore mode.
    pub fn restore_end(&self) {
        self.restore.lock().expect("lock poisoned").end();
    }

    /// Run one-time store initialization, at most once per process.
    ///
    /// # Errors
    ///
    /// Returns the initialization error; a later call retries.
    pub async fn ensure_store_ready(&self, store: &Arc<dyn StoreOpener>) -> Result<(), WorkerError> {
        let config = self.current_config();
        self.store_ready
            .get_or_try_init(|| store.ensure_ready(&config))
            .await
            .map(|()| ())
    }
}

impl std::fmt::Debug for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentState")
            .field("tag", &self.tag)
            .field("upgrade_complete", &self.upgrade_complete.is_open())
            .field("initial_upgrade_check", &self.initial_upgrade_check.is_open())
            .finish_non_exhaustive()
    }
}

/// Errors terminating the agent process.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// The configuration could not be read or is invalid.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup could not complete.
    #[error("startup failed: {0}")]
    Startup(String),

    /// Symlink or marker maintenance failed.
    #[error("install maintenance failed: {0}")]
    Install(#[from] std::io::Error),

    /// The worker tree terminated with an unrecoverable error.
    #[error(transparent)]
    Workers(WorkerError),

    /// Uninstall ran but some steps failed.
    #[error(transparent)]
    Uninstall(#[from] UninstallError),

    /// A host action could not be scheduled.
    #[error("host action failed: {0}")]
    Host(#[from] HostError),
}

/// The process exit code for a finished run: zero for clean exits and
/// scheduled host actions, non-zero otherwise.
#[must_use]
pub fn exit_code(result: &Result<(), AgentError>) -> i32 {
    i32::from(result.is_err())
}

/// The host agent.
#[derive(Debug)]
pub struct Agent {
    deps: Collaborators,
    root_dir: PathBuf,
    binary_path: Option<PathBuf>,
    state: Mutex<Option<Arc<AgentState>>>,
}

impl Agent {
    /// Create an agent over the given collaborators.
    #[must_use]
    pub fn new(deps: Collaborators) -> Self {
        Self {
            deps,
            root_dir: PathBuf::from("/"),
            binary_path: None,
            state: Mutex::new(None),
        }
    }

    /// The lifecycle state, once [`run`](Self::run) has created it. The
    /// in-process API server reads admission inputs through this.
    #[must_use]
    pub fn state(&self) -> Option<Arc<AgentState>> {
        self.state.lock().expect("lock poisoned").clone()
    }

    /// Root every host path under `root_dir` instead of `/`.
    #[must_use]
    pub fn with_root_dir(mut self, root_dir: impl Into<PathBuf>) -> Self {
        self.root_dir = root_dir.into();
        self
    }

    /// Use `binary` as the symlink target instead of the running binary.
    #[must_use]
    pub fn with_binary_path(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary_path = Some(binary.into());
        self
    }

    /// Run the agent to completion.
    ///
    /// # Errors
    ///
    /// Returns an error for unrecoverable startup failures, worker-tree
    /// failures that are not lifecycle intents, and failed uninstalls or
    /// host actions.
    pub async fn run(&self) -> Result<(), AgentError> {
        let mut config = self.deps.config_io.read()?;
        config.validate()?;
        if !matches!(config.tag, Tag::Host(_)) {
            return Err(AgentError::Startup(format!(
                "agent tag must be a host tag, not {:?}",
                config.tag.kind()
            )));
        }
        info!(tag = %config.tag, version = AGENT_VERSION, "host agent starting");

        // The certificate must be right before anything can restart the
        // store against it.
        self.ensure_serving_cert(&mut config)?;

        let state = Arc::new(AgentState::new(config.clone()));
        *self.state.lock().expect("lock poisoned") = Some(state.clone());

        let binary = match &self.binary_path {
            Some(binary) => binary.clone(),
            None => std::env::current_exe()?,
        };
        install::create_symlinks(&self.root_dir, &binary)?;
        self.log_container_support();

        let mut root = Runner::new(RunnerConfig::intents_fatal(self.deps.restart_delay));
        let control = root.control();
        let _ = control.start_worker(
            "api",
            api::api_worker_factory(state.clone(), self.deps.clone()),
        );
        let _ = control.start_worker(
            "state-starter",
            state_starter_factory(state.clone(), self.deps.clone(), control.clone()),
        );
        let _ = control.start_worker("termination", termination_factory());
        info!("top-level workers started");

        match root.wait().await {
            Ok(()) => Ok(()),
            Err(WorkerError::Intent(Intent::Terminate)) => {
                info!("terminating agent");
                let config = state.current_config();
                install::uninstall_if_marked(&config, &self.root_dir, &self.deps)?;
                Ok(())
            }
            Err(WorkerError::Intent(intent)) => self.execute_host_action(&state, intent).await,
            Err(err) => Err(AgentError::Workers(err)),
        }
    }

    /// Reboot or shut the host down: reopen a short-lived control-plane
    /// connection, wait for the reboot coordinator, then schedule the
    /// action and exit cleanly.
    async fn execute_host_action(
        &self,
        state: &Arc<AgentState>,
        intent: Intent,
    ) -> Result<(), AgentError> {
        info!(%intent, "waiting for the reboot coordinator");
        let config = state.current_config();
        let conn = self
            .deps
            .dialer
            .dial(&config)
            .await
            .map_err(AgentError::Workers)?;
        let ready = conn.await_reboot_ready().await;
        conn.close().await;
        ready.map_err(AgentError::Workers)?;

        info!(%intent, "scheduling host action");
        match intent {
            Intent::Reboot => self.deps.host_actions.schedule_reboot()?,
            Intent::Shutdown => self.deps.host_actions.schedule_shutdown()?,
            Intent::Terminate => {}
        }
        Ok(())
    }

    fn ensure_serving_cert(&self, config: &mut AgentConfig) -> Result<(), AgentError> {
        let Some(serving) = config.serving.clone() else {
            return Ok(());
        };
        if serving.ca_private_key.is_empty() {
            // Without the CA key we cannot reissue anything.
            return Ok(());
        }
        let Some(certs) = &self.deps.certs else {
            debug!("no certificate manager configured; skipping DNS name check");
            return Ok(());
        };

        let names = certs
            .dns_names(&serving.cert)
            .map_err(|err| AgentError::Startup(format!("cannot parse serving certificate: {err}")))?;
        let missing: Vec<&str> = REQUIRED_DNS_NAMES
            .iter()
            .filter(|required| !names.iter().any(|name| name == *required))
            .copied()
            .collect();
        if missing.is_empty() {
            return Ok(());
        }

        info!(?missing, "serving certificate missing required DNS names; reissuing");
        let mut all = names;
        all.extend(missing.into_iter().map(ToString::to_string));
        let reissued = certs
            .reissue(&serving, &all)
            .map_err(|err| AgentError::Startup(format!("cannot reissue serving certificate: {err}")))?;
        if let Some(serving) = config.serving.as_mut() {
            serving.cert = reissued.cert;
            serving.private_key = reissued.private_key;
        }
        self.deps.config_io.write(config)?;
        Ok(())
    }

    fn log_container_support(&self) {
        match self.deps.containers.supports_lxc() {
            Ok(true) => info!("lxc containers supported"),
            Ok(false) => debug!("lxc containers not supported"),
            Err(error) => warn!(%error, "no lxc containers possible"),
        }
        match self.deps.containers.supports_kvm() {
            Ok(true) => info!("kvm containers supported"),
            Ok(false) => debug!("kvm containers not supported"),
            Err(error) => warn!(%error, "no kvm containers possible"),
        }
    }
}

/// Factory for the state-starter: watches the configuration and starts
/// or stops the `state` worker as the serving section appears and
/// disappears. Start and stop are both idempotent on the runner, so the
/// starter just reasserts the desired state on every change.
fn state_starter_factory(
    state: Arc<AgentState>,
    deps: Collaborators,
    control: RunnerControl,
) -> WorkerFactory {
    runner::factory(move || {
        let state = state.clone();
        let deps = deps.clone();
        let control = control.clone();
        async move {
            Ok(WorkerHandle::spawn(move |stop| async move {
                let mut watch = state.config_watch();
                loop {
                    tokio::select! {
                        () = stop.cancelled() => return Ok(()),
                        changed = watch.next() => {
                            let Some(config) = changed else {
                                return Err(WorkerError::Failed(
                                    "configuration cell closed".to_string(),
                                ));
                            };
                            let outcome = if config.is_controller() {
                                control.start_worker(
                                    "state",
                                    controller::state_worker_factory(
                                        state.clone(),
                                        deps.clone(),
                                    ),
                                )
                            } else {
                                control.stop_worker("state")
                            };
                            if outcome.is_err() {
                                // The root runner is shutting down.
                                return Ok(());
                            }
                        }
                    }
                }
            }))
        }
    })
}

/// Factory for the termination worker: turns the OS termination signal
/// into the terminate intent.
fn termination_factory() -> WorkerFactory {
    runner::factory(|| async {
        let mut term = signal(SignalKind::terminate())
            .map_err(|err| WorkerError::Failed(format!("cannot listen for SIGTERM: {err}")))?;
        Ok(WorkerHandle::spawn(move |stop| async move {
            tokio::select! {
                () = stop.cancelled() => Ok(()),
                _ = term.recv() => {
                    info!("termination signal received");
                    Err(WorkerError::Intent(Intent::Terminate))
                }
            }
        }))
    })
}
