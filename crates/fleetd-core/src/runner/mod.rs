//! Worker runner module.
//!
//! A [`Runner`] supervises a named, mutable set of workers with
//! restart-on-failure. The runner is an actor: a single task owns the
//! authoritative child table, and a clonable [`RunnerControl`] carries
//! start/stop requests to it over a channel. Children that need to start
//! siblings are handed a control, never a reference to the runner.
//!
//! Policies are fixed at construction: a fatal-error predicate (a fatal
//! child exit kills the runner and all its children), an importance
//! comparator (the runner's terminal error is the most important error
//! among children that have exited), and a restart delay.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::worker::{self, WorkerError, WorkerHandle, WorkerResult};

/// Default delay between a child's failure and its restart.
pub const RESTART_DELAY: Duration = Duration::from_secs(3);

/// How long a child may take to honor a stop request before the runner
/// starts complaining. Stops are cooperative; the runner never
/// force-kills a task.
pub const STOP_GRACE: Duration = Duration::from_secs(30);

/// A thunk producing a fresh [`WorkerHandle`] for each (re)start of a
/// named worker.
pub type WorkerFactory =
    Arc<dyn Fn() -> BoxFuture<'static, Result<WorkerHandle, WorkerError>> + Send + Sync>;

/// Wrap an async closure as a [`WorkerFactory`].
pub fn factory<F, Fut>(f: F) -> WorkerFactory
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<WorkerHandle, WorkerError>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()))
}

/// Predicate deciding whether a child's terminal error kills the runner.
pub type FatalPredicate = Arc<dyn Fn(&WorkerError) -> bool + Send + Sync>;

/// Comparator returning `true` when the first error is strictly more
/// important than the second.
pub type ImportanceCmp = Arc<dyn Fn(&WorkerError, &WorkerError) -> bool + Send + Sync>;

/// Policies governing a runner, fixed at construction.
#[derive(Clone)]
pub struct RunnerConfig {
    /// Fatal-error predicate.
    pub is_fatal: FatalPredicate,
    /// Importance comparator for choosing the runner's terminal error.
    pub more_important: ImportanceCmp,
    /// Delay between a child's failure and its restart.
    pub restart_delay: Duration,
}

impl RunnerConfig {
    /// Fatal on lifecycle intents only. The policy of the root runner.
    #[must_use]
    pub fn intents_fatal(restart_delay: Duration) -> Self {
        Self {
            is_fatal: Arc::new(WorkerError::is_intent),
            more_important: Arc::new(worker::more_important),
            restart_delay,
        }
    }

    /// Fatal on lifecycle intents and lost connections. The policy of
    /// runners whose children share a dialed connection: losing it tears
    /// the whole set down so the owner can redial.
    #[must_use]
    pub fn connection_fatal(restart_delay: Duration) -> Self {
        Self {
            is_fatal: Arc::new(|err| {
                err.is_intent() || matches!(err, WorkerError::Disconnected(_))
            }),
            more_important: Arc::new(worker::more_important),
            restart_delay,
        }
    }

    /// Nothing is fatal; every failed child is restarted.
    #[must_use]
    pub fn never_fatal(restart_delay: Duration) -> Self {
        Self {
            is_fatal: Arc::new(|_| false),
            more_important: Arc::new(worker::more_important),
            restart_delay,
        }
    }
}

impl std::fmt::Debug for RunnerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerConfig")
            .field("restart_delay", &self.restart_delay)
            .finish_non_exhaustive()
    }
}

/// Errors returned by runner control operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunnerError {
    /// The runner is shutting down and no longer accepts requests.
    #[error("runner is stopping")]
    Stopping,
}

impl From<RunnerError> for WorkerError {
    fn from(err: RunnerError) -> Self {
        Self::Failed(err.to_string())
    }
}

enum Cmd {
    Start { name: String, factory: WorkerFactory },
    Stop { name: String },
}

enum Evt {
    Started {
        name: String,
        epoch: u64,
        token: CancellationToken,
    },
    StartFailed {
        name: String,
        epoch: u64,
        error: WorkerError,
    },
    Done {
        name: String,
        epoch: u64,
        result: WorkerResult,
    },
    RestartDue {
        name: String,
        epoch: u64,
    },
    StopStalled {
        name: String,
        epoch: u64,
    },
}

/// Clonable handle for submitting start/stop requests to a runner.
#[derive(Clone)]
pub struct RunnerControl {
    cmd: mpsc::UnboundedSender<Cmd>,
}

impl RunnerControl {
    /// Register and start the named worker. A no-op if the name is
    /// already running; a worker previously marked stopped is restarted
    /// with the new factory once its old incarnation has terminated.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::Stopping`] if the runner is shutting down.
    pub fn start_worker(
        &self,
        name: impl Into<String>,
        factory: WorkerFactory,
    ) -> Result<(), RunnerError> {
        self.cmd
            .send(Cmd::Start {
                name: name.into(),
                factory,
            })
            .map_err(|_| RunnerError::Stopping)
    }

    /// Mark the named worker stopped and request its current incarnation
    /// to stop. Idempotent; unknown names are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::Stopping`] if the runner is shutting down.
    pub fn stop_worker(&self, name: impl Into<String>) -> Result<(), RunnerError> {
        self.cmd
            .send(Cmd::Stop { name: name.into() })
            .map_err(|_| RunnerError::Stopping)
    }
}

impl std::fmt::Debug for RunnerControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerControl").finish_non_exhaustive()
    }
}

/// Supervisor of a named set of workers.
#[derive(Debug)]
pub struct Runner {
    cmd: mpsc::UnboundedSender<Cmd>,
    stop: CancellationToken,
    join: Option<JoinHandle<WorkerResult>>,
    result: Option<WorkerResult>,
}

impl Runner {
    /// Create a runner and start its supervision task.
    #[must_use]
    pub fn new(config: RunnerConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (evt_tx, evt_rx) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();

        let actor = Actor {
            config,
            children: HashMap::new(),
            evt_tx,
            stop: stop.clone(),
            stopping: false,
            fatal_seen: false,
            worst: None,
        };
        let join = tokio::spawn(actor.run(cmd_rx, evt_rx));

        Self {
            cmd: cmd_tx,
            stop,
            join: Some(join),
            result: None,
        }
    }

    /// A control handle for this runner.
    #[must_use]
    pub fn control(&self) -> RunnerControl {
        RunnerControl {
            cmd: self.cmd.clone(),
        }
    }

    /// See [`RunnerControl::start_worker`].
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::Stopping`] if the runner is shutting down.
    pub fn start_worker(
        &self,
        name: impl Into<String>,
        factory: WorkerFactory,
    ) -> Result<(), RunnerError> {
        self.control().start_worker(name, factory)
    }

    /// See [`RunnerControl::stop_worker`].
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::Stopping`] if the runner is shutting down.
    pub fn stop_worker(&self, name: impl Into<String>) -> Result<(), RunnerError> {
        self.control().stop_worker(name)
    }

    /// Request termination of the runner. Stop is propagated to every
    /// child; [`wait`](Self::wait) returns once all of them are gone.
    pub fn kill(&self) {
        self.stop.cancel();
    }

    /// A clone of the runner's stop token.
    #[must_use]
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Block until the runner has terminated and return its terminal
    /// error. May be called again after completion; the result is cached.
    pub async fn wait(&mut self) -> WorkerResult {
        if self.result.is_none() {
            if let Some(join) = self.join.as_mut() {
                let result = worker::join_result(join.await);
                self.join = None;
                self.result = Some(result);
            }
        }
        self.result.clone().unwrap_or(Ok(()))
    }

    /// Convert the runner into a plain [`WorkerHandle`] so it can itself
    /// be supervised as a child of another runner.
    #[must_use]
    pub fn into_handle(mut self) -> WorkerHandle {
        let join = match self.join.take() {
            Some(join) => join,
            None => {
                let result = self.result.clone().unwrap_or(Ok(()));
                tokio::spawn(async move { result })
            }
        };
        WorkerHandle::from_parts(self.stop.clone(), join)
    }
}

enum Phase {
    /// Factory invocation in flight.
    Starting,
    /// Live, with the current incarnation's stop token.
    Running(CancellationToken),
    /// Stop requested; waiting for the incarnation to terminate.
    Stopping,
    /// Terminated with an error; restart timer pending.
    Delayed,
}

struct Child {
    factory: WorkerFactory,
    desired_running: bool,
    phase: Phase,
    epoch: u64,
}

struct Actor {
    config: RunnerConfig,
    children: HashMap<String, Child>,
    evt_tx: mpsc::UnboundedSender<Evt>,
    stop: CancellationToken,
    stopping: bool,
    fatal_seen: bool,
    worst: Option<WorkerError>,
}

async fn recv_cmd(rx: &mut Option<mpsc::UnboundedReceiver<Cmd>>) -> Option<Cmd> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl Actor {
    async fn run(
        mut self,
        cmd_rx: mpsc::UnboundedReceiver<Cmd>,
        mut evt_rx: mpsc::UnboundedReceiver<Evt>,
    ) -> WorkerResult {
        let stop = self.stop.clone();
        let mut cmd_rx = Some(cmd_rx);

        loop {
            if self.stopping {
                // Closing the command channel makes further start/stop
                // requests fail with RunnerError::Stopping.
                cmd_rx = None;
                if self.children.is_empty() {
                    break;
                }
            }
            tokio::select! {
                () = stop.cancelled(), if !self.stopping => {
                    self.initiate_stop();
                }
                cmd = recv_cmd(&mut cmd_rx), if cmd_rx.is_some() => {
                    match cmd {
                        Some(cmd) => self.handle_cmd(cmd),
                        None => cmd_rx = None,
                    }
                }
                evt = evt_rx.recv() => {
                    if let Some(evt) = evt {
                        self.handle_evt(evt);
                    }
                }
            }
        }

        if self.fatal_seen {
            Err(self
                .worst
                .unwrap_or_else(|| WorkerError::Failed("runner stopped fatally".to_string())))
        } else {
            Ok(())
        }
    }

    fn handle_cmd(&mut self, cmd: Cmd) {
        match cmd {
            Cmd::Start { name, factory } => self.handle_start(name, factory),
            Cmd::Stop { name } => self.handle_stop(&name),
        }
    }

    fn handle_start(&mut self, name: String, factory: WorkerFactory) {
        if self.stopping {
            return;
        }
        if let Some(child) = self.children.get_mut(&name) {
            if child.desired_running {
                // Already running (or scheduled): no-op.
                return;
            }
            // Previously stopped but still terminating: restart with the
            // new factory once the old incarnation is gone.
            child.desired_running = true;
            child.factory = factory;
            debug!(worker = %name, "start requested for stopping worker; will restart");
            return;
        }

        self.children.insert(
            name.clone(),
            Child {
                factory,
                desired_running: true,
                phase: Phase::Starting,
                epoch: 0,
            },
        );
        self.spawn_child(&name);
    }

    fn handle_stop(&mut self, name: &str) {
        let (remove, stopping_epoch) = {
            let Some(child) = self.children.get_mut(name) else {
                return;
            };
            child.desired_running = false;
            match &child.phase {
                Phase::Running(token) => {
                    debug!(worker = %name, "stopping worker");
                    let token = token.clone();
                    token.cancel();
                    child.phase = Phase::Stopping;
                    (false, Some(child.epoch))
                }
                // No live incarnation; forget the pending restart.
                Phase::Delayed => (true, None),
                Phase::Starting | Phase::Stopping => (false, None),
            }
        };
        if let Some(epoch) = stopping_epoch {
            self.watch_stop(name, epoch);
        }
        if remove {
            self.children.remove(name);
        }
    }

    fn handle_evt(&mut self, evt: Evt) {
        match evt {
            Evt::Started { name, epoch, token } => self.handle_started(&name, epoch, token),
            Evt::StartFailed { name, epoch, error } => {
                self.handle_start_failed(&name, epoch, &error);
            }
            Evt::Done {
                name,
                epoch,
                result,
            } => self.handle_done(&name, epoch, result),
            Evt::RestartDue { name, epoch } => self.handle_restart_due(&name, epoch),
            Evt::StopStalled { name, epoch } => self.handle_stop_stalled(&name, epoch),
        }
    }

    fn handle_stop_stalled(&self, name: &str, epoch: u64) {
        let stalled = self
            .children
            .get(name)
            .is_some_and(|child| child.epoch == epoch && matches!(child.phase, Phase::Stopping));
        if stalled {
            warn!(
                worker = %name, grace = ?STOP_GRACE,
                "worker has not honored its stop request; still waiting",
            );
        }
    }

    fn handle_started(&mut self, name: &str, epoch: u64, token: CancellationToken) {
        let stopping = self.stopping;
        let Some(child) = self.children.get_mut(name) else {
            token.cancel();
            return;
        };
        if child.epoch != epoch {
            token.cancel();
            return;
        }
        if stopping || !child.desired_running {
            token.cancel();
            child.phase = Phase::Stopping;
            return;
        }
        debug!(worker = %name, "started worker");
        child.phase = Phase::Running(token);
    }

    fn handle_start_failed(&mut self, name: &str, epoch: u64, error: &WorkerError) {
        let (current_epoch, desired_running) = match self.children.get(name) {
            Some(child) => (child.epoch, child.desired_running),
            None => return,
        };
        if current_epoch != epoch {
            return;
        }
        if self.stopping || !desired_running {
            self.children.remove(name);
            return;
        }
        // A factory error is always a non-fatal restart.
        warn!(worker = %name, %error, "failed to start worker; retrying");
        if let Some(child) = self.children.get_mut(name) {
            child.phase = Phase::Delayed;
        }
        self.schedule_restart(name, epoch);
    }

    fn handle_done(&mut self, name: &str, epoch: u64, result: WorkerResult) {
        let (current_epoch, desired_running, was_stopping) = match self.children.get(name) {
            Some(child) => (
                child.epoch,
                child.desired_running,
                matches!(child.phase, Phase::Stopping),
            ),
            None => return,
        };
        if current_epoch != epoch {
            return;
        }

        if let Err(error) = &result {
            self.record_error(error.clone());
        }

        match result {
            // Fatal errors count even from a deliberately stopped child.
            Err(error) if !self.stopping && (self.config.is_fatal)(&error) => {
                info!(worker = %name, %error, "fatal worker error; stopping runner");
                self.fatal_seen = true;
                self.children.remove(name);
                self.initiate_stop();
            }
            _ if self.stopping || !desired_running => {
                debug!(worker = %name, "stopped worker");
                self.children.remove(name);
            }
            // Started again while the old incarnation was terminating:
            // run the new factory now.
            _ if was_stopping => {
                debug!(worker = %name, "restarting worker after stop");
                self.spawn_child(name);
            }
            Ok(()) => {
                debug!(worker = %name, "worker finished");
                self.children.remove(name);
            }
            Err(WorkerError::RestartRequested) => {
                debug!(worker = %name, "worker requested immediate restart");
                self.spawn_child(name);
            }
            Err(error) => {
                warn!(
                    worker = %name, %error, delay = ?self.config.restart_delay,
                    "worker exited; restarting after delay",
                );
                if let Some(child) = self.children.get_mut(name) {
                    child.phase = Phase::Delayed;
                }
                self.schedule_restart(name, epoch);
            }
        }
    }

    fn handle_restart_due(&mut self, name: &str, epoch: u64) {
        let respawn = match self.children.get(name) {
            Some(child) => {
                child.epoch == epoch
                    && child.desired_running
                    && !self.stopping
                    && matches!(child.phase, Phase::Delayed)
            }
            None => false,
        };
        if respawn {
            self.spawn_child(name);
        }
    }

    fn record_error(&mut self, error: WorkerError) {
        let replace = match &self.worst {
            Some(current) => (self.config.more_important)(&error, current),
            None => true,
        };
        if replace {
            self.worst = Some(error);
        }
    }

    fn initiate_stop(&mut self) {
        self.stopping = true;
        let names: Vec<String> = self.children.keys().cloned().collect();
        for name in names {
            let (remove, stopping_epoch) = {
                let Some(child) = self.children.get_mut(&name) else {
                    continue;
                };
                match &child.phase {
                    Phase::Running(token) => {
                        let token = token.clone();
                        token.cancel();
                        child.phase = Phase::Stopping;
                        (false, Some(child.epoch))
                    }
                    Phase::Delayed => (true, None),
                    Phase::Starting | Phase::Stopping => (false, None),
                }
            };
            if let Some(epoch) = stopping_epoch {
                self.watch_stop(&name, epoch);
            }
            if remove {
                self.children.remove(&name);
            }
        }
    }

    fn schedule_restart(&self, name: &str, epoch: u64) {
        let evt = self.evt_tx.clone();
        let name = name.to_string();
        let delay = self.config.restart_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = evt.send(Evt::RestartDue { name, epoch });
        });
    }

    fn watch_stop(&self, name: &str, epoch: u64) {
        let evt = self.evt_tx.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(STOP_GRACE).await;
            let _ = evt.send(Evt::StopStalled { name, epoch });
        });
    }

    /// Spawn a new incarnation of the named child. The factory runs on
    /// its own task so the actor never blocks on worker construction.
    fn spawn_child(&mut self, name: &str) {
        let (epoch, factory) = {
            let Some(child) = self.children.get_mut(name) else {
                return;
            };
            child.epoch += 1;
            child.phase = Phase::Starting;
            (child.epoch, child.factory.clone())
        };

        let evt = self.evt_tx.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            match factory().await {
                Ok(handle) => {
                    let (token, join) = handle.into_parts();
                    let _ = evt.send(Evt::Started {
                        name: name.clone(),
                        epoch,
                        token,
                    });
                    let result = worker::join_result(join.await);
                    let _ = evt.send(Evt::Done {
                        name,
                        epoch,
                        result,
                    });
                }
                Err(error) => {
                    let _ = evt.send(Evt::StartFailed { name, epoch, error });
                }
            }
        });
    }
}
