//! Dependency engine module.
//!
//! The engine turns a declarative graph of named manifolds into a
//! self-healing set of workers. A [`Manifold`] declares its inputs, an
//! async start function over a typed resource [`Context`], and optionally
//! a filter over its terminal errors. The engine starts each manifold
//! once all of its inputs are running, republishes resources, and bounces
//! dependents whenever one of their inputs restarts: if A depends on B,
//! A is never running while B is not, and a restart of B stops A first.

mod context;
pub mod flag;

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use context::{Context, Resource};

use crate::runner::{FatalPredicate, ImportanceCmp};
use crate::worker::{self, WorkerError, WorkerHandle, WorkerResult};

/// The outcome of a manifold start: the worker to supervise and an
/// optional resource published to dependents while the worker is live.
#[derive(Debug)]
pub struct StartedWorker {
    handle: WorkerHandle,
    resource: Option<Resource>,
}

impl StartedWorker {
    /// A started worker that publishes no resource.
    #[must_use]
    pub const fn new(handle: WorkerHandle) -> Self {
        Self {
            handle,
            resource: None,
        }
    }

    /// A started worker publishing `resource` to dependents.
    #[must_use]
    pub fn with_resource<T: Send + Sync + 'static>(handle: WorkerHandle, resource: T) -> Self {
        Self {
            handle,
            resource: Some(Arc::new(resource)),
        }
    }
}

type StartFn =
    Arc<dyn Fn(Context) -> BoxFuture<'static, Result<StartedWorker, WorkerError>> + Send + Sync>;
type FilterFn = Arc<dyn Fn(WorkerError) -> WorkerError + Send + Sync>;

/// A declarative worker template: inputs, a start function, and an
/// optional terminal-error filter.
#[derive(Clone)]
pub struct Manifold {
    pub(crate) inputs: Vec<String>,
    pub(crate) start: StartFn,
    pub(crate) filter: Option<FilterFn>,
}

impl Manifold {
    /// Declare a manifold with the given inputs and start function.
    pub fn new<I, S, F, Fut>(inputs: I, start: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<StartedWorker, WorkerError>> + Send + 'static,
    {
        Self {
            inputs: inputs.into_iter().map(Into::into).collect(),
            start: Arc::new(move |ctx| Box::pin(start(ctx))),
            filter: None,
        }
    }

    /// Attach a terminal-error filter, applied before the engine reacts
    /// to the manifold's exit. Filtering to [`WorkerError::Unmet`] turns
    /// an exit into a clean bounce.
    #[must_use]
    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(WorkerError) -> WorkerError + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// A manifold whose worker is idle and whose only purpose is to
    /// publish a constant resource.
    pub fn value<T: Clone + Send + Sync + 'static>(value: T) -> Self {
        Self::new(Vec::<String>::new(), move |_ctx| {
            let value = value.clone();
            async move { Ok(StartedWorker::with_resource(WorkerHandle::idle(), value)) }
        })
    }

    /// The manifold's declared inputs.
    #[must_use]
    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }
}

impl std::fmt::Debug for Manifold {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manifold")
            .field("inputs", &self.inputs)
            .field("filtered", &self.filter.is_some())
            .finish()
    }
}

/// Lifecycle state of an installed manifold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifoldStatus {
    /// Not running; waiting for inputs or a retry.
    Stopped,
    /// Start function in flight.
    Starting,
    /// Live; its resource (if any) is available to dependents.
    Running,
    /// Stop requested; waiting for termination.
    Stopping,
}

impl std::fmt::Display for ManifoldStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
        }
    }
}

/// Observability snapshot for one manifold.
#[derive(Debug, Clone)]
pub struct ManifoldReport {
    /// Current lifecycle state.
    pub status: ManifoldStatus,
    /// The most recent start or terminal error, if any.
    pub error: Option<String>,
    /// Whether every declared input is currently running.
    pub inputs_satisfied: bool,
}

/// Errors from [`Engine::install`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InstallError {
    /// A manifold with this name is already installed.
    #[error("manifold {0:?} is already installed")]
    AlreadyInstalled(String),

    /// Installing the manifold would create a dependency cycle.
    #[error("manifold {0:?} would introduce a dependency cycle")]
    Cycle(String),

    /// The engine is shutting down.
    #[error("engine is stopping")]
    Stopping,
}

/// Policies governing an engine, fixed at construction.
#[derive(Clone)]
pub struct EngineConfig {
    /// Child errors satisfying this predicate stop the whole engine.
    pub is_fatal: FatalPredicate,
    /// Importance comparator for the engine's terminal error.
    pub more_important: ImportanceCmp,
    /// Back-off after a manifold fails.
    pub error_delay: Duration,
    /// Back-off after a clean bounce before the manifold restarts.
    pub bounce_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            is_fatal: Arc::new(WorkerError::is_intent),
            more_important: Arc::new(worker::more_important),
            error_delay: Duration::from_secs(3),
            bounce_delay: Duration::from_millis(10),
        }
    }
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("error_delay", &self.error_delay)
            .field("bounce_delay", &self.bounce_delay)
            .finish_non_exhaustive()
    }
}

enum Cmd {
    Install {
        name: String,
        manifold: Manifold,
        reply: oneshot::Sender<Result<(), InstallError>>,
    },
    Report {
        reply: oneshot::Sender<BTreeMap<String, ManifoldReport>>,
    },
}

enum Evt {
    Started {
        name: String,
        epoch: u64,
        outcome: Result<(CancellationToken, Option<Resource>), WorkerError>,
    },
    Done {
        name: String,
        epoch: u64,
        result: WorkerResult,
    },
    Retry {
        name: String,
        epoch: u64,
    },
}

/// Clonable handle for installing manifolds into a running engine and
/// taking report snapshots.
#[derive(Clone)]
pub struct EngineHandle {
    cmd: mpsc::UnboundedSender<Cmd>,
}

impl EngineHandle {
    /// Install a manifold into the graph.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is taken, the manifold would create
    /// a cycle, or the engine is stopping.
    pub async fn install(
        &self,
        name: impl Into<String>,
        manifold: Manifold,
    ) -> Result<(), InstallError> {
        let (reply, rx) = oneshot::channel();
        self.cmd
            .send(Cmd::Install {
                name: name.into(),
                manifold,
                reply,
            })
            .map_err(|_| InstallError::Stopping)?;
        rx.await.map_err(|_| InstallError::Stopping)?
    }

    /// Snapshot the state of every installed manifold.
    pub async fn report(&self) -> BTreeMap<String, ManifoldReport> {
        let (reply, rx) = oneshot::channel();
        if self.cmd.send(Cmd::Report { reply }).is_err() {
            return BTreeMap::new();
        }
        rx.await.unwrap_or_default()
    }
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle").finish_non_exhaustive()
    }
}

/// A runner whose children are manifolds and whose scheduling is driven
/// by dependency availability.
#[derive(Debug)]
pub struct Engine {
    cmd: mpsc::UnboundedSender<Cmd>,
    stop: CancellationToken,
    join: Option<JoinHandle<WorkerResult>>,
    result: Option<WorkerResult>,
}

impl Engine {
    /// Create an engine and start its scheduling task.
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (evt_tx, evt_rx) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();

        let actor = Actor {
            config,
            nodes: HashMap::new(),
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

    /// A clonable install/report handle for this engine.
    #[must_use]
    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            cmd: self.cmd.clone(),
        }
    }

    /// See [`EngineHandle::install`].
    ///
    /// # Errors
    ///
    /// Returns an error if the name is taken, the manifold would create
    /// a cycle, or the engine is stopping.
    pub async fn install(
        &self,
        name: impl Into<String>,
        manifold: Manifold,
    ) -> Result<(), InstallError> {
        self.handle().install(name, manifold).await
    }

    /// See [`EngineHandle::report`].
    pub async fn report(&self) -> BTreeMap<String, ManifoldReport> {
        self.handle().report().await
    }

    /// Request termination of the engine and all of its manifolds.
    pub fn kill(&self) {
        self.stop.cancel();
    }

    /// A clone of the engine's stop token.
    #[must_use]
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Block until the engine has terminated and return its terminal
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

    /// Convert the engine into a plain [`WorkerHandle`] so it can be
    /// supervised as a child of a runner.
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

struct Node {
    manifold: Manifold,
    status: ManifoldStatus,
    epoch: u64,
    /// Bumped every time this manifold becomes running; dependents record
    /// the generations of their inputs and are bounced on any change.
    generation: u64,
    input_gens: HashMap<String, u64>,
    resource: Option<Resource>,
    token: Option<CancellationToken>,
    last_error: Option<String>,
    retry_pending: bool,
}

struct Actor {
    config: EngineConfig,
    nodes: HashMap<String, Node>,
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
                cmd_rx = None;
                if self.all_stopped() {
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
                .unwrap_or_else(|| WorkerError::Failed("engine stopped fatally".to_string())))
        } else {
            Ok(())
        }
    }

    fn all_stopped(&self) -> bool {
        self.nodes
            .values()
            .all(|node| node.status == ManifoldStatus::Stopped)
    }

    fn handle_cmd(&mut self, cmd: Cmd) {
        match cmd {
            Cmd::Install {
                name,
                manifold,
                reply,
            } => {
                let _ = reply.send(self.handle_install(name, manifold));
            }
            Cmd::Report { reply } => {
                let _ = reply.send(self.report());
            }
        }
    }

    fn handle_install(&mut self, name: String, manifold: Manifold) -> Result<(), InstallError> {
        if self.stopping {
            return Err(InstallError::Stopping);
        }
        if self.nodes.contains_key(&name) {
            return Err(InstallError::AlreadyInstalled(name));
        }
        if self.would_cycle(&name, &manifold.inputs) {
            return Err(InstallError::Cycle(name));
        }

        debug!(manifold = %name, inputs = ?manifold.inputs, "installed manifold");
        self.nodes.insert(
            name,
            Node {
                manifold,
                status: ManifoldStatus::Stopped,
                epoch: 0,
                generation: 0,
                input_gens: HashMap::new(),
                resource: None,
                token: None,
                last_error: None,
                retry_pending: false,
            },
        );
        self.converge();
        Ok(())
    }

    /// Installing `name` adds edges `name -> input`; because the existing
    /// graph is acyclic, any new cycle must pass through `name`, so it is
    /// enough to look for a path from the new inputs back to `name`.
    fn would_cycle(&self, name: &str, inputs: &[String]) -> bool {
        let mut stack: Vec<&str> = inputs.iter().map(String::as_str).collect();
        let mut visited: Vec<&str> = Vec::new();
        while let Some(current) = stack.pop() {
            if current == name {
                return true;
            }
            if visited.contains(&current) {
                continue;
            }
            visited.push(current);
            if let Some(node) = self.nodes.get(current) {
                stack.extend(node.manifold.inputs.iter().map(String::as_str));
            }
        }
        false
    }

    fn report(&self) -> BTreeMap<String, ManifoldReport> {
        self.nodes
            .iter()
            .map(|(name, node)| {
                (
                    name.clone(),
                    ManifoldReport {
                        status: node.status,
                        error: node.last_error.clone(),
                        inputs_satisfied: self.inputs_running(&node.manifold.inputs),
                    },
                )
            })
            .collect()
    }

    fn handle_evt(&mut self, evt: Evt) {
        match evt {
            Evt::Started {
                name,
                epoch,
                outcome,
            } => self.handle_started(&name, epoch, outcome),
            Evt::Done {
                name,
                epoch,
                result,
            } => self.handle_done(&name, epoch, result),
            Evt::Retry { name, epoch } => self.handle_retry(&name, epoch),
        }
    }

    fn handle_started(
        &mut self,
        name: &str,
        epoch: u64,
        outcome: Result<(CancellationToken, Option<Resource>), WorkerError>,
    ) {
        enum After {
            Nothing,
            Converge,
            Retry(u64),
        }

        let stopping = self.stopping;
        let error_delay = self.config.error_delay;
        let after = {
            let Some(node) = self.nodes.get_mut(name) else {
                if let Ok((token, _)) = outcome {
                    token.cancel();
                }
                return;
            };
            if node.epoch != epoch {
                if let Ok((token, _)) = outcome {
                    token.cancel();
                }
                return;
            }
            match outcome {
                Ok((token, resource)) => {
                    if stopping {
                        token.cancel();
                        node.token = Some(token);
                        node.status = ManifoldStatus::Stopping;
                        After::Nothing
                    } else {
                        debug!(manifold = %name, "manifold running");
                        node.token = Some(token);
                        node.resource = resource;
                        node.status = ManifoldStatus::Running;
                        node.generation += 1;
                        node.last_error = None;
                        After::Converge
                    }
                }
                Err(WorkerError::Unmet) => {
                    debug!(manifold = %name, "manifold waiting for dependencies");
                    node.status = ManifoldStatus::Stopped;
                    After::Nothing
                }
                Err(error) => {
                    warn!(manifold = %name, %error, "manifold failed to start");
                    node.status = ManifoldStatus::Stopped;
                    node.last_error = Some(error.to_string());
                    if stopping {
                        After::Nothing
                    } else {
                        node.retry_pending = true;
                        After::Retry(node.epoch)
                    }
                }
            }
        };
        match after {
            After::Nothing => {}
            After::Converge => self.converge(),
            After::Retry(epoch) => self.schedule_retry(name, epoch, error_delay),
        }
    }

    fn handle_done(&mut self, name: &str, epoch: u64, result: WorkerResult) {
        let filtered = {
            let Some(node) = self.nodes.get_mut(name) else {
                return;
            };
            if node.epoch != epoch {
                return;
            }
            node.status = ManifoldStatus::Stopped;
            node.token = None;
            node.resource = None;
            node.input_gens.clear();
            match result {
                Ok(()) => Ok(()),
                Err(error) => match node.manifold.filter.as_ref() {
                    Some(filter) => Err(filter(error)),
                    None => Err(error),
                },
            }
        };

        if self.stopping {
            if let Err(error) = filtered {
                if error != WorkerError::Unmet {
                    self.record_error(error);
                }
            }
            return;
        }

        match filtered {
            Ok(()) | Err(WorkerError::Unmet) => {
                debug!(manifold = %name, "manifold bounced");
                self.set_retry(name, self.config.bounce_delay);
                self.converge();
            }
            Err(WorkerError::RestartRequested) => {
                debug!(manifold = %name, "manifold requested immediate restart");
                self.converge();
            }
            Err(error) if (self.config.is_fatal)(&error) => {
                info!(manifold = %name, %error, "fatal manifold error; stopping engine");
                self.fatal_seen = true;
                self.record_error(error);
                self.initiate_stop();
            }
            Err(error) => {
                warn!(manifold = %name, %error, "manifold failed; restarting after delay");
                self.record_error(error.clone());
                if let Some(node) = self.nodes.get_mut(name) {
                    node.last_error = Some(error.to_string());
                }
                self.set_retry(name, self.config.error_delay);
                self.converge();
            }
        }
    }

    fn set_retry(&mut self, name: &str, delay: Duration) {
        let epoch = {
            let Some(node) = self.nodes.get_mut(name) else {
                return;
            };
            node.retry_pending = true;
            node.epoch
        };
        self.schedule_retry(name, epoch, delay);
    }

    fn handle_retry(&mut self, name: &str, epoch: u64) {
        let clear = match self.nodes.get_mut(name) {
            Some(node) if node.epoch == epoch && node.retry_pending => {
                node.retry_pending = false;
                true
            }
            _ => false,
        };
        if clear {
            self.converge();
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
        for node in self.nodes.values_mut() {
            match node.status {
                ManifoldStatus::Running => {
                    if let Some(token) = &node.token {
                        token.cancel();
                    }
                    node.status = ManifoldStatus::Stopping;
                }
                // Starting manifolds are cancelled when their start
                // completes; stopped and stopping ones need nothing.
                ManifoldStatus::Starting
                | ManifoldStatus::Stopped
                | ManifoldStatus::Stopping => {}
            }
        }
    }

    fn inputs_running(&self, inputs: &[String]) -> bool {
        inputs.iter().all(|input| {
            self.nodes
                .get(input)
                .is_some_and(|node| node.status == ManifoldStatus::Running)
        })
    }

    fn inputs_stale(&self, node: &Node) -> bool {
        node.input_gens.iter().any(|(dep, gen)| {
            self.nodes
                .get(dep)
                .is_none_or(|n| n.status != ManifoldStatus::Running || n.generation != *gen)
        })
    }

    /// Re-evaluate the whole graph: stop running manifolds whose inputs
    /// changed, then start stopped manifolds whose inputs are satisfied.
    fn converge(&mut self) {
        if self.stopping {
            return;
        }
        let names: Vec<String> = self.nodes.keys().cloned().collect();

        for name in &names {
            let bounce = self
                .nodes
                .get(name)
                .is_some_and(|node| node.status == ManifoldStatus::Running && self.inputs_stale(node));
            if bounce {
                debug!(manifold = %name, "input restarted; stopping dependent");
                if let Some(node) = self.nodes.get_mut(name) {
                    if let Some(token) = &node.token {
                        token.cancel();
                    }
                    node.status = ManifoldStatus::Stopping;
                }
            }
        }

        for name in &names {
            let startable = self.nodes.get(name).is_some_and(|node| {
                node.status == ManifoldStatus::Stopped
                    && !node.retry_pending
                    && self.inputs_running(&node.manifold.inputs)
            });
            if startable {
                self.start_node(name);
            }
        }
    }

    fn start_node(&mut self, name: &str) {
        let (gens, resources) = {
            let Some(node) = self.nodes.get(name) else {
                return;
            };
            let mut gens = HashMap::new();
            let mut resources = HashMap::new();
            for input in &node.manifold.inputs {
                if let Some(dep) = self.nodes.get(input) {
                    gens.insert(input.clone(), dep.generation);
                    if let Some(resource) = &dep.resource {
                        resources.insert(input.clone(), resource.clone());
                    }
                }
            }
            (gens, resources)
        };

        let (epoch, start) = {
            let Some(node) = self.nodes.get_mut(name) else {
                return;
            };
            node.epoch += 1;
            node.status = ManifoldStatus::Starting;
            node.input_gens = gens;
            (node.epoch, node.manifold.start.clone())
        };

        let ctx = Context::new(resources);
        let evt = self.evt_tx.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            match start(ctx).await {
                Ok(StartedWorker { handle, resource }) => {
                    let (token, join) = handle.into_parts();
                    let _ = evt.send(Evt::Started {
                        name: name.clone(),
                        epoch,
                        outcome: Ok((token, resource)),
                    });
                    let result = worker::join_result(join.await);
                    let _ = evt.send(Evt::Done {
                        name,
                        epoch,
                        result,
                    });
                }
                Err(error) => {
                    let _ = evt.send(Evt::Started {
                        name,
                        epoch,
                        outcome: Err(error),
                    });
                }
            }
        });
    }

    fn schedule_retry(&self, name: &str, epoch: u64, delay: Duration) {
        let evt = self.evt_tx.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = evt.send(Evt::Retry { name, epoch });
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    async fn wait_for<F>(engine: &Engine, predicate: F)
    where
        F: Fn(&BTreeMap<String, ManifoldReport>) -> bool,
    {
        for _ in 0..200 {
            if predicate(&engine.report().await) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("engine did not reach the expected state: {:?}", engine.report().await);
    }

    fn running(report: &BTreeMap<String, ManifoldReport>, name: &str) -> bool {
        report
            .get(name)
            .is_some_and(|entry| entry.status == ManifoldStatus::Running)
    }

    fn counted_manifold(
        inputs: Vec<String>,
        starts: Arc<AtomicUsize>,
    ) -> Manifold {
        Manifold::new(inputs, move |_ctx| {
            let starts = starts.clone();
            async move {
                starts.fetch_add(1, Ordering::SeqCst);
                Ok(StartedWorker::new(WorkerHandle::idle()))
            }
        })
    }

    #[tokio::test]
    async fn test_dependencies_start_in_order() {
        let engine = Engine::new(EngineConfig::default());
        let b_starts = Arc::new(AtomicUsize::new(0));

        engine
            .install("b", counted_manifold(vec!["a".to_string()], b_starts.clone()))
            .await
            .expect("install failed");

        // b cannot start before a exists and runs.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(b_starts.load(Ordering::SeqCst), 0);

        engine
            .install("a", Manifold::value(1u32))
            .await
            .expect("install failed");

        wait_for(&engine, |report| running(report, "a") && running(report, "b")).await;

        engine.kill();
    }

    #[tokio::test]
    async fn test_resources_flow_to_dependents() {
        let engine = Engine::new(EngineConfig::default());
        let observed = Arc::new(AtomicUsize::new(0));

        engine
            .install("counter", Manifold::value(41u32))
            .await
            .expect("install failed");

        let seen = observed.clone();
        engine
            .install(
                "consumer",
                Manifold::new(vec!["counter".to_string()], move |ctx| {
                    let seen = seen.clone();
                    async move {
                        let value: u32 = ctx.get("counter")?;
                        seen.store(value as usize + 1, Ordering::SeqCst);
                        Ok(StartedWorker::new(WorkerHandle::idle()))
                    }
                }),
            )
            .await
            .expect("install failed");

        wait_for(&engine, |report| running(report, "consumer")).await;
        assert_eq!(observed.load(Ordering::SeqCst), 42);

        engine.kill();
    }

    #[tokio::test]
    async fn test_install_rejects_duplicates_and_cycles() {
        let engine = Engine::new(EngineConfig::default());

        engine
            .install("a", Manifold::value(1u32))
            .await
            .expect("install failed");
        assert_eq!(
            engine.install("a", Manifold::value(2u32)).await,
            Err(InstallError::AlreadyInstalled("a".to_string()))
        );

        engine
            .install(
                "b",
                counted_manifold(vec!["c".to_string()], Arc::new(AtomicUsize::new(0))),
            )
            .await
            .expect("install failed");
        // c -> b -> c would be a cycle, even though c postdates b.
        assert_eq!(
            engine
                .install(
                    "c",
                    counted_manifold(vec!["b".to_string()], Arc::new(AtomicUsize::new(0)))
                )
                .await,
            Err(InstallError::Cycle("c".to_string()))
        );
        // Self-dependency is a cycle too.
        assert_eq!(
            engine
                .install(
                    "d",
                    counted_manifold(vec!["d".to_string()], Arc::new(AtomicUsize::new(0)))
                )
                .await,
            Err(InstallError::Cycle("d".to_string()))
        );

        engine.kill();
    }

    #[tokio::test]
    async fn test_input_restart_bounces_dependent() {
        let engine = Engine::new(EngineConfig {
            error_delay: Duration::from_millis(10),
            bounce_delay: Duration::from_millis(5),
            ..EngineConfig::default()
        });

        // a's worker exits with an error when poked.
        let (poke_tx, poke_rx) = tokio::sync::mpsc::channel::<()>(1);
        let poke_rx = Arc::new(tokio::sync::Mutex::new(poke_rx));
        engine
            .install(
                "a",
                Manifold::new(Vec::<String>::new(), move |_ctx| {
                    let poke_rx = poke_rx.clone();
                    async move {
                        let handle = WorkerHandle::spawn(move |stop| async move {
                            let mut rx = poke_rx.lock().await;
                            tokio::select! {
                                () = stop.cancelled() => Ok(()),
                                _ = rx.recv() => {
                                    Err(WorkerError::Failed("poked".to_string()))
                                }
                            }
                        });
                        Ok(StartedWorker::with_resource(handle, 7u32))
                    }
                }),
            )
            .await
            .expect("install failed");

        let b_starts = Arc::new(AtomicUsize::new(0));
        engine
            .install("b", counted_manifold(vec!["a".to_string()], b_starts.clone()))
            .await
            .expect("install failed");

        wait_for(&engine, |report| running(report, "a") && running(report, "b")).await;
        assert_eq!(b_starts.load(Ordering::SeqCst), 1);

        // Kill a's current worker; b must bounce and start exactly once more.
        poke_tx.send(()).await.expect("poke failed");
        wait_for(&engine, |report| running(report, "a") && running(report, "b")).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(b_starts.load(Ordering::SeqCst), 2);

        engine.kill();
    }

    #[tokio::test]
    async fn test_fatal_manifold_error_stops_engine() {
        let mut engine = Engine::new(EngineConfig::default());
        engine
            .install(
                "doomed",
                Manifold::new(Vec::<String>::new(), |_ctx| async {
                    Ok(StartedWorker::new(WorkerHandle::spawn(|_stop| async {
                        Err(WorkerError::Intent(crate::worker::Intent::Terminate))
                    })))
                }),
            )
            .await
            .expect("install failed");

        assert_eq!(
            engine.wait().await,
            Err(WorkerError::Intent(crate::worker::Intent::Terminate))
        );
    }

    #[tokio::test]
    async fn test_filter_converts_error_to_bounce() {
        let engine = Engine::new(EngineConfig {
            bounce_delay: Duration::from_millis(5),
            ..EngineConfig::default()
        });
        let starts = Arc::new(AtomicUsize::new(0));
        let counter = starts.clone();
        engine
            .install(
                "refreshing",
                Manifold::new(Vec::<String>::new(), move |_ctx| {
                    let counter = counter.clone();
                    async move {
                        let n = counter.fetch_add(1, Ordering::SeqCst);
                        Ok(StartedWorker::new(WorkerHandle::spawn(
                            move |stop| async move {
                                if n == 0 {
                                    Err(WorkerError::Failed("value changed".to_string()))
                                } else {
                                    stop.cancelled().await;
                                    Ok(())
                                }
                            },
                        )))
                    }
                })
                .with_filter(|_err| WorkerError::Unmet),
            )
            .await
            .expect("install failed");

        wait_for(&engine, |report| running(report, "refreshing")).await;
        assert_eq!(starts.load(Ordering::SeqCst), 2);
        // The filtered error never shows up in the report.
        let report = engine.report().await;
        assert_eq!(report["refreshing"].error, None);

        engine.kill();
    }

    #[tokio::test]
    async fn test_report_shows_unsatisfied_inputs() {
        let engine = Engine::new(EngineConfig::default());
        engine
            .install(
                "waiting",
                counted_manifold(vec!["missing".to_string()], Arc::new(AtomicUsize::new(0))),
            )
            .await
            .expect("install failed");

        let report = engine.report().await;
        let entry = &report["waiting"];
        assert_eq!(entry.status, ManifoldStatus::Stopped);
        assert!(!entry.inputs_satisfied);

        engine.kill();
    }
}
