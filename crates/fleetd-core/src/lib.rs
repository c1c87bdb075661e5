//! # fleetd-core
//!
//! Core library for fleetd - the supervision substrate of the cluster host
//! agent.
//!
//! This crate provides the building blocks the agent composes into its
//! worker tree: the worker primitive, the restarting runner, the
//! dependency engine, the singular (leader) flag, and the per-model worker
//! manager, together with the shared observation primitives they rely on.
//!
//! ## Features
//!
//! - **Workers**: stoppable tasks with exactly-once terminal errors
//! - **Runners**: named worker sets with restart and fatal-error policies
//! - **Dependency engine**: declarative worker graphs with typed resources
//! - **Singular flag**: lease-backed "am I leader" signal
//! - **Per-model manager**: one worker sub-tree per model lifecycle
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use fleetd_core::runner::{self, Runner, RunnerConfig};
//! use fleetd_core::worker::WorkerHandle;
//!
//! # async fn demo() {
//! let runner = Runner::new(RunnerConfig::intents_fatal(Duration::from_secs(3)));
//! let control = runner.control();
//! let _ = control.start_worker(
//!     "heartbeat",
//!     runner::factory(|| async {
//!         Ok(WorkerHandle::spawn(|stop| async move {
//!             stop.cancelled().await;
//!             Ok(())
//!         }))
//!     }),
//! );
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod engine;
pub mod gate;
pub mod images;
pub mod lifeflag;
pub mod models;
pub mod runner;
pub mod singular;
pub mod tag;
pub mod value;
pub mod watcher;
pub mod worker;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::AgentConfig;
    pub use crate::engine::{Engine, EngineConfig, Manifold, StartedWorker};
    pub use crate::gate::Gate;
    pub use crate::models::{Life, ModelUuid, ModelWorkerManager};
    pub use crate::runner::{Runner, RunnerConfig, RunnerControl};
    pub use crate::tag::Tag;
    pub use crate::worker::{Intent, WorkerError, WorkerHandle};
}

/// Re-export commonly used types at the crate root.
pub use engine::{Engine, Manifold};
pub use gate::Gate;
pub use runner::{Runner, RunnerConfig, RunnerControl};
pub use tag::Tag;
pub use worker::{Intent, WorkerError, WorkerHandle};
