//! # fleetd-agent
//!
//! The host agent lifecycle for fleetd: the long-running process on
//! every enrolled host that brings up, supervises, and tears down the
//! worker tree administering the host and - on controller hosts - the
//! models the cluster manages.
//!
//! The crate composes the supervision substrate from `fleetd-core` into
//! the agent's top-level loop: the root runner with its `api`,
//! `state-starter`, and `termination` workers, the upgrade and restore
//! gates, login admission, and the terminal-intent handling that turns
//! worker errors into uninstall, reboot, or shutdown.
//!
//! Provider-specific clients (the control-plane dialer, the backing
//! store, the lease store, host services) are reached through the narrow
//! interfaces in [`collaborators`]; the embedding binary supplies them
//! and calls [`agent::Agent::run`].

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod admission;
pub mod agent;
pub mod api;
pub mod collaborators;
pub mod controller;
pub mod install;
pub mod manifolds;
pub mod restore;
pub mod testing;
pub mod upgrade;

pub use agent::{Agent, AgentError, AgentState};
pub use collaborators::Collaborators;
