//! On-host installation surface.
//!
//! The agent maintains two well-known command symlinks pointing at its
//! own binary, and - when asked to terminate with the uninstall marker
//! present - removes its service unit, symlinks, and data directory.
//! Uninstall keeps going past individual failures and aggregates every
//! step error into one structured failure.

use std::path::{Path, PathBuf};

use fleetd_core::config::AgentConfig;
use tracing::{debug, info, warn};

use crate::collaborators::Collaborators;

/// Command name for running a command in a unit context.
pub const EXEC_COMMAND: &str = "fleet-exec";

/// Command name for dumping agent logs.
pub const DUMP_LOGS_COMMAND: &str = "fleet-dump-logs";

const COMMAND_DIR: &str = "usr/local/bin";

/// Aggregated uninstall failure.
#[derive(Debug, thiserror::Error)]
#[error("uninstall failed: {}", steps.join("; "))]
pub struct UninstallError {
    /// One message per failed step.
    pub steps: Vec<String>,
}

/// The well-known command paths under `root_dir`.
#[must_use]
pub fn command_paths(root_dir: &Path) -> [PathBuf; 2] {
    let bin = root_dir.join(COMMAND_DIR);
    [bin.join(EXEC_COMMAND), bin.join(DUMP_LOGS_COMMAND)]
}

/// Create (or repair) the well-known command symlinks to `binary`.
///
/// # Errors
///
/// Returns the first I/O error encountered.
pub fn create_symlinks(root_dir: &Path, binary: &Path) -> std::io::Result<()> {
    for link in command_paths(root_dir) {
        match std::fs::read_link(&link) {
            Ok(target) if target == binary => continue,
            Ok(_) => std::fs::remove_file(&link)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
        if let Some(parent) = link.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::os::unix::fs::symlink(binary, &link)?;
        debug!(link = %link.display(), "created command symlink");
    }
    Ok(())
}

/// Remove the well-known command symlinks, collecting errors.
fn remove_symlinks(root_dir: &Path) -> Vec<String> {
    let mut errors = Vec::new();
    for link in command_paths(root_dir) {
        if let Err(err) = std::fs::remove_file(&link) {
            if err.kind() != std::io::ErrorKind::NotFound {
                errors.push(format!("failed to remove {}: {err}", link.display()));
            }
        }
    }
    errors
}

/// Create the uninstall marker file, instructing the agent to remove
/// itself when it terminates.
///
/// # Errors
///
/// Returns an error if the marker cannot be written.
pub fn write_uninstall_marker(config: &AgentConfig) -> std::io::Result<()> {
    std::fs::write(config.uninstall_marker(), [])
}

/// Uninstall the agent if the marker file is present; otherwise do
/// nothing. Every step runs regardless of earlier failures.
///
/// # Errors
///
/// Returns the aggregated step failures.
pub fn uninstall_if_marked(
    config: &AgentConfig,
    root_dir: &Path,
    deps: &Collaborators,
) -> Result<(), UninstallError> {
    let marker = config.uninstall_marker();
    if !marker.exists() {
        debug!(marker = %marker.display(), "no uninstall marker; leaving install in place");
        return Ok(());
    }
    info!(marker = %marker.display(), "uninstall marker found; removing agent");

    let mut steps = Vec::new();

    if let Some(service) = &config.service_name {
        if let Err(err) = deps.host_services.remove_service(service) {
            steps.push(format!("cannot remove service {service:?}: {err}"));
        }
    }

    steps.extend(remove_symlinks(root_dir));

    // Inside a container, loop devices backed by our data directory
    // would leak past the directory's removal.
    match deps.containers.running_inside() {
        Ok(true) => {
            if let Err(err) = deps
                .loop_devices
                .detach_loop_devices(root_dir, &config.data_dir)
            {
                steps.push(format!("cannot detach loop devices: {err}"));
            }
        }
        Ok(false) => {}
        Err(err) => steps.push(format!("cannot probe container environment: {err}")),
    }

    if let Err(err) = std::fs::remove_dir_all(&config.data_dir) {
        steps.push(format!(
            "cannot remove data dir {}: {err}",
            config.data_dir.display()
        ));
    }

    if steps.is_empty() {
        Ok(())
    } else {
        warn!(failures = steps.len(), "uninstall finished with failures");
        Err(UninstallError { steps })
    }
}
