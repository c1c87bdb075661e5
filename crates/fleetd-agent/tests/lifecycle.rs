//! End-to-end agent lifecycle scenarios over the in-memory fakes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleetd_agent::admission::{self, Admission, LoginRequest};
use fleetd_agent::agent::{Agent, exit_code};
use fleetd_agent::collaborators::UpgradeSteps;
use fleetd_agent::install;
use fleetd_agent::testing;
use fleetd_core::config::ServingConfig;
use fleetd_core::models::{Life, ModelUuid};
use fleetd_core::tag::Tag;
use fleetd_core::worker::{Intent, WorkerError};
use uuid::Uuid;

fn serving() -> ServingConfig {
    ServingConfig {
        cert: "CERT".to_string(),
        private_key: "KEY".to_string(),
        ca_private_key: String::new(),
        api_port: 17070,
        shared_secret: "hush".to_string(),
    }
}

/// A dead host entity terminates the agent and, with the marker written
/// by the api worker itself, uninstalls it.
#[tokio::test]
async fn test_dead_host_uninstalls_agent() {
    let root = tempfile::tempdir().expect("tempdir failed");
    let mut config = testing::config_in(root.path());
    config.service_name = Some("fleetd".to_string());
    let fakes = testing::Fakes::new(config.clone());
    fakes
        .plane
        .set_life(Tag::Host("0".to_string()), Some(Life::Dead));

    let binary = root.path().join("fleetd-agent");
    std::fs::write(&binary, "#!").expect("write failed");

    let agent = Agent::new(fakes.collaborators())
        .with_root_dir(root.path())
        .with_binary_path(&binary);
    let result = agent.run().await;

    assert!(result.is_ok(), "run failed: {result:?}");
    assert_eq!(exit_code(&result), 0);
    assert!(!config.data_dir.exists());
    assert_eq!(fakes.host_services.removed(), vec!["fleetd".to_string()]);
    for link in install::command_paths(root.path()) {
        assert!(!link.exists());
    }
}

/// Without the uninstall marker, terminating leaves the install alone.
#[tokio::test]
async fn test_terminate_without_marker_preserves_install() {
    let root = tempfile::tempdir().expect("tempdir failed");
    let config = testing::config_in(root.path());
    let fakes = testing::Fakes::new(config.clone());
    fakes
        .plane
        .set_life(Tag::Host("0".to_string()), Some(Life::Alive));

    // The upgrade steps demand termination; nothing wrote the marker.
    struct TerminatingSteps;
    #[async_trait]
    impl UpgradeSteps for TerminatingSteps {
        async fn run(&self, _previous: Option<&str>, _current: &str) -> Result<(), WorkerError> {
            Err(WorkerError::Intent(Intent::Terminate))
        }
    }
    let mut deps = fakes.collaborators();
    deps.upgrades = Arc::new(TerminatingSteps);

    let binary = root.path().join("fleetd-agent");
    std::fs::write(&binary, "#!").expect("write failed");

    let agent = Agent::new(deps)
        .with_root_dir(root.path())
        .with_binary_path(&binary);
    let result = agent.run().await;

    assert!(result.is_ok(), "run failed: {result:?}");
    assert!(config.data_dir.exists());
    assert!(fakes.host_services.removed().is_empty());
}

/// A reboot intent waits for the reboot coordinator and schedules the
/// host action, exiting cleanly.
#[tokio::test]
async fn test_reboot_intent_schedules_host_reboot() {
    let root = tempfile::tempdir().expect("tempdir failed");
    let config = testing::config_in(root.path());
    let fakes = testing::Fakes::new(config);
    fakes
        .plane
        .set_life(Tag::Host("0".to_string()), Some(Life::Alive));

    struct RebootingSteps;
    #[async_trait]
    impl UpgradeSteps for RebootingSteps {
        async fn run(&self, _previous: Option<&str>, _current: &str) -> Result<(), WorkerError> {
            Err(WorkerError::Intent(Intent::Reboot))
        }
    }
    let mut deps = fakes.collaborators();
    deps.upgrades = Arc::new(RebootingSteps);

    let binary = root.path().join("fleetd-agent");
    std::fs::write(&binary, "#!").expect("write failed");

    let agent = Agent::new(deps)
        .with_root_dir(root.path())
        .with_binary_path(&binary);
    let result = agent.run().await;

    assert!(result.is_ok(), "run failed: {result:?}");
    assert_eq!(exit_code(&result), 0);
    assert_eq!(fakes.plane.reboot_waits(), 1);
    assert_eq!(fakes.host_actions.reboots(), 1);
    assert_eq!(fakes.host_actions.shutdowns(), 0);
}

/// A controller host brings up the full tree: symlinks, upgrade gates,
/// the state worker, and per-model maintenance.
#[tokio::test]
async fn test_controller_runs_model_maintenance() {
    let root = tempfile::tempdir().expect("tempdir failed");
    let mut config = testing::config_in(root.path());
    config.serving = Some(serving());
    let fakes = testing::Fakes::new(config);
    fakes
        .plane
        .set_life(Tag::Host("0".to_string()), Some(Life::Alive));

    let uuid = ModelUuid::new(Uuid::new_v4());
    fakes.session.set_model(uuid, Some(Life::Alive));

    let binary = root.path().join("fleetd-agent");
    std::fs::write(&binary, "#!").expect("write failed");

    let agent = Arc::new(
        Agent::new(fakes.collaborators())
            .with_root_dir(root.path())
            .with_binary_path(&binary),
    );
    let running = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.run().await })
    };

    // The agent settles into open service once the upgrade gates open.
    let state = loop {
        if let Some(state) = agent.state() {
            break state;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    state.upgrade_complete().opened().await;
    state.initial_upgrade_check().opened().await;
    assert_eq!(
        admission::admit(
            &state,
            &LoginRequest {
                auth_tag: Tag::User("jane".to_string()),
            }
        ),
        Admission::Allow
    );

    // Symlinks are in place.
    for link in install::command_paths(root.path()) {
        assert!(link.exists(), "missing symlink {}", link.display());
    }

    // Feed the model watcher until the per-model keeper ticks.
    let mut keeper_ran = false;
    for _ in 0..200 {
        fakes.session.push_models(vec![uuid.to_string()]);
        if fakes.model_ops.cleanups() > 0 {
            keeper_ran = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(keeper_ran, "model keeper never ran");

    running.abort();
}
