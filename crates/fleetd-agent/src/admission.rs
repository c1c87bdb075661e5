//! Login admission.
//!
//! The in-process API server consults this predicate for every login
//! attempt. While a restore is running or preparing, and while upgrades
//! have not finished, the agent only admits itself; human users get a
//! structured restricted-mode answer, other machine principals an
//! outright refusal.

use fleetd_core::tag::Tag;

use crate::agent::AgentState;

/// A login attempt as seen by the API server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginRequest {
    /// The authenticated principal.
    pub auth_tag: Tag,
}

/// The admission decision for one login attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Admit normally.
    Allow,
    /// Admit in restricted (read-only) mode, with the reason.
    Restricted(String),
    /// Refuse outright, with the reason.
    Refused(String),
}

/// Decide whether to admit a login attempt given the agent's current
/// restore and upgrade state. Rules apply in order: restore running,
/// restore preparing, upgrade pending or incomplete, then open service.
#[must_use]
pub fn admit(state: &AgentState, request: &LoginRequest) -> Admission {
    let local = request.auth_tag == *state.tag();

    if state.is_restore_running() {
        return if local {
            Admission::Allow
        } else {
            Admission::Refused("restore is in progress".to_string())
        };
    }

    if state.is_restore_preparing() {
        return guarded(local, &request.auth_tag, "restore is about to begin");
    }

    if state.is_upgrade_pending() || state.is_upgrade_running() {
        return guarded(local, &request.auth_tag, "upgrade in progress");
    }

    Admission::Allow
}

fn guarded(local: bool, auth_tag: &Tag, reason: &str) -> Admission {
    if local {
        Admission::Allow
    } else if matches!(auth_tag, Tag::User(_)) {
        Admission::Restricted(reason.to_string())
    } else {
        Admission::Refused(reason.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::testing;

    fn open_state() -> Arc<AgentState> {
        let root = tempfile::tempdir().expect("tempdir failed");
        let state = Arc::new(AgentState::new(testing::config_in(root.path())));
        state.upgrade_complete().open();
        state.initial_upgrade_check().open();
        state
    }

    fn user() -> LoginRequest {
        LoginRequest {
            auth_tag: Tag::User("jane".to_string()),
        }
    }

    fn other_host() -> LoginRequest {
        LoginRequest {
            auth_tag: Tag::Host("7".to_string()),
        }
    }

    fn local_host() -> LoginRequest {
        LoginRequest {
            auth_tag: Tag::Host("0".to_string()),
        }
    }

    #[test]
    fn test_open_service_allows_everyone() {
        let state = open_state();
        assert_eq!(admit(&state, &user()), Admission::Allow);
        assert_eq!(admit(&state, &other_host()), Admission::Allow);
        assert_eq!(admit(&state, &local_host()), Admission::Allow);
    }

    #[test]
    fn test_restore_cycle_for_a_user() {
        let state = open_state();

        // idle -> preparing -> running -> idle, as seen by a human user.
        assert_eq!(admit(&state, &user()), Admission::Allow);

        state.restore_prepare().expect("prepare failed");
        assert!(matches!(admit(&state, &user()), Admission::Restricted(_)));

        state.restore_begin().expect("begin failed");
        assert!(matches!(admit(&state, &user()), Admission::Refused(_)));

        state.restore_end();
        assert_eq!(admit(&state, &user()), Admission::Allow);
    }

    #[test]
    fn test_restore_refuses_other_machines() {
        let state = open_state();
        state.restore_prepare().expect("prepare failed");
        assert!(matches!(admit(&state, &other_host()), Admission::Refused(_)));

        state.restore_begin().expect("begin failed");
        assert!(matches!(admit(&state, &other_host()), Admission::Refused(_)));
    }

    #[test]
    fn test_local_host_always_admitted() {
        let state = open_state();
        state.restore_prepare().expect("prepare failed");
        assert_eq!(admit(&state, &local_host()), Admission::Allow);

        state.restore_begin().expect("begin failed");
        assert_eq!(admit(&state, &local_host()), Admission::Allow);
    }

    #[test]
    fn test_upgrade_window_restricts_users_and_refuses_machines() {
        let root = tempfile::tempdir().expect("tempdir failed");
        let state = Arc::new(AgentState::new(testing::config_in(root.path())));

        // Both gates are still shut at startup.
        assert!(matches!(admit(&state, &user()), Admission::Restricted(_)));
        assert!(matches!(admit(&state, &other_host()), Admission::Refused(_)));
        assert_eq!(admit(&state, &local_host()), Admission::Allow);

        // One gate is not enough.
        state.upgrade_complete().open();
        assert!(matches!(admit(&state, &user()), Admission::Restricted(_)));

        state.initial_upgrade_check().open();
        assert_eq!(admit(&state, &user()), Admission::Allow);
        assert_eq!(admit(&state, &other_host()), Admission::Allow);
    }
}
