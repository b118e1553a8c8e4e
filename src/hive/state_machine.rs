//! Role-scoped state machine (C3).
//!
//! Each [`AgentRole`] has its own legal set of states and transitions
//! between them; [`StateMachine`] is the single authority consulted before
//! any component — [`CycleHandler`](crate::hive::cycle_handler),
//! [`WorkflowManager`](crate::hive::workflow_manager),
//! [`Guardian`](crate::hive::guardian) — mutates an agent's recorded state.
//! An illegal transition is never silently clamped; it is rejected with
//! [`HiveError::InvalidTransition`](crate::hive::error::HiveError::InvalidTransition)
//! and the caller decides what to do about it.

use serde::{Deserialize, Serialize};

/// The position an agent occupies in the Admin → PM → Worker hierarchy,
/// plus the independent Guardian reviewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentRole {
    Admin,
    ProjectManager,
    Worker,
    Guardian,
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentRole::Admin => "admin",
            AgentRole::ProjectManager => "project_manager",
            AgentRole::Worker => "worker",
            AgentRole::Guardian => "guardian",
        };
        write!(f, "{}", s)
    }
}

/// The union of every state any role can occupy. Which variants are legal,
/// and which transitions between them are legal, is role-specific — see
/// [`StateMachine::can_transition`]. A flat enum (rather than one enum per
/// role) keeps `HiveError::InvalidTransition` and the event bus's
/// `StateChange` payload homogeneous across roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentState {
    // Admin
    Idle,
    Conversation,
    Planning,
    AwaitingReview,

    // Project Manager
    Startup,
    BuildTeamTasks,
    ActivateWorkers,
    Manage,
    Standby,

    // Worker
    Work,
    Wait,

    // Guardian
    Monitoring,
    Reviewing,
    Remediating,

    // Shared terminal state for any role.
    Error,
}

/// Authority for legal role/state/transition combinations (C3).
///
/// Stateless by design — it holds no per-agent data, only the transition
/// tables. Callers own the agent's current `AgentState` and pass it in.
pub struct StateMachine;

impl StateMachine {
    pub fn new() -> Self {
        StateMachine
    }

    /// The state a freshly spawned agent of `role` starts in.
    pub fn initial_state(role: AgentRole) -> AgentState {
        match role {
            AgentRole::Admin => AgentState::Idle,
            AgentRole::ProjectManager => AgentState::Startup,
            AgentRole::Worker => AgentState::Work,
            AgentRole::Guardian => AgentState::Monitoring,
        }
    }

    /// Whether `role` may legally hold `state` at all.
    fn role_owns_state(role: AgentRole, state: AgentState) -> bool {
        use AgentState::*;
        match role {
            AgentRole::Admin => matches!(state, Idle | Conversation | Planning | AwaitingReview | Error),
            AgentRole::ProjectManager => matches!(
                state,
                Startup | BuildTeamTasks | ActivateWorkers | Manage | Standby | Error
            ),
            AgentRole::Worker => matches!(state, Work | Wait | Error),
            AgentRole::Guardian => matches!(state, Monitoring | Reviewing | Remediating | Error),
        }
    }

    /// Whether the `from -> to` transition is legal for `role`.
    pub fn can_transition(&self, role: AgentRole, from: AgentState, to: AgentState) -> bool {
        use AgentState::*;

        if !Self::role_owns_state(role, from) || !Self::role_owns_state(role, to) {
            return false;
        }
        // Error is terminal: nothing transitions out of it on its own
        // (an operator-initiated respawn builds a fresh agent instead).
        if matches!(from, Error) {
            return false;
        }
        // Any non-terminal state may fault into Error.
        if matches!(to, Error) {
            return true;
        }

        match role {
            AgentRole::Admin => matches!(
                (from, to),
                (Idle, Conversation)
                    | (Conversation, Idle)
                    | (Conversation, Planning)
                    | (Planning, Conversation)
                    | (Planning, AwaitingReview)
                    | (AwaitingReview, Conversation)
                    | (AwaitingReview, Planning)
            ),
            AgentRole::ProjectManager => matches!(
                (from, to),
                (Startup, BuildTeamTasks)
                    | (BuildTeamTasks, ActivateWorkers)
                    | (ActivateWorkers, Manage)
                    | (Manage, Standby)
                    | (Standby, Manage)
                    | (Manage, BuildTeamTasks)
            ),
            AgentRole::Worker => matches!((from, to), (Work, Wait) | (Wait, Work)),
            AgentRole::Guardian => matches!(
                (from, to),
                (Monitoring, Reviewing) | (Reviewing, Remediating) | (Reviewing, Monitoring) | (Remediating, Monitoring)
            ),
        }
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_happy_path() {
        let sm = StateMachine::new();
        assert!(sm.can_transition(AgentRole::Admin, AgentState::Idle, AgentState::Conversation));
        assert!(sm.can_transition(AgentRole::Admin, AgentState::Conversation, AgentState::Planning));
        assert!(sm.can_transition(AgentRole::Admin, AgentState::Planning, AgentState::AwaitingReview));
    }

    #[test]
    fn cross_role_state_is_illegal() {
        let sm = StateMachine::new();
        assert!(!sm.can_transition(AgentRole::Worker, AgentState::Work, AgentState::Startup));
    }

    #[test]
    fn error_is_terminal() {
        let sm = StateMachine::new();
        assert!(sm.can_transition(AgentRole::Worker, AgentState::Work, AgentState::Error));
        assert!(!sm.can_transition(AgentRole::Worker, AgentState::Error, AgentState::Work));
    }

    #[test]
    fn pm_cannot_skip_startup() {
        let sm = StateMachine::new();
        assert!(!sm.can_transition(AgentRole::ProjectManager, AgentState::Startup, AgentState::Manage));
    }

    #[test]
    fn initial_states_match_roles() {
        assert_eq!(StateMachine::initial_state(AgentRole::Admin), AgentState::Idle);
        assert_eq!(StateMachine::initial_state(AgentRole::ProjectManager), AgentState::Startup);
        assert_eq!(StateMachine::initial_state(AgentRole::Worker), AgentState::Work);
        assert_eq!(StateMachine::initial_state(AgentRole::Guardian), AgentState::Monitoring);
    }
}
