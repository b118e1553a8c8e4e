//! Crate-wide error taxonomy.
//!
//! `HiveError` mirrors the five failure categories the orchestrator
//! distinguishes: transient provider/tool failures that are retried,
//! programmatic mistakes that are surfaced back to the offending agent,
//! policy holds raised by the [`Guardian`](crate::hive::guardian::Guardian),
//! fatal conditions that park an agent in `Error`, and infrastructural
//! failures that are isolated to the failing consumer.
//!
//! Tool execution and LLM streaming keep returning `Box<dyn Error + Send +
//! Sync>` at their own trait boundary (matching
//! [`ToolProtocol::execute`](crate::hive::tool_protocol::ToolProtocol::execute)),
//! and are classified into a `HiveError` variant by the caller — the callee
//! never guesses its own severity.

use crate::hive::guardian::Violation;
use crate::hive::state_machine::AgentState;
use std::error::Error;
use std::fmt;

/// A single error surfaced anywhere in the orchestration core.
#[derive(Debug, Clone)]
pub enum HiveError {
    /// LLM provider error, tool timeout, or a parser that hit end-of-stream
    /// mid-structure. Retried by the caller with backoff.
    Transient { agent_id: String, message: String },

    /// Invalid state transition, unknown tool, or schema validation
    /// failure. Not retried; surfaced to the agent as a system/tool message
    /// so it can self-correct.
    InvalidTransition {
        agent_id: String,
        role: String,
        from: AgentState,
        to: AgentState,
    },
    UnknownTool { agent_id: String, tool_name: String },
    SchemaValidation { agent_id: String, message: String },

    /// A Guardian violation. The agent is paused in `AwaitingReview`.
    GuardianPolicy { agent_id: String, violation: Violation },

    /// Repeated health breach, unbounded loop, or cancellation. The agent
    /// moves to `Error` with a cooldown; no auto-retry.
    Fatal { agent_id: String, message: String },

    /// Bus subscriber panic or persistence failure. Isolated to the
    /// failing consumer; the core continues.
    Infrastructural { message: String },
}

impl fmt::Display for HiveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HiveError::Transient { agent_id, message } => {
                write!(f, "transient error for agent {}: {}", agent_id, message)
            }
            HiveError::InvalidTransition {
                agent_id,
                role,
                from,
                to,
            } => write!(
                f,
                "transition {:?}->{:?} is not allowed for role {} (agent {})",
                from, to, role, agent_id
            ),
            HiveError::UnknownTool { agent_id, tool_name } => {
                write!(f, "agent {} requested unknown tool '{}'", agent_id, tool_name)
            }
            HiveError::SchemaValidation { agent_id, message } => {
                write!(f, "schema validation failed for agent {}: {}", agent_id, message)
            }
            HiveError::GuardianPolicy { agent_id, violation } => write!(
                f,
                "guardian violation for agent {}: {} ({:?}/{:?})",
                agent_id, violation.principle, violation.kind, violation.severity
            ),
            HiveError::Fatal { agent_id, message } => {
                write!(f, "fatal error for agent {}: {}", agent_id, message)
            }
            HiveError::Infrastructural { message } => {
                write!(f, "infrastructural error: {}", message)
            }
        }
    }
}

impl Error for HiveError {}

impl HiveError {
    /// The agent this error is attributed to, if any (infrastructural
    /// errors are not attributed to a single agent).
    pub fn agent_id(&self) -> Option<&str> {
        match self {
            HiveError::Transient { agent_id, .. }
            | HiveError::InvalidTransition { agent_id, .. }
            | HiveError::UnknownTool { agent_id, .. }
            | HiveError::SchemaValidation { agent_id, .. }
            | HiveError::GuardianPolicy { agent_id, .. }
            | HiveError::Fatal { agent_id, .. } => Some(agent_id),
            HiveError::Infrastructural { .. } => None,
        }
    }

    /// Whether `CycleHandler` should retry the cycle after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, HiveError::Transient { .. })
    }
}
