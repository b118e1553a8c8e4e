// src/lib.rs

//! `hai-hive`: a local-first, multi-agent orchestration engine.
//!
//! Coordinates a hierarchy of LLM-backed agents (Admin → Project Manager → Worker)
//! behind an independent Guardian reviewer. See [`hive::agent_manager`] for the
//! root orchestrator.

pub mod hive;

// Re-exporting key items for easier external access.
pub use hive::agent::Agent;
pub use hive::agent_manager::AgentManager;
pub use hive::client_wrapper::{ClientWrapper, Message, Role};
pub use hive::config::HiveConfig;
pub use hive::error::HiveError;
pub use hive::event::{AgentEvent, EventBus};
pub use hive::guardian::Guardian;
pub use hive::llm_session::LLMSession;
pub use hive::state_machine::{AgentRole, AgentState, StateMachine};
