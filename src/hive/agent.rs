//! Agent identity and LLM session (C6).
//!
//! An [`Agent`] is a pure event-stream producer: it owns its identity, its
//! [`LLMSession`], its [`ContextStrategy`], and an optional [`ThoughtChain`],
//! but it never executes tools, never applies workflow triggers, and never
//! decides its own state transitions. [`process_message`](Agent::process_message)
//! sends one turn to the backing LLM and returns the raw response; everything
//! that happens next — parsing, tool execution, Guardian review, state
//! transitions — is [`CycleHandler`](crate::hive::cycle_handler)'s job, driven
//! from outside against an [`EventBus`](crate::hive::event::EventBus) the
//! agent itself never touches.
//!
//! # Example
//!
//! ```rust,no_run
//! use hai_hive::Agent;
//! use hai_hive::hive::state_machine::AgentRole;
//! use hai_hive::clients::openai::OpenAIClient;
//! use std::sync::Arc;
//!
//! # async {
//! let mut agent = Agent::new(
//!     "analyst",
//!     "Technical Analyst",
//!     AgentRole::Worker,
//!     Arc::new(OpenAIClient::new_with_model_string("key", "gpt-4o")),
//! )
//! .with_expertise("Cloud Architecture")
//! .with_personality("Direct and analytical");
//!
//! let response = agent.process_message("Summarize the incident.").await.unwrap();
//! println!("{}", response.content);
//! # };
//! ```

use crate::hive::client_wrapper::{ClientWrapper, Message, MessageChunkStream, Role};
use crate::hive::context_strategy::{ContextStrategy, TrimStrategy};
use crate::hive::llm_session::LLMSession;
use crate::hive::state_machine::{AgentRole, AgentState, StateMachine};
use crate::hive::thought_chain::{Thought, ThoughtChain, ThoughtType};
use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Default per-agent history budget; a worker talking about code rarely
/// needs more, and PMs/Admins compact well before hitting it.
const DEFAULT_MAX_TOKENS: usize = 128_000;

/// An LLM-backed participant in the hierarchy: Admin, ProjectManager,
/// Worker, or Guardian. See [`AgentRole`] for the role taxonomy and
/// [`AgentState`] for the states each role can occupy.
pub struct Agent {
    /// Stable identifier referenced throughout orchestration coordination.
    pub id: String,
    /// Human-readable display name for logging and UI surfaces.
    pub name: String,
    /// Which role this agent plays, and therefore which [`AgentState`]s are
    /// legal for it (see [`StateMachine`]).
    pub role: AgentRole,
    /// The agent that spawned this one, if any (PM/Worker lineage).
    pub parent_id: Option<String>,
    /// Free-form description of the agent's strengths, folded into the
    /// system prompt.
    pub expertise: Option<String>,
    /// Persona hints that help diversify the tone of generated responses.
    pub personality: Option<String>,
    /// Arbitrary metadata associated with the agent (e.g. assigned task id).
    pub metadata: HashMap<String, String>,

    state: AgentState,
    base_system_prompt: String,
    session: LLMSession,
    context_strategy: Box<dyn ContextStrategy>,
    thought_chain: Option<Arc<RwLock<ThoughtChain>>>,
}

impl Agent {
    /// Creates a new agent in its role's initial state with an empty system
    /// prompt (call [`set_system_prompt`](Agent::set_system_prompt) to set one).
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        role: AgentRole,
        client: Arc<dyn ClientWrapper>,
    ) -> Self {
        let id = id.into();
        let name = name.into();
        let session = LLMSession::new(client, String::new(), DEFAULT_MAX_TOKENS);
        Self {
            state: StateMachine::initial_state(role),
            id,
            name,
            role,
            parent_id: None,
            expertise: None,
            personality: None,
            metadata: HashMap::new(),
            base_system_prompt: String::new(),
            session,
            context_strategy: Box::new(TrimStrategy::default()),
            thought_chain: None,
        }
    }

    /// Rebuilds an agent from the last entry of an existing [`ThoughtChain`],
    /// injecting the chain's bootstrap prompt as the opening system context.
    pub fn resume_from_latest(
        id: impl Into<String>,
        name: impl Into<String>,
        role: AgentRole,
        client: Arc<dyn ClientWrapper>,
        max_tokens: usize,
        chain: Arc<RwLock<ThoughtChain>>,
    ) -> Self {
        let id = id.into();
        let name = name.into();
        let mut session = LLMSession::new(client, String::new(), max_tokens);
        if let Ok(guard) = chain.try_read() {
            let last_idx = guard.thoughts().last().map(|t| t.index).unwrap_or(0);
            let bootstrap = guard.to_bootstrap_prompt(last_idx);
            if !bootstrap.is_empty() {
                session.inject_message(Role::System, bootstrap);
            }
        }
        Self {
            state: StateMachine::initial_state(role),
            id,
            name,
            role,
            parent_id: None,
            expertise: None,
            personality: None,
            metadata: HashMap::new(),
            base_system_prompt: String::new(),
            session,
            context_strategy: Box::new(TrimStrategy::default()),
            thought_chain: Some(chain),
        }
    }

    pub fn with_expertise(mut self, expertise: impl Into<String>) -> Self {
        self.expertise = Some(expertise.into());
        self.reapply_system_prompt();
        self
    }

    pub fn with_personality(mut self, personality: impl Into<String>) -> Self {
        self.personality = Some(personality.into());
        self.reapply_system_prompt();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_thought_chain(mut self, chain: Arc<RwLock<ThoughtChain>>) -> Self {
        self.thought_chain = Some(chain);
        self
    }

    pub fn context_collapse_strategy(mut self, strategy: Box<dyn ContextStrategy>) -> Self {
        self.context_strategy = strategy;
        self
    }

    pub fn set_context_collapse_strategy(&mut self, strategy: Box<dyn ContextStrategy>) {
        self.context_strategy = strategy;
    }

    /// Sets the base system prompt; expertise and personality (if set) are
    /// folded in automatically.
    pub fn set_system_prompt(&mut self, base_prompt: impl Into<String>) {
        self.base_system_prompt = base_prompt.into();
        self.reapply_system_prompt();
    }

    fn reapply_system_prompt(&mut self) {
        let mut prompt = String::new();
        if !self.base_system_prompt.is_empty() {
            prompt.push_str(&self.base_system_prompt);
            prompt.push('\n');
        }
        prompt.push_str(&format!("You are {}, a {}.\n", self.name, self.role));
        if let Some(expertise) = &self.expertise {
            prompt.push_str(&format!("Your expertise: {}\n", expertise));
        }
        if let Some(personality) = &self.personality {
            prompt.push_str(&format!("Your approach: {}\n", personality));
        }
        self.session.set_system_prompt(prompt);
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    /// Overwrites the agent's recorded state. Callers are expected to have
    /// already validated the transition against [`StateMachine`] — the
    /// agent itself does not re-check legality.
    pub fn set_state(&mut self, state: AgentState) {
        self.state = state;
    }

    /// Injects a message into the session history without sending it to the
    /// LLM. Used to deliver messages routed from other agents.
    pub fn receive_message(&mut self, role: Role, content: impl Into<String>) {
        self.session.inject_message(role, content.into());
    }

    pub fn session_history_len(&self) -> usize {
        self.session.get_conversation_history().len()
    }

    pub fn client(&self) -> &Arc<dyn ClientWrapper> {
        self.session.client()
    }

    /// Sends `content` as a user turn and returns the LLM's raw response.
    ///
    /// This is the agent's entire contribution to a cycle: one round-trip.
    /// It compacts the session first if the attached [`ContextStrategy`]
    /// says it's time, then delegates to [`LLMSession::send_message`]. It
    /// does not parse the response, does not execute tools, and does not
    /// change `self.state` — see [`CycleHandler`](crate::hive::cycle_handler).
    pub async fn process_message(
        &mut self,
        content: &str,
    ) -> Result<Message, Box<dyn Error + Send + Sync>> {
        if self.context_strategy.should_compact(&self.session) {
            self.context_strategy
                .compact(&mut self.session, &self.thought_chain, &self.id)
                .await?;
        }
        self.session.send_message(Role::User, content.to_string()).await
    }

    /// Sends `content` as a user turn and requests a streaming completion.
    ///
    /// Returns `Ok(None)` when the backing [`ClientWrapper`] has no
    /// streaming support, in which case the caller should fall back to
    /// [`process_message`](Self::process_message). Unlike `process_message`,
    /// this does not record the assistant's reply into history itself —
    /// call [`record_streamed_response`](Self::record_streamed_response)
    /// with the accumulated text once the stream ends.
    pub async fn process_message_stream(
        &mut self,
        content: &str,
    ) -> Result<Option<MessageChunkStream>, Box<dyn Error + Send + Sync>> {
        if self.context_strategy.should_compact(&self.session) {
            self.context_strategy
                .compact(&mut self.session, &self.thought_chain, &self.id)
                .await?;
        }
        self.session
            .send_message_stream(Role::User, content.to_string())
            .await
    }

    /// Records the full text accumulated from a
    /// [`process_message_stream`](Self::process_message_stream) stream as
    /// the assistant's turn, without sending anything to the LLM.
    pub fn record_streamed_response(&mut self, content: &str) {
        self.session.inject_message(Role::Assistant, content.to_string());
    }

    /// Appends an entry to the attached [`ThoughtChain`], if any.
    pub async fn commit(
        &self,
        entry_type: ThoughtType,
        content: &str,
    ) -> Option<Result<(), Box<dyn Error + Send + Sync>>> {
        let chain = self.thought_chain.as_ref()?;
        let mut chain = chain.write().await;
        Some(
            chain
                .append(&self.id, entry_type, content)
                .map(|_| ())
                .map_err(|e| Box::new(e) as Box<dyn Error + Send + Sync>),
        )
    }

    pub async fn thought_entries(&self) -> Option<Vec<Thought>> {
        let chain = self.thought_chain.as_ref()?;
        let chain = chain.read().await;
        Some(chain.thoughts().to_vec())
    }

    /// Produces a fresh agent sharing this one's client, thought chain, and
    /// identity prefix, with an empty session. Used when spawning a Worker
    /// or PM whose lineage should be traceable back to its parent, without
    /// inheriting the parent's conversation history.
    ///
    /// `LLMSession` owns its history as plain `Vec<Message>`, so unlike the
    /// provider client (cheaply `Arc`-cloned) a full `Clone` impl would have
    /// to deep-copy history on every spawn; `fork` makes the reset explicit.
    pub fn fork(&self, new_id: impl Into<String>, new_name: impl Into<String>, role: AgentRole) -> Self {
        let mut forked = Agent::new(new_id, new_name, role, self.session.client().clone());
        forked.parent_id = Some(self.id.clone());
        forked.thought_chain = self.thought_chain.clone();
        forked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hive::client_wrapper::ToolDefinition;
    use async_trait::async_trait;

    struct StubClient;

    #[async_trait]
    impl ClientWrapper for StubClient {
        async fn send_message(
            &self,
            _messages: &[Message],
            _tools: Option<Vec<ToolDefinition>>,
        ) -> Result<Message, Box<dyn Error>> {
            Ok(Message {
                role: Role::Assistant,
                content: Arc::from("ack"),
                tool_calls: Vec::new(),
            })
        }

        fn model_name(&self) -> &str {
            "stub"
        }
    }

    fn agent(role: AgentRole) -> Agent {
        Agent::new("a1", "Agent One", role, Arc::new(StubClient))
    }

    #[test]
    fn new_agent_starts_in_role_initial_state() {
        let a = agent(AgentRole::Worker);
        assert_eq!(a.state(), StateMachine::initial_state(AgentRole::Worker));
    }

    #[test]
    fn builder_methods_chain() {
        let a = agent(AgentRole::ProjectManager)
            .with_expertise("scheduling")
            .with_personality("calm")
            .with_metadata("team", "infra");
        assert_eq!(a.expertise.as_deref(), Some("scheduling"));
        assert_eq!(a.metadata.get("team").map(|s| s.as_str()), Some("infra"));
    }

    #[tokio::test]
    async fn process_message_returns_raw_response() {
        let mut a = agent(AgentRole::Worker);
        let response = a.process_message("do the thing").await.unwrap();
        assert_eq!(response.content.as_ref(), "ack");
        assert_eq!(a.session_history_len(), 2);
    }

    #[test]
    fn fork_resets_history_and_records_lineage() {
        let a = agent(AgentRole::ProjectManager);
        let child = a.fork("w1", "Worker One", AgentRole::Worker);
        assert_eq!(child.parent_id.as_deref(), Some("a1"));
        assert_eq!(child.session_history_len(), 0);
    }

    #[test]
    fn set_state_overwrites_without_validation() {
        let mut a = agent(AgentRole::Guardian);
        a.set_state(AgentState::Reviewing);
        assert_eq!(a.state(), AgentState::Reviewing);
    }
}
