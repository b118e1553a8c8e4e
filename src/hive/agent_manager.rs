//! Root orchestrator: owns the agent table, the schedule queue, and every
//! shared core component (C10).
//!
//! Owns the agent table, schedule queue, worker pool, and PM ticker
//! described in SPEC_FULL.md §4.10/§5. `AgentManager` is the only component that
//! mutates the agent table directly; [`CycleHandler`] and
//! [`WorkflowManager`] reach it only through the narrow [`ManagerHandle`]
//! and [`WorkflowHost`] capability traits tools and triggers are scoped to.

use crate::hive::client_wrapper::{ClientWrapper, Role};
use crate::hive::config::HiveConfig;
use crate::hive::cycle_handler::{CycleHandler, HealthMonitor};
use crate::hive::error::HiveError;
use crate::hive::event::{AgentEvent, AgentEventPayload, EventBus};
use crate::hive::guardian::Guardian;
use crate::hive::output_parser::WorkflowTrigger;
use crate::hive::response_collector::{CollectedResponse, CollectorError, ResponseCollector};
use crate::hive::state_machine::{AgentRole, AgentState, StateMachine};
use crate::hive::agent::Agent;
use crate::hive::tool_protocol::{ManagerHandle, ToolRegistry};
use crate::hive::workflow_manager::{
    expected_trigger_state, trigger_label, TaskSpec, WorkflowHost, WorkflowManager,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};

/// A queued cycle input, plus the correlation id [`handle_user_message`](AgentManager::handle_user_message)
/// opened a [`ResponseCollector`] slot under, if this input came from a
/// caller awaiting a reply rather than an internal re-prompt (PM tick,
/// retry, delivered message).
#[derive(Default, Clone)]
struct PendingInput {
    content: String,
    correlation_id: Option<String>,
}

/// Root orchestrator owning the full agent hierarchy.
///
/// Cloning shares the underlying tables (all fields are `Arc`-backed),
/// which is how the worker pool's spawned tasks and the public handle a
/// caller holds stay in sync.
#[derive(Clone)]
pub struct AgentManager {
    agents: Arc<RwLock<HashMap<String, Agent>>>,
    tasks: Arc<RwLock<HashMap<String, Vec<TaskSpec>>>>,
    health_monitors: Arc<Mutex<HashMap<String, HealthMonitor>>>,
    pending_inputs: Arc<Mutex<HashMap<String, PendingInput>>>,
    queued: Arc<Mutex<HashSet<String>>>,
    schedule_tx: mpsc::UnboundedSender<String>,
    schedule_rx: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
    state_machine: Arc<StateMachine>,
    event_bus: EventBus,
    response_collector: Arc<ResponseCollector>,
    tool_registry: Arc<ToolRegistry>,
    guardian: Arc<Guardian>,
    default_client: Arc<dyn ClientWrapper>,
    config: HiveConfig,
}

impl AgentManager {
    pub fn new(
        config: HiveConfig,
        default_client: Arc<dyn ClientWrapper>,
        tool_registry: Arc<ToolRegistry>,
        guardian: Arc<Guardian>,
    ) -> Self {
        let (schedule_tx, schedule_rx) = mpsc::unbounded_channel();
        Self {
            agents: Arc::new(RwLock::new(HashMap::new())),
            tasks: Arc::new(RwLock::new(HashMap::new())),
            health_monitors: Arc::new(Mutex::new(HashMap::new())),
            pending_inputs: Arc::new(Mutex::new(HashMap::new())),
            queued: Arc::new(Mutex::new(HashSet::new())),
            schedule_tx,
            schedule_rx: Arc::new(Mutex::new(schedule_rx)),
            state_machine: Arc::new(StateMachine::new()),
            event_bus: EventBus::new(config.event_ring_size, config.subscriber_high_water_mark),
            response_collector: Arc::new(ResponseCollector::new(config.default_response_timeout)),
            tool_registry,
            guardian,
            default_client,
            config,
        }
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Registers the initial Admin agent and returns its id.
    pub async fn spawn_admin(&self, id: impl Into<String>, name: impl Into<String>) -> String {
        let id = id.into();
        let agent = Agent::new(id.clone(), name, AgentRole::Admin, self.default_client.clone());
        self.agents.write().await.insert(id.clone(), agent);
        id
    }

    /// Starts `worker_pool_size` cooperative workers draining the schedule
    /// queue, plus a ticker that re-prompts every `Manage`-state PM every
    /// `pm_tick_interval`. Returns immediately; both run as background
    /// tasks for as long as `self` (and its clones) stay alive.
    pub fn run(&self) {
        for _ in 0..self.config.worker_pool_size.max(1) {
            let manager = self.clone();
            tokio::spawn(async move { manager.worker_loop().await });
        }
        let manager = self.clone();
        tokio::spawn(async move { manager.pm_ticker_loop().await });
    }

    async fn worker_loop(&self) {
        loop {
            let agent_id = {
                let mut rx = self.schedule_rx.lock().await;
                match rx.recv().await {
                    Some(id) => id,
                    None => return,
                }
            };
            self.queued.lock().await.remove(&agent_id);
            self.run_one_cycle(&agent_id).await;
        }
    }

    async fn pm_ticker_loop(&self) {
        let mut interval = tokio::time::interval(self.config.pm_tick_interval);
        loop {
            interval.tick().await;
            let pm_ids: Vec<String> = {
                let agents = self.agents.read().await;
                agents
                    .values()
                    .filter(|a| a.role == AgentRole::ProjectManager && a.state() == AgentState::Manage)
                    .map(|a| a.id.clone())
                    .collect()
            };
            for pm_id in pm_ids {
                self.queue_input(&pm_id, "Re-evaluate task progress and report status.")
                    .await;
                self.schedule_cycle(&pm_id).await;
            }
        }
    }

    /// Queues `content` as the next cycle's input for `agent_id`, replacing
    /// any not-yet-consumed pending input. Not tied to any caller awaiting a
    /// reply; see [`queue_input_for`](Self::queue_input_for) for that case.
    async fn queue_input(&self, agent_id: &str, content: &str) {
        self.queue_input_for(agent_id, content, None).await;
    }

    /// Queues `content` as the next cycle's input for `agent_id`, recording
    /// `correlation_id` so [`run_one_cycle`](Self::run_one_cycle) knows which
    /// [`ResponseCollector`] slot to resolve once the cycle completes.
    async fn queue_input_for(
        &self,
        agent_id: &str,
        content: &str,
        correlation_id: Option<String>,
    ) {
        self.pending_inputs.lock().await.insert(
            agent_id.to_string(),
            PendingInput {
                content: content.to_string(),
                correlation_id,
            },
        );
    }

    /// Schedules a cycle for `agent_id`. Idempotent while already queued:
    /// a second call before the first is drained is a no-op, so a burst of
    /// deliveries to the same agent produces one cycle, not one per message.
    pub async fn schedule_cycle(&self, agent_id: &str) {
        let mut queued = self.queued.lock().await;
        if queued.insert(agent_id.to_string()) {
            let _ = self.schedule_tx.send(agent_id.to_string());
        }
    }

    /// Submits a message to `agent_id` and awaits its next terminal
    /// response, bridging the event-driven cycle back into a single future
    /// the way [`ResponseCollector`] is designed for.
    ///
    /// Opens the collector slot under a freshly generated correlation id
    /// *before* queuing the input or scheduling the cycle, so there is no
    /// window in which the cycle could complete and resolve the slot before
    /// this call starts waiting on it.
    pub async fn handle_user_message(
        &self,
        agent_id: &str,
        content: &str,
    ) -> Result<CollectedResponse, CollectorError> {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let rx = self.response_collector.open(correlation_id.clone());
        self.queue_input_for(agent_id, content, Some(correlation_id.clone()))
            .await;
        self.schedule_cycle(agent_id).await;
        self.response_collector.wait(correlation_id, rx, None).await
    }

    async fn run_one_cycle(&self, agent_id: &str) {
        let pending = self
            .pending_inputs
            .lock()
            .await
            .remove(agent_id)
            .unwrap_or_default();

        let mut monitors = self.health_monitors.lock().await;
        let monitor = monitors
            .entry(agent_id.to_string())
            .or_insert_with(|| HealthMonitor::new(6));

        let mut agents = self.agents.write().await;
        let Some(agent) = agents.get_mut(agent_id) else {
            return;
        };

        let result = CycleHandler::run_cycle(
            agent,
            &pending.content,
            &self.event_bus,
            &self.tool_registry,
            &self.guardian,
            monitor,
            self.config.default_cycle_deadline,
            &self.state_machine,
        )
        .await;
        drop(monitors);

        if let Some(err) = result.error {
            drop(agents);
            self.handle_cycle_error(agent_id, pending.correlation_id.as_deref(), err)
                .await;
            return;
        }

        let role = agents.get(agent_id).map(|a| a.role);
        drop(agents);

        for trigger in result.triggers {
            self.apply_trigger_if_legal(agent_id, trigger).await;
        }

        if let Some(text) = result.final_text {
            if let Some(correlation_id) = pending.correlation_id.as_deref() {
                self.response_collector.add_chunk(correlation_id, &text);
                self.response_collector.complete(correlation_id);
            }
            self.advance_state_after_cycle(agent_id, role).await;
        }
    }

    /// Checks `trigger`'s source agent is in the role/state SPEC_FULL.md §4.8
    /// requires for it before handing it to [`WorkflowManager::apply`]. A
    /// trigger observed out of state is rejected with a system message
    /// appended to the agent's own history instead of being applied.
    async fn apply_trigger_if_legal(&self, agent_id: &str, trigger: WorkflowTrigger) {
        let (expected_role, expected_state) = expected_trigger_state(&trigger);
        let (role, state) = {
            let agents = self.agents.read().await;
            match agents.get(agent_id) {
                Some(agent) => (agent.role, agent.state()),
                None => return,
            }
        };

        if role != expected_role || state != expected_state {
            let mut agents = self.agents.write().await;
            if let Some(agent) = agents.get_mut(agent_id) {
                agent.receive_message(
                    Role::System,
                    format!(
                        "'{}' ignored: requires role {} in state {:?}, but you are {} in state {:?}",
                        trigger_label(&trigger),
                        expected_role,
                        expected_state,
                        role,
                        state
                    ),
                );
            }
            return;
        }

        let is_plan = matches!(trigger, WorkflowTrigger::Plan { .. });
        if WorkflowManager::apply(trigger, agent_id, self, &self.event_bus)
            .await
            .is_ok()
            && is_plan
        {
            // Admin hands the initiative to its new PM and returns to
            // Conversation rather than staying parked in Planning.
            self.transition(agent_id, AgentState::Conversation).await;
        }
    }

    async fn handle_cycle_error(
        &self,
        agent_id: &str,
        correlation_id: Option<&str>,
        err: HiveError,
    ) {
        if err.is_retryable() {
            self.queue_input_for(agent_id, "", correlation_id.map(str::to_string))
                .await;
            self.schedule_cycle(agent_id).await;
            return;
        }
        let _ = self.transition(agent_id, AgentState::Error).await;
        let key = correlation_id.unwrap_or(agent_id);
        self.response_collector.fail(key, err.to_string());
    }

    /// Advances `agent_id` out of its current working state once a cycle
    /// completes cleanly. PM/Worker/Guardian lifecycles fold back to a
    /// waiting state between cycles; the Admin stays in `Conversation`
    /// until a `plan` trigger moves it to `Planning` (handled by
    /// [`WorkflowManager`] itself, not here).
    async fn advance_state_after_cycle(&self, agent_id: &str, role: Option<AgentRole>) {
        let Some(role) = role else { return };
        let target = match role {
            AgentRole::Worker => AgentState::Wait,
            AgentRole::ProjectManager => AgentState::Standby,
            AgentRole::Guardian => AgentState::Monitoring,
            AgentRole::Admin => return,
        };
        let _ = self.transition(agent_id, target).await;
    }

    /// Applies a framework-initiated state transition, per SPEC_FULL.md
    /// §4.3/§8 scenario 5. `to == AgentState::Error` is always legal — it is
    /// the sink [`handle_cycle_error`](Self::handle_cycle_error) forces an
    /// agent into, never subject to the role's own transition table. Any
    /// other illegal transition is rejected: the agent is pushed to `Error`
    /// anyway (an internally-triggered transition is a programming error,
    /// not a recoverable mistake the agent can talk its way out of the way
    /// a self-requested one can), a system message explaining why is
    /// appended to its history, and `Err(HiveError::InvalidTransition)` is
    /// returned to the caller.
    async fn transition(&self, agent_id: &str, to: AgentState) -> Result<(), HiveError> {
        let mut agents = self.agents.write().await;
        let Some(agent) = agents.get_mut(agent_id) else {
            return Ok(());
        };
        let from = agent.state();
        let role = agent.role;

        if to == AgentState::Error || self.state_machine.can_transition(role, from, to) {
            agent.set_state(to);
            drop(agents);
            self.event_bus.emit(AgentEvent::new(
                agent_id,
                None,
                AgentEventPayload::StateChange { role: role.to_string(), from, to },
            ));
            return Ok(());
        }

        let err = HiveError::InvalidTransition {
            agent_id: agent_id.to_string(),
            role: role.to_string(),
            from,
            to,
        };
        agent.receive_message(Role::System, err.to_string());
        agent.set_state(AgentState::Error);
        drop(agents);
        self.event_bus.emit(AgentEvent::new(
            agent_id,
            None,
            AgentEventPayload::StateChange {
                role: role.to_string(),
                from,
                to: AgentState::Error,
            },
        ));
        self.event_bus.emit(AgentEvent::new(
            agent_id,
            None,
            AgentEventPayload::Error {
                kind: "invalid_transition".to_string(),
                message: err.to_string(),
            },
        ));
        Err(err)
    }
}

#[async_trait]
impl ManagerHandle for AgentManager {
    async fn deliver_message(
        &self,
        from_agent_id: &str,
        to_agent_id: &str,
        content: serde_json::Value,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let text = content
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| content.to_string());
        {
            let mut agents = self.agents.write().await;
            let sender_name = agents
                .get(from_agent_id)
                .map(|a| a.name.clone())
                .unwrap_or_else(|| from_agent_id.to_string());
            let Some(recipient) = agents.get_mut(to_agent_id) else {
                return Err(format!("unknown recipient agent '{}'", to_agent_id).into());
            };
            recipient.receive_message(Role::User, format!("[from {}] {}", sender_name, text));
        }
        self.schedule_cycle(to_agent_id).await;
        Ok(())
    }
}

#[async_trait]
impl WorkflowHost for AgentManager {
    async fn spawn_project_manager(
        &self,
        parent_id: &str,
        charter: &str,
    ) -> Result<String, Box<dyn Error + Send + Sync>> {
        let new_id = format!("pm-{}", uuid::Uuid::new_v4());
        let mut pm = Agent::new(
            new_id.clone(),
            format!("PM for {}", parent_id),
            AgentRole::ProjectManager,
            self.default_client.clone(),
        )
        .with_parent(parent_id.to_string());
        pm.set_system_prompt(format!(
            "You are managing the following initiative:\n{}",
            charter
        ));
        self.agents.write().await.insert(new_id.clone(), pm);
        self.transition(&new_id, AgentState::BuildTeamTasks).await?;
        Ok(new_id)
    }

    async fn spawn_worker(
        &self,
        parent_id: &str,
        role_description: &str,
        skills: Option<&str>,
    ) -> Result<String, Box<dyn Error + Send + Sync>> {
        let new_id = format!("worker-{}", uuid::Uuid::new_v4());
        let mut worker = Agent::new(
            new_id.clone(),
            role_description.to_string(),
            AgentRole::Worker,
            self.default_client.clone(),
        )
        .with_parent(parent_id.to_string());
        if let Some(skills) = skills {
            worker = worker.with_expertise(skills.to_string());
        }
        worker.set_system_prompt(format!("You are a {} worker.", role_description));
        self.agents.write().await.insert(new_id.clone(), worker);
        Ok(new_id)
    }

    async fn record_task_list(
        &self,
        pm_agent_id: &str,
        tasks: Vec<TaskSpec>,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.tasks.write().await.insert(pm_agent_id.to_string(), tasks);
        self.transition(pm_agent_id, AgentState::ActivateWorkers).await?;
        Ok(())
    }

    async fn dispatch_task(
        &self,
        worker_agent_id: &str,
        task: &TaskSpec,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let mut agents = self.agents.write().await;
        if let Some(worker) = agents.get_mut(worker_agent_id) {
            worker.receive_message(
                Role::User,
                format!("You have been assigned task '{}' ({})", task.id, task.role),
            );
        }
        drop(agents);
        self.schedule_cycle(worker_agent_id).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hive::client_wrapper::{Message, ToolDefinition};
    use crate::hive::tool_protocols::CustomToolProtocol;

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
                content: Arc::from("All good here."),
                tool_calls: Vec::new(),
            })
        }

        fn model_name(&self) -> &str {
            "stub"
        }
    }

    fn manager() -> AgentManager {
        let tools = Arc::new(ToolRegistry::new(Arc::new(CustomToolProtocol::new())));
        AgentManager::new(
            HiveConfig::default(),
            Arc::new(StubClient),
            tools,
            Arc::new(Guardian::new()),
        )
    }

    #[tokio::test]
    async fn handle_user_message_returns_final_text() {
        let manager = manager();
        let admin_id = manager.spawn_admin("admin-1", "Admin").await;
        manager.run();
        let response = manager.handle_user_message(&admin_id, "hello").await.unwrap();
        assert_eq!(response.text, "All good here.");
    }

    #[tokio::test]
    async fn schedule_cycle_is_idempotent_while_queued() {
        let manager = manager();
        manager.spawn_admin("admin-1", "Admin").await;
        manager.schedule_cycle("admin-1").await;
        manager.schedule_cycle("admin-1").await;
        assert_eq!(manager.queued.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn deliver_message_to_unknown_agent_errors() {
        let manager = manager();
        let err = manager
            .deliver_message("a1", "does-not-exist", serde_json::json!("hi"))
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn illegal_framework_transition_forces_error_state() {
        let manager = manager();
        manager.spawn_admin("admin-1", "Admin").await;
        let before_len = {
            let agents = manager.agents.read().await;
            agents.get("admin-1").unwrap().session_history_len()
        };

        // Admin starts in Idle; Idle -> Planning is not in the role's table.
        let result = manager.transition("admin-1", AgentState::Planning).await;
        assert!(matches!(result, Err(HiveError::InvalidTransition { .. })));

        let agents = manager.agents.read().await;
        let agent = agents.get("admin-1").unwrap();
        assert_eq!(agent.state(), AgentState::Error);
        assert_eq!(agent.session_history_len(), before_len + 1);
    }

    #[tokio::test]
    async fn trigger_out_of_state_is_rejected_without_spawning() {
        let manager = manager();
        manager.spawn_admin("admin-1", "Admin").await;
        // Admin is still Idle, not Planning, so a Plan trigger is illegal.
        manager
            .apply_trigger_if_legal(
                "admin-1",
                WorkflowTrigger::Plan {
                    body: "do the thing".to_string(),
                },
            )
            .await;

        let agents = manager.agents.read().await;
        let agent = agents.get("admin-1").unwrap();
        assert_eq!(agent.state(), AgentState::Idle);
        assert_eq!(agent.session_history_len(), 1);
    }
}
