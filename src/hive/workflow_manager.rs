//! Turns a parsed [`WorkflowTrigger`] into agent-table mutations and state
//! transitions (C8).
//!
//! A stateless dispatch `match` over the four trigger kinds named in
//! SPEC_FULL.md §4.8. `WorkflowManager` only decides *what* should happen — it asks
//! [`AgentManager`](crate::hive::agent_manager::AgentManager), via the
//! [`WorkflowHost`] capability trait, to actually spawn agents, deliver
//! messages, and record task state, rather than owning the agent table
//! itself.

use crate::hive::event::{AgentEvent, AgentEventPayload};
use crate::hive::output_parser::{TaskSpecDraft, WorkflowTrigger};
use crate::hive::state_machine::{AgentRole, AgentState};
use async_trait::async_trait;
use std::error::Error;

/// A task entry tracked by a PM once a `task_list` trigger has been applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    pub id: String,
    pub role: String,
    pub assigned_worker_id: Option<String>,
}

impl From<TaskSpecDraft> for TaskSpec {
    fn from(draft: TaskSpecDraft) -> Self {
        Self {
            id: draft.id,
            role: draft.role,
            assigned_worker_id: None,
        }
    }
}

/// Capability surface `WorkflowManager` needs from the agent table, kept
/// narrow the same way [`crate::hive::tool_protocol::ManagerHandle`] keeps
/// tool dispatch narrow.
#[async_trait]
pub trait WorkflowHost: Send + Sync {
    /// Spawn a ProjectManager reporting to `parent_id`, seeded with `charter`
    /// as its opening instruction. Returns the new agent's id.
    async fn spawn_project_manager(
        &self,
        parent_id: &str,
        charter: &str,
    ) -> Result<String, Box<dyn Error + Send + Sync>>;

    /// Spawn a Worker reporting to `parent_id` with the given role/skills
    /// description. Returns the new agent's id.
    async fn spawn_worker(
        &self,
        parent_id: &str,
        role_description: &str,
        skills: Option<&str>,
    ) -> Result<String, Box<dyn Error + Send + Sync>>;

    /// Record the task list a PM has just committed to.
    async fn record_task_list(
        &self,
        pm_agent_id: &str,
        tasks: Vec<TaskSpec>,
    ) -> Result<(), Box<dyn Error + Send + Sync>>;

    /// Deliver a message into a worker's session and schedule it for a
    /// cycle, used once all of a PM's workers have been activated.
    async fn dispatch_task(
        &self,
        worker_agent_id: &str,
        task: &TaskSpec,
    ) -> Result<(), Box<dyn Error + Send + Sync>>;
}

/// Stateless dispatcher from workflow trigger to host action (C8).
pub struct WorkflowManager;

impl WorkflowManager {
    /// Applies `trigger`, produced by `source_agent_id` (an Admin or PM),
    /// against `host`, emitting the matching [`AgentEvent`] on success.
    pub async fn apply(
        trigger: WorkflowTrigger,
        source_agent_id: &str,
        host: &dyn WorkflowHost,
        event_bus: &crate::hive::event::EventBus,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        match trigger {
            WorkflowTrigger::Plan { body } => {
                let pm_id = host.spawn_project_manager(source_agent_id, &body).await?;
                event_bus.emit(AgentEvent::new(
                    source_agent_id,
                    None,
                    AgentEventPayload::PlanCreated {
                        pm_agent_id: pm_id,
                    },
                ));
                Ok(())
            }
            WorkflowTrigger::TaskList { tasks } => {
                let task_count = tasks.len();
                let tasks: Vec<TaskSpec> = tasks.into_iter().map(TaskSpec::from).collect();
                host.record_task_list(source_agent_id, tasks).await?;
                event_bus.emit(AgentEvent::new(
                    source_agent_id,
                    None,
                    AgentEventPayload::TaskListCreated { task_count },
                ));
                Ok(())
            }
            WorkflowTrigger::CreateWorker { role, skills } => {
                let worker_id = host
                    .spawn_worker(source_agent_id, &role, skills.as_deref())
                    .await?;
                event_bus.emit(AgentEvent::new(
                    source_agent_id,
                    None,
                    AgentEventPayload::WorkerCreated {
                        worker_agent_id: worker_id,
                        role,
                    },
                ));
                Ok(())
            }
        }
    }

    /// Dispatches one task to its assigned worker once activation has
    /// resolved a `worker_agent_id` for it (the fourth trigger-to-action
    /// mapping in SPEC_FULL.md §4.8: ActivateWorkers -> dispatch -> Manage).
    pub async fn dispatch(
        task: &TaskSpec,
        host: &dyn WorkflowHost,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let worker_id = task
            .assigned_worker_id
            .as_deref()
            .ok_or_else(|| -> Box<dyn Error + Send + Sync> {
                format!("task {} has no assigned worker", task.id).into()
            })?;
        host.dispatch_task(worker_id, task).await
    }
}

/// The role and state a trigger's source agent must be in for the trigger
/// to be applied, per SPEC_FULL.md §4.8. A trigger observed outside this
/// combination is rejected by the caller before it ever reaches
/// [`WorkflowManager::apply`].
pub fn expected_trigger_state(trigger: &WorkflowTrigger) -> (AgentRole, AgentState) {
    match trigger {
        WorkflowTrigger::Plan { .. } => (AgentRole::Admin, AgentState::Planning),
        WorkflowTrigger::TaskList { .. } => (AgentRole::ProjectManager, AgentState::Startup),
        WorkflowTrigger::CreateWorker { .. } => {
            (AgentRole::ProjectManager, AgentState::BuildTeamTasks)
        }
    }
}

/// Short, human-readable label for a trigger, used in the system message a
/// PM/Admin receives when its trigger is rejected for being in the wrong
/// state.
pub fn trigger_label(trigger: &WorkflowTrigger) -> &'static str {
    match trigger {
        WorkflowTrigger::Plan { .. } => "plan",
        WorkflowTrigger::TaskList { .. } => "task_list",
        WorkflowTrigger::CreateWorker { .. } => "create_worker",
    }
}

/// True once every task in the list has an assigned worker, the signal a PM
/// uses to leave `ActivateWorkers` for `Manage`.
pub fn all_tasks_assigned(tasks: &[TaskSpec]) -> bool {
    !tasks.is_empty() && tasks.iter().all(|t| t.assigned_worker_id.is_some())
}

/// Default role for a freshly spawned Worker before task assignment labels
/// it more specifically; kept here since [`WorkflowManager`] is what first
/// needs a worker's role before it has a task to describe it.
pub fn default_worker_role() -> AgentRole {
    AgentRole::Worker
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hive::event::EventBus;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingHost {
        spawned_pms: Mutex<Vec<(String, String)>>,
        spawned_workers: Mutex<Vec<(String, String)>>,
        recorded_tasks: Mutex<Vec<(String, usize)>>,
    }

    #[async_trait]
    impl WorkflowHost for RecordingHost {
        async fn spawn_project_manager(
            &self,
            parent_id: &str,
            charter: &str,
        ) -> Result<String, Box<dyn Error + Send + Sync>> {
            self.spawned_pms
                .lock()
                .unwrap()
                .push((parent_id.to_string(), charter.to_string()));
            Ok("pm-1".to_string())
        }

        async fn spawn_worker(
            &self,
            parent_id: &str,
            role_description: &str,
            _skills: Option<&str>,
        ) -> Result<String, Box<dyn Error + Send + Sync>> {
            self.spawned_workers
                .lock()
                .unwrap()
                .push((parent_id.to_string(), role_description.to_string()));
            Ok("worker-1".to_string())
        }

        async fn record_task_list(
            &self,
            pm_agent_id: &str,
            tasks: Vec<TaskSpec>,
        ) -> Result<(), Box<dyn Error + Send + Sync>> {
            self.recorded_tasks
                .lock()
                .unwrap()
                .push((pm_agent_id.to_string(), tasks.len()));
            Ok(())
        }

        async fn dispatch_task(
            &self,
            _worker_agent_id: &str,
            _task: &TaskSpec,
        ) -> Result<(), Box<dyn Error + Send + Sync>> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn plan_trigger_spawns_pm_and_emits_event() {
        let host = RecordingHost::default();
        let bus = EventBus::new(100, 16);
        WorkflowManager::apply(
            WorkflowTrigger::Plan {
                body: "build the thing".to_string(),
            },
            "admin-1",
            &host,
            &bus,
        )
        .await
        .unwrap();
        assert_eq!(host.spawned_pms.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn task_list_trigger_records_tasks() {
        let host = RecordingHost::default();
        let bus = EventBus::new(100, 16);
        WorkflowManager::apply(
            WorkflowTrigger::TaskList {
                tasks: vec![TaskSpecDraft {
                    id: "t1".to_string(),
                    role: "backend".to_string(),
                }],
            },
            "pm-1",
            &host,
            &bus,
        )
        .await
        .unwrap();
        assert_eq!(host.recorded_tasks.lock().unwrap()[0], ("pm-1".to_string(), 1));
    }

    #[test]
    fn expected_trigger_state_matches_spec_table() {
        assert_eq!(
            expected_trigger_state(&WorkflowTrigger::Plan { body: String::new() }),
            (AgentRole::Admin, AgentState::Planning)
        );
        assert_eq!(
            expected_trigger_state(&WorkflowTrigger::TaskList { tasks: vec![] }),
            (AgentRole::ProjectManager, AgentState::Startup)
        );
        assert_eq!(
            expected_trigger_state(&WorkflowTrigger::CreateWorker { role: String::new(), skills: None }),
            (AgentRole::ProjectManager, AgentState::BuildTeamTasks)
        );
    }

    #[test]
    fn all_tasks_assigned_requires_non_empty_and_full_coverage() {
        assert!(!all_tasks_assigned(&[]));
        let unassigned = vec![TaskSpec {
            id: "t1".to_string(),
            role: "backend".to_string(),
            assigned_worker_id: None,
        }];
        assert!(!all_tasks_assigned(&unassigned));
        let assigned = vec![TaskSpec {
            id: "t1".to_string(),
            role: "backend".to_string(),
            assigned_worker_id: Some("w1".to_string()),
        }];
        assert!(all_tasks_assigned(&assigned));
    }
}
