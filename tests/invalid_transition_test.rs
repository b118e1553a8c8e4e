//! Black-box coverage of SPEC_FULL.md §8 Scenario 5 ("Invalid transition
//! rejected"): a framework-initiated state transition that the state
//! machine does not allow forces the agent into `AgentState::Error` and
//! surfaces an `Error` event, rather than silently no-op'ing.
//!
//! A `Worker` only ever legally moves `Work <-> Wait` (state_machine.rs).
//! Running a second cycle while already parked in `Wait` asks
//! `advance_state_after_cycle` to transition `Wait -> Wait`, which is not in
//! that table, so it is the scenario this test drives.

use async_trait::async_trait;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use hai_hive::hive::event::AgentEventPayload;
use hai_hive::hive::tool_protocol::ToolRegistry;
use hai_hive::hive::tool_protocols::CustomToolProtocol;
use hai_hive::hive::workflow_manager::WorkflowHost;
use hai_hive::{AgentManager, ClientWrapper, Guardian, HiveConfig, Message, Role};

struct PlainReplyClient;

#[async_trait]
impl ClientWrapper for PlainReplyClient {
    async fn send_message(
        &self,
        _messages: &[Message],
        _tools: Option<Vec<hai_hive::hive::client_wrapper::ToolDefinition>>,
    ) -> Result<Message, Box<dyn Error>> {
        Ok(Message {
            role: Role::Assistant,
            content: Arc::from("done for now"),
            tool_calls: Vec::new(),
        })
    }

    fn model_name(&self) -> &str {
        "plain"
    }
}

fn manager() -> AgentManager {
    let registry = Arc::new(ToolRegistry::new(Arc::new(CustomToolProtocol::new())));
    AgentManager::new(
        HiveConfig::default(),
        Arc::new(PlainReplyClient),
        registry,
        Arc::new(Guardian::new()),
    )
}

#[tokio::test]
async fn worker_stuck_in_wait_is_forced_to_error_on_next_cycle() {
    let manager = manager();
    let mut events = manager.event_bus().subscribe_all();
    manager.run();

    let worker_id = manager
        .spawn_worker("admin-1", "backend", None)
        .await
        .expect("spawning a worker directly through WorkflowHost should succeed");

    // First cycle: Work -> Wait, a legal transition.
    manager
        .handle_user_message(&worker_id, "pick up task one")
        .await
        .expect("first cycle should complete");

    // Second cycle: advance_state_after_cycle now tries Wait -> Wait, illegal.
    let _ = manager
        .handle_user_message(&worker_id, "pick up task two")
        .await;

    let saw_invalid_transition_error = timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Some(event) => {
                    if let AgentEventPayload::Error { kind, .. } = &event.data {
                        if kind == "invalid_transition" && event.agent_id == worker_id {
                            return true;
                        }
                    }
                }
                None => return false,
            }
        }
    })
    .await
    .expect("an invalid_transition Error event should be emitted within the deadline");

    assert!(saw_invalid_transition_error);
}
