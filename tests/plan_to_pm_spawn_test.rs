//! Black-box coverage of SPEC_FULL.md §8 Scenario 1 ("Plan-to-PM spawn"):
//! an Admin that works its way from `Idle` through `Conversation` into
//! `Planning` and then emits a `<plan>` tag ends up spawning a Project
//! Manager and the orchestrator reports a `PlanCreated` event.
//!
//! Exercises only `hai_hive`'s public surface, the way an embedder would.

use async_trait::async_trait;
use std::error::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use hai_hive::hive::event::AgentEventPayload;
use hai_hive::hive::tool_protocol::ToolRegistry;
use hai_hive::hive::tool_protocols::CustomToolProtocol;
use hai_hive::{AgentManager, ClientWrapper, Guardian, HiveConfig, Message, Role};

/// Returns a different canned reply on each successive call, simulating an
/// Admin that first asks to leave `Idle`, then to enter `Planning`, then
/// commits a plan — one call per conversational turn.
struct ScriptedClient {
    replies: Vec<&'static str>,
    calls: AtomicUsize,
}

impl ScriptedClient {
    fn new(replies: Vec<&'static str>) -> Self {
        Self {
            replies,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ClientWrapper for ScriptedClient {
    async fn send_message(
        &self,
        _messages: &[Message],
        _tools: Option<Vec<hai_hive::hive::client_wrapper::ToolDefinition>>,
    ) -> Result<Message, Box<dyn Error>> {
        let turn = self.calls.fetch_add(1, Ordering::SeqCst);
        let text = self.replies.get(turn).copied().unwrap_or("");
        Ok(Message {
            role: Role::Assistant,
            content: Arc::from(text),
            tool_calls: Vec::new(),
        })
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

fn manager(client: Arc<dyn ClientWrapper>) -> AgentManager {
    let registry = Arc::new(ToolRegistry::new(Arc::new(CustomToolProtocol::new())));
    AgentManager::new(HiveConfig::default(), client, registry, Arc::new(Guardian::new()))
}

#[tokio::test]
async fn admin_walks_to_planning_and_spawns_a_pm() {
    let client = Arc::new(ScriptedClient::new(vec![
        "<request_state to=\"Conversation\"/>",
        "<request_state to=\"Planning\"/>",
        "<plan>stand up a payments worker</plan>",
    ]));
    let manager = manager(client);
    let mut events = manager.event_bus().subscribe_all();

    manager.spawn_admin("admin-1", "Admin").await;
    manager.run();

    manager
        .handle_user_message("admin-1", "let's get moving")
        .await
        .expect("first turn should complete");
    manager
        .handle_user_message("admin-1", "please plan the payments rollout")
        .await
        .expect("second turn should complete");
    manager
        .handle_user_message("admin-1", "go ahead and commit to a plan")
        .await
        .expect("third turn should complete");

    let plan_created = timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Some(event) => {
                    if let AgentEventPayload::PlanCreated { pm_agent_id } = event.data {
                        return pm_agent_id;
                    }
                }
                None => panic!("event bus closed before PlanCreated was observed"),
            }
        }
    })
    .await
    .expect("a PlanCreated event should be emitted within the deadline");

    assert!(!plan_created.is_empty());
}
