//! Drives one agent through a full think/act/review cycle (C7).
//!
//! Drives a tool-loop-with-events shape, generalized to also drive
//! workflow triggers, a per-agent health monitor, and Guardian review before
//! a response is considered terminal. `CycleHandler` never applies a
//! transition to the agent's `state` itself and never spawns agents for a
//! workflow trigger — it hands both back to the caller
//! ([`AgentManager`](crate::hive::agent_manager::AgentManager)), which owns
//! the agent table and the [`StateMachine`].

use crate::hive::agent::Agent;
use crate::hive::client_wrapper::Role;
use crate::hive::error::HiveError;
use crate::hive::event::{AgentEvent, AgentEventPayload, EventBus};
use crate::hive::guardian::{Guardian, ReviewOutcome, Severity, Violation};
use crate::hive::output_parser::{OutputParser, ParsedItem, WorkflowTrigger};
use crate::hive::state_machine::StateMachine;
use crate::hive::tool_protocol::{AgentContext, ToolRegistry};
use futures_util::StreamExt;
use std::collections::{HashSet, VecDeque};
use std::time::Duration;
use tokio::time::timeout;

/// Ceiling on tool/self-correction round-trips within a single cycle, after
/// which the loop is cut off and the last response is treated as terminal.
const MAX_CYCLE_ITERATIONS: u32 = 5;

/// Everything a cycle produced, for the caller to act on.
#[derive(Debug, Default)]
pub struct CycleResult {
    /// The final assistant text, if the cycle reached one (absent when it
    /// errored before completing an LLM round-trip).
    pub final_text: Option<String>,
    /// Workflow triggers parsed out of the final or any intermediate
    /// response, in the order they appeared.
    pub triggers: Vec<WorkflowTrigger>,
    /// A Guardian finding against the final response, if any.
    pub violation: Option<Violation>,
    /// Classified failure, if the cycle could not complete.
    pub error: Option<HiveError>,
    /// Number of LLM round-trips this cycle used.
    pub iterations: u32,
}

/// Sliding-window health monitor for one agent (§4.7.2).
///
/// Tracks the agent's last few final responses and tool calls to catch the
/// failure modes a single cycle can't see on its own: empty responses,
/// identical outputs repeating, and the same tool call repeating. Reuses
/// the bigram-overlap technique from
/// [`crate::hive::guardian::Guardian`]'s ambiguity heuristic to decide
/// "close enough to count as a repeat" rather than requiring exact string
/// equality.
pub struct HealthMonitor {
    recent_responses: VecDeque<String>,
    recent_tool_calls: VecDeque<(String, serde_json::Value)>,
    window: usize,
    empty_streak: u32,
    repeat_streak: u32,
}

/// Similarity above this is treated as "the same response" for loop
/// detection, matching `guardian.rs`'s `AMBIGUITY_THRESHOLD` scale.
const REPEAT_SIMILARITY_THRESHOLD: f64 = 0.9;

impl HealthMonitor {
    pub fn new(window: usize) -> Self {
        Self {
            recent_responses: VecDeque::with_capacity(window),
            recent_tool_calls: VecDeque::with_capacity(window),
            window,
            empty_streak: 0,
            repeat_streak: 0,
        }
    }

    /// Record a final response and report whether it constitutes a health
    /// breach (empty, or near-identical to the immediately preceding one).
    pub fn record_response(&mut self, text: &str) -> bool {
        let breach = if text.trim().is_empty() {
            self.empty_streak += 1;
            true
        } else {
            self.empty_streak = 0;
            let repeats = self
                .recent_responses
                .back()
                .map(|prev| crate::hive::guardian::bigram_overlap(prev, text) >= REPEAT_SIMILARITY_THRESHOLD)
                .unwrap_or(false);
            if repeats {
                self.repeat_streak += 1;
            } else {
                self.repeat_streak = 0;
            }
            repeats
        };

        if self.recent_responses.len() == self.window {
            self.recent_responses.pop_front();
        }
        self.recent_responses.push_back(text.to_string());
        breach
    }

    /// Record a tool call and report whether the same tool was just called
    /// with the same parameters, which combined with `breach_count` signals
    /// a stuck loop.
    pub fn record_tool_call(&mut self, name: &str, parameters: &serde_json::Value) -> bool {
        let repeats = self
            .recent_tool_calls
            .back()
            .map(|(prev_name, prev_params)| prev_name == name && prev_params == parameters)
            .unwrap_or(false);

        if self.recent_tool_calls.len() == self.window {
            self.recent_tool_calls.pop_front();
        }
        self.recent_tool_calls.push_back((name.to_string(), parameters.clone()));
        repeats
    }

    /// Consecutive breaches recorded so far (max of the two streaks).
    pub fn breach_count(&self) -> u32 {
        self.empty_streak.max(self.repeat_streak)
    }
}

/// Stateless driver for one cycle; holds no per-agent data itself (that
/// lives in the caller-owned [`HealthMonitor`]).
pub struct CycleHandler;

impl CycleHandler {
    /// Runs one cycle for `agent`: an LLM round-trip, a tool/self-correction
    /// loop bounded by [`MAX_CYCLE_ITERATIONS`], and a Guardian review of
    /// the terminal response. `input` is the user-role content for the
    /// first round-trip (e.g. a queued message, or a re-prompt for a
    /// PM tick).
    pub async fn run_cycle(
        agent: &mut Agent,
        input: &str,
        event_bus: &EventBus,
        tool_registry: &ToolRegistry,
        guardian: &Guardian,
        health: &mut HealthMonitor,
        cycle_deadline: Duration,
        state_machine: &StateMachine,
    ) -> CycleResult {
        let mut result = CycleResult::default();
        let agent_id = agent.id.clone();

        event_bus.emit(AgentEvent::new(
            agent_id.as_str(),
            None,
            AgentEventPayload::AgentThinking {
                preview: preview(input),
            },
        ));

        let mut next_input = input.to_string();
        let mut response_text = String::new();

        loop {
            result.iterations += 1;

            match generate_response(agent, &next_input, event_bus, &agent_id, cycle_deadline).await {
                Ok(text) => response_text = text,
                Err(e) => {
                    result.error = Some(e);
                    break;
                }
            }

            let tool_names: HashSet<String> = tool_registry
                .list_tools()
                .into_iter()
                .map(|m| m.name.clone())
                .collect();
            let parser = OutputParser::new(tool_names);
            let items = parser.parse(&response_text);

            let mut follow_up = String::new();
            let mut needs_another_round = false;

            for item in items {
                match item {
                    ParsedItem::Workflow(trigger) => result.triggers.push(trigger),
                    ParsedItem::ToolCall { name, parameters } => {
                        needs_another_round = true;
                        health.record_tool_call(&name, &parameters);
                        event_bus.emit(AgentEvent::new(
                            agent_id.as_str(),
                            None,
                            AgentEventPayload::ToolExecutionStart {
                                tool_name: name.clone(),
                                parameters: parameters.clone(),
                            },
                        ));
                        let ctx = AgentContext {
                            agent_id: agent_id.clone(),
                            role: agent.role,
                        };
                        match tool_registry.execute_for_agent(&name, parameters, &ctx).await {
                            Ok(tool_result) => {
                                event_bus.emit(AgentEvent::new(
                                    agent_id.as_str(),
                                    None,
                                    AgentEventPayload::ToolExecutionComplete {
                                        tool_name: name.clone(),
                                        success: tool_result.success,
                                        error: tool_result.error.clone(),
                                    },
                                ));
                                follow_up.push_str(&format!(
                                    "Tool '{}' result: {}\n",
                                    name, tool_result.output
                                ));
                            }
                            Err(e) => {
                                event_bus.emit(AgentEvent::new(
                                    agent_id.as_str(),
                                    None,
                                    AgentEventPayload::ToolExecutionComplete {
                                        tool_name: name.clone(),
                                        success: false,
                                        error: Some(e.to_string()),
                                    },
                                ));
                                follow_up.push_str(&format!("Tool '{}' failed: {}\n", name, e));
                            }
                        }
                    }
                    ParsedItem::Malformed { span, reason } => {
                        needs_another_round = true;
                        follow_up.push_str(&format!(
                            "Your previous output contained malformed content ({}) in: {}. Correct it.\n",
                            reason, span
                        ));
                    }
                    ParsedItem::StateChangeRequest { to } => {
                        let from = agent.state();
                        if state_machine.can_transition(agent.role, from, to) {
                            agent.set_state(to);
                            event_bus.emit(AgentEvent::new(
                                agent_id.as_str(),
                                None,
                                AgentEventPayload::StateChange {
                                    role: agent.role.to_string(),
                                    from,
                                    to,
                                },
                            ));
                        } else {
                            needs_another_round = true;
                            let rejection = format!(
                                "transition {:?}->{:?} is not allowed for role {:?}",
                                from, to, agent.role
                            );
                            agent.receive_message(Role::System, rejection.clone());
                            follow_up.push_str(&rejection);
                            follow_up.push('\n');
                        }
                    }
                    ParsedItem::Thought { content } => {
                        event_bus.emit(AgentEvent::new(
                            agent_id.as_str(),
                            None,
                            AgentEventPayload::AgentThought { content },
                        ));
                    }
                }
            }

            if !needs_another_round || result.iterations >= MAX_CYCLE_ITERATIONS {
                break;
            }
            next_input = follow_up;
        }

        if result.error.is_some() {
            return result;
        }

        let breach = health.record_response(&response_text);
        if breach && health.breach_count() >= 3 {
            result.error = Some(HiveError::Fatal {
                agent_id: agent_id.clone(),
                message: format!(
                    "health monitor recorded {} consecutive breaches",
                    health.breach_count()
                ),
            });
            return result;
        }

        match guardian.review(&agent_id, &response_text).await {
            ReviewOutcome::Ok => {
                event_bus.emit(AgentEvent::new(
                    agent_id.as_str(),
                    None,
                    AgentEventPayload::ResponseComplete {
                        text: response_text.clone(),
                    },
                ));
                result.final_text = Some(response_text);
            }
            ReviewOutcome::Violation(violation) => {
                event_bus.emit(AgentEvent::new(
                    agent_id.as_str(),
                    None,
                    AgentEventPayload::ConstitutionalViolation {
                        violation: violation.clone(),
                    },
                ));
                if violation.severity >= Severity::High {
                    result.error = Some(HiveError::GuardianPolicy {
                        agent_id: agent_id.clone(),
                        violation: violation.clone(),
                    });
                } else {
                    result.final_text = Some(response_text);
                }
                result.violation = Some(violation);
            }
        }

        result
    }
}

/// Resolves one LLM round-trip's text, preferring a streamed response and
/// falling back to a single blocking round-trip when the agent's client
/// does not support streaming (SPEC_FULL.md §4.6, §4.7). Emits one
/// `ResponseChunk` event per delta in the streaming case, or a single one
/// carrying the full text in the fallback case.
async fn generate_response(
    agent: &mut Agent,
    input: &str,
    event_bus: &EventBus,
    agent_id: &str,
    cycle_deadline: Duration,
) -> Result<String, HiveError> {
    let stream = match timeout(cycle_deadline, agent.process_message_stream(input)).await {
        Err(_) => {
            return Err(HiveError::Transient {
                agent_id: agent_id.to_string(),
                message: "cycle deadline exceeded".to_string(),
            })
        }
        Ok(Err(e)) => {
            return Err(HiveError::Transient {
                agent_id: agent_id.to_string(),
                message: e.to_string(),
            })
        }
        Ok(Ok(stream)) => stream,
    };

    match stream {
        Some(mut stream) => {
            let mut buf = String::new();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| HiveError::Transient {
                    agent_id: agent_id.to_string(),
                    message: e.to_string(),
                })?;
                if !chunk.content.is_empty() {
                    event_bus.emit(AgentEvent::new(
                        agent_id,
                        None,
                        AgentEventPayload::ResponseChunk {
                            text: chunk.content.clone(),
                        },
                    ));
                }
                buf.push_str(&chunk.content);
            }
            agent.record_streamed_response(&buf);
            Ok(buf)
        }
        None => match timeout(cycle_deadline, agent.process_message(input)).await {
            Err(_) => Err(HiveError::Transient {
                agent_id: agent_id.to_string(),
                message: "cycle deadline exceeded".to_string(),
            }),
            Ok(Err(e)) => Err(HiveError::Transient {
                agent_id: agent_id.to_string(),
                message: e.to_string(),
            }),
            Ok(Ok(response)) => {
                let text = response.content.to_string();
                event_bus.emit(AgentEvent::new(
                    agent_id,
                    None,
                    AgentEventPayload::ResponseChunk { text: text.clone() },
                ));
                Ok(text)
            }
        },
    }
}

fn preview(text: &str) -> String {
    let cap = 120.min(text.len());
    let end = text.char_indices().nth(cap).map(|(i, _)| i).unwrap_or(text.len());
    text[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hive::client_wrapper::Message;
    use crate::hive::state_machine::{AgentRole, AgentState};
    use crate::hive::tool_protocols::CustomToolProtocol;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct FixedClient(&'static str);

    #[async_trait]
    impl crate::hive::client_wrapper::ClientWrapper for FixedClient {
        async fn send_message(
            &self,
            _messages: &[Message],
            _tools: Option<Vec<crate::hive::client_wrapper::ToolDefinition>>,
        ) -> Result<Message, Box<dyn std::error::Error>> {
            Ok(Message {
                role: Role::Assistant,
                content: Arc::from(self.0),
                tool_calls: Vec::new(),
            })
        }

        fn model_name(&self) -> &str {
            "fixed"
        }
    }

    fn harness() -> (EventBus, ToolRegistry, Guardian, HealthMonitor, StateMachine) {
        (
            EventBus::new(100, 16),
            ToolRegistry::new(Arc::new(CustomToolProtocol::new())),
            Guardian::new(),
            HealthMonitor::new(6),
            StateMachine::new(),
        )
    }

    #[tokio::test]
    async fn legal_state_change_request_applies() {
        let mut agent = Agent::new(
            "admin-1",
            "Admin",
            AgentRole::Admin,
            Arc::new(FixedClient("<request_state to=\"Conversation\"/>")),
        );
        let (bus, tools, guardian, mut health, sm) = harness();

        let result = CycleHandler::run_cycle(
            &mut agent,
            "hello",
            &bus,
            &tools,
            &guardian,
            &mut health,
            Duration::from_secs(5),
            &sm,
        )
        .await;

        assert!(result.error.is_none());
        assert_eq!(agent.state(), AgentState::Conversation);
    }

    #[tokio::test]
    async fn illegal_state_change_request_is_rejected_without_error() {
        let mut agent = Agent::new(
            "admin-1",
            "Admin",
            AgentRole::Admin,
            Arc::new(FixedClient("<request_state to=\"Planning\"/>")),
        );
        let (bus, tools, guardian, mut health, sm) = harness();

        let result = CycleHandler::run_cycle(
            &mut agent,
            "hello",
            &bus,
            &tools,
            &guardian,
            &mut health,
            Duration::from_secs(5),
            &sm,
        )
        .await;

        assert!(result.error.is_none());
        assert_eq!(agent.state(), AgentState::Idle);
    }

    #[test]
    fn health_monitor_flags_empty_responses() {
        let mut monitor = HealthMonitor::new(4);
        assert!(monitor.record_response(""));
        assert!(monitor.record_response("   "));
        assert_eq!(monitor.breach_count(), 2);
    }

    #[test]
    fn health_monitor_flags_near_identical_responses() {
        let mut monitor = HealthMonitor::new(4);
        assert!(!monitor.record_response("the build finished successfully today"));
        assert!(monitor.record_response("the build finished successfully today."));
    }

    #[test]
    fn health_monitor_resets_on_novel_response() {
        let mut monitor = HealthMonitor::new(4);
        monitor.record_response("alpha response here");
        monitor.record_response("completely different content entirely");
        assert_eq!(monitor.breach_count(), 0);
    }

    #[test]
    fn health_monitor_flags_repeated_tool_calls() {
        let mut monitor = HealthMonitor::new(4);
        let params = serde_json::json!({"a": 1});
        assert!(!monitor.record_tool_call("calculator", &params));
        assert!(monitor.record_tool_call("calculator", &params));
    }
}
