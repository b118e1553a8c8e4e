//! Async pub/sub event bus (C1) and the typed [`AgentEvent`] payload it carries.
//!
//! Every component that observes the orchestration — a transport adapter,
//! a test, a CLI progress bar — subscribes to the bus rather than polling
//! component state directly. The bus never blocks a producer: a slow or
//! wedged subscriber has its oldest undelivered events dropped once its
//! queue crosses the high-water mark, and a single synthetic `Dropped`
//! event tells it how many it missed.
//!
//! # Example
//!
//! ```rust
//! use hai_hive::hive::event::{AgentEvent, AgentEventPayload, EventBus};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let bus = EventBus::new(1000, 256);
//! let mut sub = bus.subscribe_all();
//!
//! bus.emit(AgentEvent::new(
//!     "agent-1",
//!     None,
//!     AgentEventPayload::AgentThinking { preview: "…".into() },
//! ));
//!
//! let received = sub.recv().await.unwrap();
//! assert_eq!(received.agent_id, "agent-1");
//! # }
//! ```

use crate::hive::guardian::Violation;
use crate::hive::state_machine::AgentState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// The canonical set of event types described in the external interface
/// contract: `{ type, agent_id, timestamp, correlation_id?, data, compliant? }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AgentEventPayload {
    AgentThinking { preview: String },
    /// A `<thought>...</thought>` span the agent emitted — surfaced on the
    /// bus only, never appended to the agent's own conversational history.
    AgentThought { content: String },
    ResponseChunk { text: String },
    ResponseComplete { text: String },
    ToolExecutionStart { tool_name: String, parameters: serde_json::Value },
    ToolExecutionComplete {
        tool_name: String,
        success: bool,
        error: Option<String>,
    },
    StateChange { role: String, from: AgentState, to: AgentState },
    Error { kind: String, message: String },
    ConstitutionalCheck { principle: String },
    ConstitutionalViolation { violation: Violation },
    PlanCreated { pm_agent_id: String },
    TaskListCreated { task_count: usize },
    WorkerCreated { worker_agent_id: String, role: String },
    /// Delivered to a subscriber in place of events its queue could not
    /// hold; never appears in bus history.
    Dropped { count: u64 },
}

/// One event on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEvent {
    pub agent_id: String,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: Option<String>,
    pub data: AgentEventPayload,
    pub compliant: Option<bool>,
    seq: u64,
}

impl AgentEvent {
    pub fn new(
        agent_id: impl Into<String>,
        correlation_id: Option<String>,
        data: AgentEventPayload,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            timestamp: Utc::now(),
            correlation_id,
            data,
            compliant: None,
            seq: 0,
        }
    }

    /// Whether this event ends the stream for its correlation id.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.data,
            AgentEventPayload::ResponseComplete { .. } | AgentEventPayload::Error { .. }
        )
    }
}

/// An optional predicate narrowing which events a subscriber receives.
/// `None` (via [`EventBus::subscribe_all`]) receives everything.
pub type EventFilter = Arc<dyn Fn(&AgentEvent) -> bool + Send + Sync>;

/// A live subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    receiver: mpsc::Receiver<AgentEvent>,
    bus: Arc<BusInner>,
}

impl Subscription {
    /// Await the next event delivered to this subscriber.
    pub async fn recv(&mut self) -> Option<AgentEvent> {
        self.receiver.recv().await
    }

    /// Non-blocking poll for a queued event.
    pub fn try_recv(&mut self) -> Option<AgentEvent> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}

struct SubscriberSlot {
    sender: mpsc::Sender<AgentEvent>,
    filter: Option<EventFilter>,
    dropped: Arc<AtomicU64>,
    high_water_mark: usize,
}

struct BusInner {
    subscribers: Mutex<HashMap<u64, SubscriberSlot>>,
    history: Mutex<VecDeque<AgentEvent>>,
    history_capacity: usize,
    default_high_water_mark: usize,
    next_subscriber_id: AtomicU64,
    seq: AtomicU64,
}

impl BusInner {
    fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().unwrap().remove(&id);
    }
}

/// Async pub/sub bus with bounded replay history (C1).
///
/// Fan-out is to all matching subscribers; a given producer's events are
/// delivered to a given subscriber in emission order. Delivery only — a
/// subscriber is responsible for not panicking in its own receive loop;
/// see [`crate::hive::cycle_handler`] for how handler failures are isolated
/// at the call site.
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(history_capacity: usize, default_high_water_mark: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: Mutex::new(HashMap::new()),
                history: Mutex::new(VecDeque::with_capacity(history_capacity)),
                history_capacity,
                default_high_water_mark,
                next_subscriber_id: AtomicU64::new(1),
                seq: AtomicU64::new(0),
            }),
        }
    }

    /// Subscribe to every event on the bus.
    pub fn subscribe_all(&self) -> Subscription {
        self.subscribe_filtered(None)
    }

    /// Subscribe to events matching `filter`.
    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        self.subscribe_filtered(Some(filter))
    }

    fn subscribe_filtered(&self, filter: Option<EventFilter>) -> Subscription {
        let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        let high_water_mark = self.inner.default_high_water_mark;
        let (tx, rx) = mpsc::channel(high_water_mark);
        self.inner.subscribers.lock().unwrap().insert(
            id,
            SubscriberSlot {
                sender: tx,
                filter,
                dropped: Arc::new(AtomicU64::new(0)),
                high_water_mark,
            },
        );
        Subscription {
            id,
            receiver: rx,
            bus: self.inner.clone(),
        }
    }

    pub fn unsubscribe(&self, subscription: Subscription) {
        drop(subscription);
    }

    /// Emit an event. Never blocks: a full subscriber queue has its
    /// event silently replaced by a counted drop, surfaced to that
    /// subscriber as a single `Dropped(n)` event once the queue drains.
    pub fn emit(&self, mut event: AgentEvent) {
        event.seq = self.inner.seq.fetch_add(1, Ordering::SeqCst);

        {
            let mut history = self.inner.history.lock().unwrap();
            if history.len() == self.inner.history_capacity {
                history.pop_front();
            }
            history.push_back(event.clone());
        }

        let subscribers = self.inner.subscribers.lock().unwrap();
        for slot in subscribers.values() {
            if let Some(filter) = &slot.filter {
                if !filter(&event) {
                    continue;
                }
            }
            match slot.sender.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    let n = slot.dropped.fetch_add(1, Ordering::SeqCst) + 1;
                    let marker = AgentEvent::new(
                        event.agent_id.clone(),
                        event.correlation_id.clone(),
                        AgentEventPayload::Dropped { count: n },
                    );
                    let _ = slot.sender.try_send(marker);
                    log::warn!(
                        "event bus: subscriber queue over high-water mark ({}), dropped event for agent {}",
                        slot.high_water_mark,
                        event.agent_id
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }

    /// Return the last `n` events in emission order.
    pub fn history(&self, n: usize) -> Vec<AgentEvent> {
        let history = self.inner.history.lock().unwrap();
        history.iter().rev().take(n).rev().cloned().collect()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fan_out_to_all_subscribers() {
        let bus = EventBus::new(10, 8);
        let mut a = bus.subscribe_all();
        let mut b = bus.subscribe_all();

        bus.emit(AgentEvent::new(
            "agent-1",
            None,
            AgentEventPayload::AgentThinking { preview: "hi".into() },
        ));

        assert!(matches!(
            a.recv().await.unwrap().data,
            AgentEventPayload::AgentThinking { .. }
        ));
        assert!(matches!(
            b.recv().await.unwrap().data,
            AgentEventPayload::AgentThinking { .. }
        ));
    }

    #[tokio::test]
    async fn history_returns_last_n_in_order() {
        let bus = EventBus::new(3, 8);
        for i in 0..5 {
            bus.emit(AgentEvent::new(
                "agent-1",
                None,
                AgentEventPayload::ResponseChunk { text: i.to_string() },
            ));
        }
        let hist = bus.history(3);
        assert_eq!(hist.len(), 3);
        let texts: Vec<String> = hist
            .iter()
            .map(|e| match &e.data {
                AgentEventPayload::ResponseChunk { text } => text.clone(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(texts, vec!["2", "3", "4"]);
    }

    #[tokio::test]
    async fn overflow_is_reported_not_blocked() {
        let bus = EventBus::new(10, 2);
        let mut sub = bus.subscribe_all();
        for i in 0..5 {
            bus.emit(AgentEvent::new(
                "agent-1",
                None,
                AgentEventPayload::ResponseChunk { text: i.to_string() },
            ));
        }
        let mut saw_dropped = false;
        while let Some(evt) = sub.try_recv() {
            if matches!(evt.data, AgentEventPayload::Dropped { .. }) {
                saw_dropped = true;
            }
        }
        assert!(saw_dropped);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = EventBus::new(10, 8);
        let sub = bus.subscribe_all();
        bus.unsubscribe(sub);
        bus.emit(AgentEvent::new(
            "agent-1",
            None,
            AgentEventPayload::ResponseComplete { text: "done".into() },
        ));
    }
}
