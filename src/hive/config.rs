//! Configuration for the orchestration core.
//!
//! Provides [`HiveConfig`], the struct [`AgentManager`](crate::hive::agent_manager::AgentManager)
//! is constructed with. Users build this manually — no TOML/YAML/env parsing
//! dependency is introduced; that belongs to the embedder, not the core.
//!
//! # Example
//!
//! ```rust
//! use hai_hive::HiveConfig;
//! use std::path::PathBuf;
//!
//! // Defaults match the values described in the component design.
//! let config = HiveConfig::default();
//!
//! // Or override individual fields.
//! let config = HiveConfig {
//!     thought_chain_dir: Some(PathBuf::from("/var/data/agent_chains")),
//!     ..HiveConfig::default()
//! };
//! ```

use std::path::PathBuf;
use std::time::Duration;

/// In-process configuration for the orchestration core.
///
/// This struct is intentionally minimal and users construct it however they
/// want. No config-file parsing dependency is introduced by this crate.
#[derive(Debug, Clone)]
pub struct HiveConfig {
    /// Number of cooperative workers draining the schedule queue.
    pub worker_pool_size: usize,
    /// Capacity of the event bus's ring buffer for late-joining subscribers.
    pub event_ring_size: usize,
    /// Per-subscriber backpressure high-water mark before events are dropped.
    pub subscriber_high_water_mark: usize,
    /// Wall-clock deadline for a single agent cycle.
    pub default_cycle_deadline: Duration,
    /// Default timeout for a `ResponseCollector` future.
    pub default_response_timeout: Duration,
    /// Token-estimate ceiling that triggers context summarization, expressed
    /// as a fraction of the model's context window (matches the teacher's
    /// `TrimStrategy` default of 0.85).
    pub token_summarization_threshold: f64,
    /// Interval at which any PM agent in `Manage` state is woken to
    /// re-evaluate task progress.
    pub pm_tick_interval: Duration,
    /// Number of consecutive health-monitor breaches before a corrective
    /// message is injected, and before the agent is forced to `Error`.
    pub health_breach_warn_at: u32,
    pub health_breach_error_at: u32,
    /// Directory under which per-agent `ThoughtChain` `.jsonl` files are
    /// stored. `None` runs the system in the volatile mode external
    /// interface §6 allows — no agent gets a chain attached.
    pub thought_chain_dir: Option<PathBuf>,
}

impl Default for HiveConfig {
    /// Defaults match the values named throughout the component design:
    /// a 5 minute cycle deadline, a 30 second response timeout, a 1000-slot
    /// event ring, a 60 second PM tick, and the volatile (no durable
    /// memory) mode.
    fn default() -> Self {
        Self {
            worker_pool_size: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            event_ring_size: 1000,
            subscriber_high_water_mark: 256,
            default_cycle_deadline: Duration::from_secs(5 * 60),
            default_response_timeout: Duration::from_secs(30),
            token_summarization_threshold: 0.85,
            pm_tick_interval: Duration::from_secs(60),
            health_breach_warn_at: 3,
            health_breach_error_at: 5,
            thought_chain_dir: None,
        }
    }
}
