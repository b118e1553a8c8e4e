//! Independent review of terminal agent responses (C9).
//!
//! The Guardian is stateless: it takes a finished assistant message plus
//! the agent metadata it came from, and returns either [`ReviewOutcome::Ok`]
//! or a [`Violation`]. It never mutates agent state itself — the caller
//! ([`CycleHandler`](crate::hive::cycle_handler)) decides what a violation
//! means for the agent's next state, per §4.9.
//!
//! The decision procedure is a three-stage pipeline: deterministic pattern
//! checks first, then a fixed policy table, and only when both pass but a
//! lightweight similarity heuristic flags the text as close to a policy
//! phrase, an optional LLM-backed nuance check.

use crate::hive::client_wrapper::{ClientWrapper, Message, Role};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// How serious a [`Violation`] is. Low/Medium are auto-remediated; only
/// High/Critical pause the agent for user review — see §4.9.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// What kind of principle a [`Violation`] breaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationKind {
    /// Personal-data marker (email, phone, government id) about to leave
    /// the local hub.
    Privacy,
    /// Forbidden assertion from the policy table (e.g. claims of central
    /// control over other agents or systems).
    PolicyAssertion,
    /// Flagged by the optional LLM nuance check, not by a deterministic rule.
    Nuance,
}

/// A single Guardian finding against a terminal response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Violation {
    pub kind: ViolationKind,
    pub severity: Severity,
    pub principle: String,
    pub description: String,
    pub suggested_remediation: String,
    pub offending_agent_id: String,
    pub timestamp: DateTime<Utc>,
}

/// The Guardian's verdict on a terminal response.
#[derive(Debug, Clone)]
pub enum ReviewOutcome {
    Ok,
    Violation(Violation),
}

/// One entry in the deterministic forbidden-assertion table.
struct PolicyRule {
    principle: &'static str,
    /// Lowercased substrings; any match flags the rule.
    phrases: &'static [&'static str],
    severity: Severity,
}

const POLICY_TABLE: &[PolicyRule] = &[
    PolicyRule {
        principle: "no claims of central control",
        phrases: &[
            "i control all agents",
            "i have override authority",
            "i can act without approval",
        ],
        severity: Severity::High,
    },
    PolicyRule {
        principle: "no fabricated authority",
        phrases: &["on behalf of the administrator, i authorize", "as the system administrator"],
        severity: Severity::Medium,
    },
];

/// Minimal deterministic markers for personal data leaving the local hub.
/// Intentionally simple pattern matching, not a full PII scanner — see
/// SPEC_FULL.md §4.9, which scopes this to "deterministic pattern checks"
/// rather than a general privacy classifier.
fn find_privacy_marker(text: &str) -> Option<&'static str> {
    if text.contains('@') && text.contains('.') {
        return Some("email address");
    }
    let digits: String = text.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() >= 9 && text.contains('-') {
        return Some("government id or phone number");
    }
    None
}

/// Bigram-overlap similarity, reused for the Guardian's ambiguity heuristic
/// and matching the novelty-scoring technique in
/// [`crate::hive::context_strategy`].
pub(crate) fn bigram_overlap(a: &str, b: &str) -> f64 {
    fn bigrams(s: &str) -> std::collections::HashSet<(char, char)> {
        let chars: Vec<char> = s.to_lowercase().chars().collect();
        chars.windows(2).map(|w| (w[0], w[1])).collect()
    }
    let ba = bigrams(a);
    let bb = bigrams(b);
    if ba.is_empty() || bb.is_empty() {
        return 0.0;
    }
    let intersection = ba.intersection(&bb).count();
    let union = ba.union(&bb).count();
    intersection as f64 / union as f64
}

/// Reviews a closed set of policy phrases against the candidate text; a
/// similarity above this threshold (but not an exact phrase match) is
/// ambiguous enough to warrant the optional LLM nuance check.
const AMBIGUITY_THRESHOLD: f64 = 0.25;

/// Stateless reviewer of terminal agent responses (C9).
pub struct Guardian {
    nuance_client: Option<Arc<dyn ClientWrapper>>,
}

impl Guardian {
    /// A Guardian with no nuance-check client; deterministic checks only.
    pub fn new() -> Self {
        Self { nuance_client: None }
    }

    /// A Guardian that also runs an LLM-backed nuance check when the
    /// ambiguity heuristic fires.
    pub fn with_nuance_client(client: Arc<dyn ClientWrapper>) -> Self {
        Self {
            nuance_client: Some(client),
        }
    }

    /// Review `text`, produced by `agent_id`, for policy compliance.
    pub async fn review(&self, agent_id: &str, text: &str) -> ReviewOutcome {
        if let Some(marker) = find_privacy_marker(text) {
            return ReviewOutcome::Violation(Violation {
                kind: ViolationKind::Privacy,
                severity: Severity::Medium,
                principle: "no personal data leaves the local hub".to_string(),
                description: format!("response contains what looks like a {}", marker),
                suggested_remediation: "redact the matched span before release".to_string(),
                offending_agent_id: agent_id.to_string(),
                timestamp: Utc::now(),
            });
        }

        let lower = text.to_lowercase();
        let mut best_overlap = 0.0_f64;
        for rule in POLICY_TABLE {
            for phrase in rule.phrases {
                if lower.contains(phrase) {
                    return ReviewOutcome::Violation(Violation {
                        kind: ViolationKind::PolicyAssertion,
                        severity: rule.severity,
                        principle: rule.principle.to_string(),
                        description: format!("response asserts: \"{}\"", phrase),
                        suggested_remediation: match rule.severity {
                            Severity::Low | Severity::Medium => {
                                "rewrite the assertion with the claim removed".to_string()
                            }
                            Severity::High | Severity::Critical => {
                                "pause for user review; no automatic remediation".to_string()
                            }
                        },
                        offending_agent_id: agent_id.to_string(),
                        timestamp: Utc::now(),
                    });
                }
                let overlap = bigram_overlap(&lower, phrase);
                if overlap > best_overlap {
                    best_overlap = overlap;
                }
            }
        }

        if best_overlap >= AMBIGUITY_THRESHOLD {
            if let Some(client) = &self.nuance_client {
                if let Some(violation) = self.run_nuance_check(client.as_ref(), agent_id, text).await {
                    return ReviewOutcome::Violation(violation);
                }
            }
        }

        ReviewOutcome::Ok
    }

    async fn run_nuance_check(
        &self,
        client: &dyn ClientWrapper,
        agent_id: &str,
        text: &str,
    ) -> Option<Violation> {
        let prompt = format!(
            "Does the following response assert central control over other \
             agents/systems, fabricate authority, or imply unilateral override \
             power? Answer with exactly one word, YES or NO.\n\nResponse:\n{}",
            text
        );
        let messages = vec![Message {
            role: Role::User,
            content: Arc::from(prompt.as_str()),
            tool_calls: vec![],
        }];
        let reply = client.send_message(&messages, None).await.ok()?;
        if reply.content.trim().to_uppercase().starts_with("YES") {
            Some(Violation {
                kind: ViolationKind::Nuance,
                severity: Severity::Medium,
                principle: "no claims of central control".to_string(),
                description: "LLM nuance check flagged an implied authority claim".to_string(),
                suggested_remediation: "rewrite to remove the implied authority claim".to_string(),
                offending_agent_id: agent_id.to_string(),
                timestamp: Utc::now(),
            })
        } else {
            None
        }
    }
}

impl Default for Guardian {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn clean_response_passes() {
        let guardian = Guardian::new();
        let outcome = guardian.review("worker-1", "The build finished successfully.").await;
        assert!(matches!(outcome, ReviewOutcome::Ok));
    }

    #[tokio::test]
    async fn email_is_flagged_as_privacy() {
        let guardian = Guardian::new();
        let outcome = guardian
            .review("worker-1", "Contact the customer at jane.doe@example.com for details.")
            .await;
        match outcome {
            ReviewOutcome::Violation(v) => assert_eq!(v.kind, ViolationKind::Privacy),
            _ => panic!("expected a violation"),
        }
    }

    #[tokio::test]
    async fn central_control_assertion_is_high_severity() {
        let guardian = Guardian::new();
        let outcome = guardian
            .review("pm-1", "I control all agents in this hive and will override any decision.")
            .await;
        match outcome {
            ReviewOutcome::Violation(v) => {
                assert_eq!(v.kind, ViolationKind::PolicyAssertion);
                assert_eq!(v.severity, Severity::High);
            }
            _ => panic!("expected a violation"),
        }
    }

    #[test]
    fn bigram_overlap_is_symmetric_and_bounded() {
        let a = "i control all agents";
        let b = "i control every agent";
        let overlap = bigram_overlap(a, b);
        assert!(overlap > 0.0 && overlap <= 1.0);
        assert_eq!(overlap, bigram_overlap(b, a));
    }
}
