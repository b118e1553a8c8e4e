//! Incremental extraction of tool calls and workflow triggers from
//! assistant text (C5).
//!
//! The tag scanner generalizes a brace-counting technique to angle brackets:
//! instead of balancing `{`/`}` for one fixed JSON pattern, [`OutputParser`]
//! balances an opening tag against its closing tag (or a self-closing `/>`)
//! for a closed set of recognized top-level names. A top-level tag outside
//! that closed set is never guessed at — it comes back as
//! [`ParsedItem::Malformed`].

use crate::hive::state_machine::AgentState;
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// A single `<task .../>` entry inside a `<task_list>` trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpecDraft {
    pub id: String,
    pub role: String,
}

/// One of the three framework-level actions recognized at the top level,
/// alongside plain tool calls — see SPEC_FULL.md §4.8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowTrigger {
    Plan { body: String },
    TaskList { tasks: Vec<TaskSpecDraft> },
    CreateWorker { role: String, skills: Option<String> },
}

/// The result of extracting one top-level tag from assistant text.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedItem {
    ToolCall { name: String, parameters: Value },
    Workflow(WorkflowTrigger),
    /// `<request_state to="..."/>` — an agent asking to move itself to a
    /// different [`AgentState`]. Resolved against the [`StateMachine`]
    /// (crate::hive::state_machine::StateMachine) by the caller; a rejected
    /// request never reaches [`AgentState::Error`], it just stays put with
    /// an explanatory system message (SPEC_FULL.md §8 scenario 5).
    StateChangeRequest { to: AgentState },
    /// `<thought>...</thought>` — surfaced as an event only, never folded
    /// into the agent's conversational history.
    Thought { content: String },
    /// `span` is the raw offending text; `reason` explains why it was
    /// rejected (unknown tag name, or unterminated before end-of-stream).
    Malformed { span: String, reason: String },
}

/// Maps the `to="..."` attribute of a `<request_state/>` tag onto an
/// [`AgentState`] variant by name. Unknown names fall through to
/// [`ParsedItem::Malformed`] rather than being guessed at.
fn parse_agent_state(name: &str) -> Option<AgentState> {
    Some(match name {
        "Idle" => AgentState::Idle,
        "Conversation" => AgentState::Conversation,
        "Planning" => AgentState::Planning,
        "AwaitingReview" => AgentState::AwaitingReview,
        "Startup" => AgentState::Startup,
        "BuildTeamTasks" => AgentState::BuildTeamTasks,
        "ActivateWorkers" => AgentState::ActivateWorkers,
        "Manage" => AgentState::Manage,
        "Standby" => AgentState::Standby,
        "Work" => AgentState::Work,
        "Wait" => AgentState::Wait,
        "Monitoring" => AgentState::Monitoring,
        "Reviewing" => AgentState::Reviewing,
        "Remediating" => AgentState::Remediating,
        "Error" => AgentState::Error,
        _ => return None,
    })
}

/// Scans assistant text for the closed set of recognized top-level tags:
/// `plan`, `task_list`, `create_worker`, `request_state`, `thought`, and any
/// tag matching a tool registered in the
/// [`ToolRegistry`](crate::hive::tool_protocol::ToolRegistry) at parse time.
pub struct OutputParser {
    tool_names: HashSet<String>,
}

impl OutputParser {
    pub fn new(tool_names: HashSet<String>) -> Self {
        Self { tool_names }
    }

    /// Extract every top-level tag found in `text`, in document order.
    ///
    /// Callers implementing the tie-break rule in §4.5 should process
    /// [`ParsedItem::Workflow`] entries before [`ParsedItem::ToolCall`]
    /// entries regardless of their order in this list, while still
    /// executing every tool call present.
    pub fn parse(&self, text: &str) -> Vec<ParsedItem> {
        let chars: Vec<char> = text.chars().collect();
        let mut items = Vec::new();
        let mut i = 0;

        while i < chars.len() {
            if chars[i] != '<' || matches!(chars.get(i + 1), Some('/')) {
                i += 1;
                continue;
            }

            match self.scan_tag(&chars, i) {
                Some((item, next_i)) => {
                    items.push(item);
                    i = next_i;
                }
                None => i += 1,
            }
        }

        items
    }

    /// Attempt to read one tag starting at `start` (which points at `<`).
    /// Returns the parsed item and the index to resume scanning from, or
    /// `None` if `start` does not begin a syntactically plausible tag name
    /// (in which case the caller should just advance past the `<`).
    fn scan_tag(&self, chars: &[char], start: usize) -> Option<(ParsedItem, usize)> {
        let name_start = start + 1;
        let mut j = name_start;
        while j < chars.len() && (chars[j].is_ascii_alphanumeric() || chars[j] == '_') {
            j += 1;
        }
        if j == name_start {
            return None;
        }
        let tag_name: String = chars[name_start..j].iter().collect();

        // Scan to the end of the opening tag, collecting its attribute text
        // and noting whether it is self-closing.
        let mut k = j;
        let mut depth_in_quotes = false;
        let mut self_closing = false;
        let attrs_start = j;
        while k < chars.len() {
            match chars[k] {
                '"' => depth_in_quotes = !depth_in_quotes,
                '>' if !depth_in_quotes => break,
                '/' if !depth_in_quotes && chars.get(k + 1) == Some(&'>') => {
                    self_closing = true;
                }
                _ => {}
            }
            k += 1;
        }
        if k >= chars.len() {
            let span: String = chars[start..].iter().collect();
            return Some((
                self.malformed(span, "unterminated opening tag before end of stream"),
                chars.len(),
            ));
        }
        let attrs_end = if self_closing { k - 1 } else { k };
        let attr_str: String = chars[attrs_start..attrs_end].iter().collect();
        let attrs = parse_attributes(&attr_str);
        let open_tag_end = k + 1; // past '>'

        if self_closing {
            let item = self.classify(&tag_name, &attrs, "", open_tag_end, chars);
            return Some((item, open_tag_end));
        }

        let closing = format!("</{}>", tag_name);
        let closing_chars: Vec<char> = closing.chars().collect();
        if let Some(close_start) = find_subsequence(chars, &closing_chars, open_tag_end) {
            let body: String = chars[open_tag_end..close_start].iter().collect();
            let tag_end = close_start + closing_chars.len();
            let item = self.classify(&tag_name, &attrs, &body, tag_end, chars);
            Some((item, tag_end))
        } else {
            let span: String = chars[start..].iter().collect();
            Some((
                self.malformed(span, format!("unterminated '<{}>' before end of stream", tag_name)),
                chars.len(),
            ))
        }
    }

    fn classify(
        &self,
        tag_name: &str,
        attrs: &HashMap<String, String>,
        body: &str,
        _tag_end: usize,
        _chars: &[char],
    ) -> ParsedItem {
        match tag_name {
            "plan" => ParsedItem::Workflow(WorkflowTrigger::Plan {
                body: body.trim().to_string(),
            }),
            "task_list" => {
                let tasks = find_self_closing_elements(body, "task")
                    .into_iter()
                    .filter_map(|attrs| {
                        let id = attrs.get("id")?.clone();
                        let role = attrs.get("role")?.clone();
                        Some(TaskSpecDraft { id, role })
                    })
                    .collect();
                ParsedItem::Workflow(WorkflowTrigger::TaskList { tasks })
            }
            "create_worker" => {
                let role = attrs.get("role").cloned().unwrap_or_default();
                let skills = attrs.get("skills").cloned();
                ParsedItem::Workflow(WorkflowTrigger::CreateWorker { role, skills })
            }
            "request_state" => {
                let to = attrs.get("to").cloned().unwrap_or_default();
                match parse_agent_state(&to) {
                    Some(state) => ParsedItem::StateChangeRequest { to: state },
                    None => self.malformed(
                        format!("<request_state to=\"{}\"/>", to),
                        format!("'{}' is not a recognized agent state", to),
                    ),
                }
            }
            "thought" => ParsedItem::Thought {
                content: body.trim().to_string(),
            },
            name if self.tool_names.contains(name) => {
                let children = find_flat_children(body);
                let mut params = serde_json::Map::new();
                for (key, value) in children {
                    params.insert(key, Value::String(value));
                }
                ParsedItem::ToolCall {
                    name: name.to_string(),
                    parameters: Value::Object(params),
                }
            }
            other => self.malformed(
                format!("<{}>", other),
                format!("'{}' is not a recognized workflow trigger or registered tool", other),
            ),
        }
    }

    fn malformed(&self, span: impl Into<String>, reason: impl Into<String>) -> ParsedItem {
        ParsedItem::Malformed {
            span: span.into(),
            reason: reason.into(),
        }
    }
}

/// Parse `key="value"` pairs out of raw attribute text.
fn parse_attributes(attr_str: &str) -> HashMap<String, String> {
    let mut attrs = HashMap::new();
    let chars: Vec<char> = attr_str.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        while i < chars.len() && chars[i].is_whitespace() {
            i += 1;
        }
        let key_start = i;
        while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '-') {
            i += 1;
        }
        if i == key_start {
            i += 1;
            continue;
        }
        let key: String = chars[key_start..i].iter().collect();
        while i < chars.len() && chars[i].is_whitespace() {
            i += 1;
        }
        if chars.get(i) != Some(&'=') {
            continue;
        }
        i += 1;
        while i < chars.len() && chars[i].is_whitespace() {
            i += 1;
        }
        if chars.get(i) != Some(&'"') {
            continue;
        }
        i += 1;
        let value_start = i;
        while i < chars.len() && chars[i] != '"' {
            i += 1;
        }
        let value: String = chars[value_start..i].iter().collect();
        i += 1;
        attrs.insert(key, value);
    }
    attrs
}

/// Find every self-closing `<tag_name .../>` element in `body` (used for
/// `<task .../>` children of `<task_list>`).
fn find_self_closing_elements(body: &str, tag_name: &str) -> Vec<HashMap<String, String>> {
    let chars: Vec<char> = body.chars().collect();
    let needle: Vec<char> = format!("<{}", tag_name).chars().collect();
    let mut results = Vec::new();
    let mut i = 0;
    while let Some(found) = find_subsequence(&chars, &needle, i) {
        let after_name = found + needle.len();
        if matches!(chars.get(after_name), Some(c) if c.is_ascii_alphanumeric() || *c == '_') {
            i = after_name;
            continue;
        }
        let mut k = after_name;
        let mut in_quotes = false;
        while k < chars.len() {
            match chars[k] {
                '"' => in_quotes = !in_quotes,
                '>' if !in_quotes => break,
                _ => {}
            }
            k += 1;
        }
        if k >= chars.len() {
            break;
        }
        let attr_str: String = chars[after_name..k].iter().collect();
        results.push(parse_attributes(attr_str.trim_end_matches('/')));
        i = k + 1;
    }
    results
}

/// Extract immediate, non-nested child elements (`<key>value</key>`) as a
/// flat list of (tag name, text content) pairs — the generic shape of a
/// tool call's `<action>`/`<paramN>` children.
fn find_flat_children(body: &str) -> Vec<(String, String)> {
    let chars: Vec<char> = body.chars().collect();
    let mut results = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '<' && chars.get(i + 1) != Some(&'/') {
            let name_start = i + 1;
            let mut j = name_start;
            while j < chars.len() && (chars[j].is_ascii_alphanumeric() || chars[j] == '_') {
                j += 1;
            }
            if j > name_start && chars.get(j) == Some(&'>') {
                let name: String = chars[name_start..j].iter().collect();
                let closing: Vec<char> = format!("</{}>", name).chars().collect();
                if let Some(close_start) = find_subsequence(&chars, &closing, j + 1) {
                    let value: String = chars[j + 1..close_start].iter().collect();
                    results.push((name, value.trim().to_string()));
                    i = close_start + closing.len();
                    continue;
                }
            }
        }
        i += 1;
    }
    results
}

fn find_subsequence(haystack: &[char], needle: &[char], from: usize) -> Option<usize> {
    if needle.is_empty() || from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser(tools: &[&str]) -> OutputParser {
        OutputParser::new(tools.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn extracts_plan_trigger() {
        let items = parser(&[]).parse("Sure thing.\n<plan>Build a dashboard.</plan>");
        assert_eq!(
            items,
            vec![ParsedItem::Workflow(WorkflowTrigger::Plan {
                body: "Build a dashboard.".to_string()
            })]
        );
    }

    #[test]
    fn extracts_task_list_with_children() {
        let text = r#"<task_list><task id="T1" role="ingester"/><task id="T2" role="classifier"/></task_list>"#;
        let items = parser(&[]).parse(text);
        assert_eq!(
            items,
            vec![ParsedItem::Workflow(WorkflowTrigger::TaskList {
                tasks: vec![
                    TaskSpecDraft { id: "T1".into(), role: "ingester".into() },
                    TaskSpecDraft { id: "T2".into(), role: "classifier".into() },
                ]
            })]
        );
    }

    #[test]
    fn extracts_create_worker_attributes() {
        let items = parser(&[]).parse(r#"<create_worker role="ingester" skills="http,json"/>"#);
        assert_eq!(
            items,
            vec![ParsedItem::Workflow(WorkflowTrigger::CreateWorker {
                role: "ingester".to_string(),
                skills: Some("http,json".to_string()),
            })]
        );
    }

    #[test]
    fn extracts_registered_tool_call() {
        let items = parser(&["calculator"]).parse(
            "<calculator><action>evaluate</action><expression>2 + 2</expression></calculator>",
        );
        match &items[0] {
            ParsedItem::ToolCall { name, parameters } => {
                assert_eq!(name, "calculator");
                assert_eq!(parameters["action"], "evaluate");
                assert_eq!(parameters["expression"], "2 + 2");
            }
            other => panic!("unexpected item: {:?}", other),
        }
    }

    #[test]
    fn extracts_state_change_request() {
        let items = parser(&[]).parse(r#"<request_state to="Planning"/>"#);
        assert_eq!(
            items,
            vec![ParsedItem::StateChangeRequest { to: AgentState::Planning }]
        );
    }

    #[test]
    fn unrecognized_state_name_is_malformed() {
        let items = parser(&[]).parse(r#"<request_state to="Nonexistent"/>"#);
        match &items[0] {
            ParsedItem::Malformed { reason, .. } => assert!(reason.contains("not a recognized agent state")),
            other => panic!("unexpected item: {:?}", other),
        }
    }

    #[test]
    fn extracts_thought() {
        let items = parser(&[]).parse("<thought>maybe I should ask first</thought>");
        assert_eq!(
            items,
            vec![ParsedItem::Thought { content: "maybe I should ask first".to_string() }]
        );
    }

    #[test]
    fn unknown_tag_is_malformed() {
        let items = parser(&["calculator"]).parse("<mystery_tag>hi</mystery_tag>");
        match &items[0] {
            ParsedItem::Malformed { reason, .. } => assert!(reason.contains("not a recognized")),
            other => panic!("unexpected item: {:?}", other),
        }
    }

    #[test]
    fn unterminated_tag_is_malformed() {
        let items = parser(&[]).parse("<plan>no closing tag here");
        match &items[0] {
            ParsedItem::Malformed { reason, .. } => assert!(reason.contains("unterminated")),
            other => panic!("unexpected item: {:?}", other),
        }
    }

    #[test]
    fn plain_text_with_no_tags_yields_nothing() {
        assert!(parser(&[]).parse("just a normal response with no markup").is_empty());
    }
}
