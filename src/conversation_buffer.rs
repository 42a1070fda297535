//! Per-agent conversation buffer: the single source of truth for one agent's turn history.
//!
//! Transcribed from `conversation_buffer.py` (the original implementation this crate's
//! specification was distilled from): accumulator flush ordering, the exact injection
//! message template, and the `to_messages`/`to_simple_messages` role-mapping rules all
//! follow that file's behavior rather than a generic design.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// The kind of a committed conversation entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    System,
    User,
    Assistant,
    ToolCall,
    ToolResult,
    Injection,
    Reasoning,
}

/// Metadata attached to every committed entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub attempt: u32,
    pub round: u32,
    pub agent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_agents: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer_count: Option<usize>,
}

/// One committed entry in an agent's conversation buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub timestamp: DateTime<Utc>,
    pub kind: EntryKind,
    pub content: String,
    pub metadata: EntryMetadata,
}

#[derive(Debug, Clone)]
struct PendingToolCall {
    name: String,
    arguments: serde_json::Value,
    call_id: Option<String>,
    result: Option<String>,
    timestamp: DateTime<Utc>,
}

/// Per-agent ordered log of conversation entries plus streaming accumulators.
#[derive(Debug, Clone)]
pub struct ConversationBuffer {
    pub agent_id: String,
    pub entries: Vec<ConversationEntry>,
    pub current_attempt: u32,
    pub current_round: u32,
    pending_content: String,
    pending_reasoning: String,
    pending_tool_calls: Vec<PendingToolCall>,
    injection_timestamps: Vec<DateTime<Utc>>,
}

impl ConversationBuffer {
    pub fn new(agent_id: impl Into<String>) -> Self {
        ConversationBuffer {
            agent_id: agent_id.into(),
            entries: Vec::new(),
            current_attempt: 0,
            current_round: 0,
            pending_content: String::new(),
            pending_reasoning: String::new(),
            pending_tool_calls: Vec::new(),
            injection_timestamps: Vec::new(),
        }
    }

    fn base_metadata(&self) -> EntryMetadata {
        EntryMetadata {
            attempt: self.current_attempt,
            round: self.current_round,
            agent_id: self.agent_id.clone(),
            tool_name: None,
            call_id: None,
            source_agents: None,
            answer_count: None,
        }
    }

    fn push(&mut self, kind: EntryKind, content: impl Into<String>, metadata: EntryMetadata) {
        self.entries.push(ConversationEntry {
            timestamp: Utc::now(),
            kind,
            content: content.into(),
            metadata,
        });
    }

    pub fn add_system(&mut self, content: impl Into<String>) {
        let md = self.base_metadata();
        self.push(EntryKind::System, content, md);
    }

    pub fn add_user(&mut self, content: impl Into<String>) {
        let md = self.base_metadata();
        self.push(EntryKind::User, content, md);
    }

    pub fn add_content(&mut self, text: &str) {
        self.pending_content.push_str(text);
    }

    pub fn add_reasoning(&mut self, text: &str) {
        self.pending_reasoning.push_str(text);
    }

    pub fn add_tool_call(
        &mut self,
        name: impl Into<String>,
        arguments: serde_json::Value,
        call_id: Option<String>,
    ) {
        self.pending_tool_calls.push(PendingToolCall {
            name: name.into(),
            arguments,
            call_id,
            result: None,
            timestamp: Utc::now(),
        });
    }

    /// Matches the most recent pending call with the same name whose result is unset,
    /// preferring an exact `call_id` match when one is given. Never overwrites a resolved
    /// call. Appends a standalone result-only entry if no match exists.
    pub fn add_tool_result(&mut self, name: &str, call_id: Option<&str>, result: impl Into<String>) {
        let result = result.into();
        for call in self.pending_tool_calls.iter_mut().rev() {
            if call.name == name && call.result.is_none() {
                let matches = match call_id {
                    Some(id) => call.call_id.as_deref() == Some(id),
                    None => true,
                };
                if matches {
                    call.result = Some(result);
                    return;
                }
            }
        }
        let md = self.base_metadata();
        self.push(EntryKind::ToolResult, result, md);
    }

    pub fn has_pending_content(&self) -> bool {
        !self.pending_content.trim().is_empty()
            || !self.pending_reasoning.trim().is_empty()
            || !self.pending_tool_calls.is_empty()
    }

    /// Promotes accumulators to permanent entries: reasoning, then each pending tool call
    /// (paired immediately with its result if resolved), then assistant content. Clears all
    /// accumulators afterward.
    pub fn flush_turn(&mut self) {
        if !self.pending_reasoning.trim().is_empty() {
            let md = self.base_metadata();
            let text = std::mem::take(&mut self.pending_reasoning);
            self.push(EntryKind::Reasoning, text, md);
        }

        for call in self.pending_tool_calls.drain(..) {
            let mut md = self.base_metadata();
            md.tool_name = Some(call.name.clone());
            md.call_id = call.call_id.clone();
            let args_text = serde_json::to_string(&call.arguments).unwrap_or_default();
            self.entries.push(ConversationEntry {
                timestamp: call.timestamp,
                kind: EntryKind::ToolCall,
                content: args_text,
                metadata: md.clone(),
            });
            if let Some(result) = call.result {
                self.entries.push(ConversationEntry {
                    timestamp: call.timestamp + Duration::milliseconds(1),
                    kind: EntryKind::ToolResult,
                    content: result,
                    metadata: md,
                });
            }
        }

        if !self.pending_content.trim().is_empty() {
            let md = self.base_metadata();
            let text = std::mem::take(&mut self.pending_content);
            self.push(EntryKind::Assistant, text, md);
        }

        self.pending_content.clear();
        self.pending_reasoning.clear();
        self.pending_tool_calls.clear();
    }

    /// Appends an `injection` entry built from the exact "UPDATE: new answers" template.
    /// No-op if `new_answers` is empty. `anon_mapping` resolves each real agent id to the
    /// session-wide anon alias it was actually assigned (falling back to the real id for any
    /// agent missing from the map), so tags always match what the recipient has seen
    /// elsewhere in its prompts.
    pub fn inject_update(&mut self, new_answers: &HashMap<String, String>, anon_mapping: &HashMap<String, String>) {
        if new_answers.is_empty() {
            return;
        }

        let content = format_injection_message(new_answers, anon_mapping);
        let mut md = self.base_metadata();
        md.source_agents = Some(new_answers.keys().cloned().collect());
        md.answer_count = Some(new_answers.len());
        self.push(EntryKind::Injection, content, md);
        self.injection_timestamps.push(Utc::now());
    }

    /// Canonical role/content rendering, including distinct tool/tool-result roles.
    pub fn to_messages(&self, include_reasoning: bool, include_tool_details: bool) -> Vec<RenderedMessage> {
        let mut out = Vec::new();
        for entry in &self.entries {
            match entry.kind {
                EntryKind::System => out.push(RenderedMessage::plain("system", &entry.content)),
                EntryKind::User | EntryKind::Injection => {
                    out.push(RenderedMessage::plain("user", &entry.content))
                }
                EntryKind::Assistant => out.push(RenderedMessage::plain("assistant", &entry.content)),
                EntryKind::Reasoning => {
                    if include_reasoning {
                        out.push(RenderedMessage::plain(
                            "assistant",
                            &format!("[Reasoning]\n{}", entry.content),
                        ));
                    }
                }
                EntryKind::ToolCall => {
                    if include_tool_details {
                        let name = entry.metadata.tool_name.clone().unwrap_or_default();
                        let mut msg = RenderedMessage::plain(
                            "assistant",
                            &format!("[Tool Call: {name}]\n{}", entry.content),
                        );
                        msg.call_id = entry.metadata.call_id.clone();
                        msg.tool_name = Some(name);
                        out.push(msg);
                    }
                }
                EntryKind::ToolResult => {
                    if include_tool_details {
                        let mut msg = RenderedMessage::plain("tool", &entry.content);
                        msg.call_id = entry.metadata.call_id.clone();
                        out.push(msg);
                    }
                }
            }
        }
        out
    }

    /// Collapses tool calls/results to assistant/user pseudo-messages for backends without a
    /// dedicated tool-message role. Tool results become **user**-role messages here, a
    /// deliberate asymmetry with [`Self::to_messages`].
    pub fn to_simple_messages(&self) -> Vec<RenderedMessage> {
        let mut out = Vec::new();
        for entry in &self.entries {
            match entry.kind {
                EntryKind::System => out.push(RenderedMessage::plain("system", &entry.content)),
                EntryKind::User | EntryKind::Injection => {
                    out.push(RenderedMessage::plain("user", &entry.content))
                }
                EntryKind::Assistant | EntryKind::Reasoning => {
                    out.push(RenderedMessage::plain("assistant", &entry.content))
                }
                EntryKind::ToolCall => {
                    let name = entry.metadata.tool_name.clone().unwrap_or_default();
                    out.push(RenderedMessage::plain(
                        "assistant",
                        &format!("[Using tool: {name}]\nArguments: {}", entry.content),
                    ));
                }
                EntryKind::ToolResult => {
                    let name = entry.metadata.tool_name.clone().unwrap_or_default();
                    out.push(RenderedMessage::plain(
                        "user",
                        &format!("[Result from {name}]: {}", entry.content),
                    ));
                }
            }
        }
        out
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.pending_content.clear();
        self.pending_reasoning.clear();
        self.pending_tool_calls.clear();
        self.injection_timestamps.clear();
        self.current_attempt = 0;
        self.current_round = 0;
    }

    pub fn to_dict(&self) -> BufferSnapshot {
        BufferSnapshot {
            agent_id: self.agent_id.clone(),
            current_attempt: self.current_attempt,
            current_round: self.current_round,
            entries: self.entries.clone(),
        }
    }

    /// Persists the buffer as JSON. Logs a warning (does not panic) if pending accumulators
    /// are non-empty, since they are never serialized.
    pub fn save(&self, path: &std::path::Path) -> std::io::Result<()> {
        if self.has_pending_content() {
            log::warn!(
                "saving conversation buffer for agent {} with unflushed pending content",
                self.agent_id
            );
        }
        let snapshot = self.to_dict();
        let json = serde_json::to_string_pretty(&snapshot)?;
        std::fs::write(path, json)
    }

    pub fn load(path: &std::path::Path) -> std::io::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let snapshot: BufferSnapshot = serde_json::from_str(&json)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        Ok(ConversationBuffer {
            agent_id: snapshot.agent_id,
            entries: snapshot.entries,
            current_attempt: snapshot.current_attempt,
            current_round: snapshot.current_round,
            pending_content: String::new(),
            pending_reasoning: String::new(),
            pending_tool_calls: Vec::new(),
            injection_timestamps: Vec::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Builds the "UPDATE: new answers" injection text, tagging each answer under its real
/// session-wide anon alias (`anon_mapping`: real id -> anon), sorted by tag so the rendering
/// is deterministic regardless of `HashMap` iteration order. Shared by
/// [`ConversationBuffer::inject_update`] and the `PeerAnswerInjection` hook so both paths stay
/// in sync with the one anonymization rule.
pub fn format_injection_message(
    new_answers: &HashMap<String, String>,
    anon_mapping: &HashMap<String, String>,
) -> String {
    let mut tagged: Vec<(String, &String)> = new_answers
        .iter()
        .map(|(agent_id, answer)| {
            let tag = anon_mapping.get(agent_id).cloned().unwrap_or_else(|| agent_id.clone());
            (tag, answer)
        })
        .collect();
    tagged.sort_by(|a, b| a.0.cmp(&b.0));

    let mut lines = Vec::new();
    lines.push("UPDATE: While you were working, new answers were provided.".to_string());
    lines.push(String::new());
    lines.push("<NEW_ANSWERS>".to_string());
    for (tag, answer) in &tagged {
        lines.push(format!("<{tag}>"));
        lines.push((*answer).clone());
        lines.push(format!("</{tag}>"));
        lines.push(String::new());
    }
    lines.push("</NEW_ANSWERS>".to_string());
    lines.push(String::new());
    lines.push("You can now:".to_string());
    lines.push("1. Continue your current approach if you think it's better or different".to_string());
    lines.push("2. Build upon or refine the new answers".to_string());
    lines.push("3. Vote for an existing answer if you agree with it".to_string());
    lines.push(String::new());
    lines.push("Proceed with your decision.".to_string());
    lines.join("\n")
}

/// JSON-serializable snapshot of a buffer's committed state (pending accumulators excluded).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferSnapshot {
    pub agent_id: String,
    pub current_attempt: u32,
    pub current_round: u32,
    pub entries: Vec<ConversationEntry>,
}

/// A rendered message ready to hand to an [`crate::backend::AgentBackend`].
#[derive(Debug, Clone)]
pub struct RenderedMessage {
    pub role: String,
    pub content: String,
    pub call_id: Option<String>,
    pub tool_name: Option<String>,
}

impl RenderedMessage {
    fn plain(role: &str, content: &str) -> Self {
        RenderedMessage {
            role: role.to_string(),
            content: content.to_string(),
            call_id: None,
            tool_name: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flush_turn_orders_reasoning_tool_calls_then_content() {
        let mut buf = ConversationBuffer::new("agent_a");
        buf.add_reasoning("thinking...");
        buf.add_tool_call("read_file", serde_json::json!({"path": "a.txt"}), Some("c1".into()));
        buf.add_tool_result("read_file", Some("c1"), "contents");
        buf.add_content("final answer");
        buf.flush_turn();

        let kinds: Vec<EntryKind> = buf.entries.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                EntryKind::Reasoning,
                EntryKind::ToolCall,
                EntryKind::ToolResult,
                EntryKind::Assistant,
            ]
        );
        assert!(!buf.has_pending_content());
    }

    #[test]
    fn tool_result_never_overwrites_resolved_call() {
        let mut buf = ConversationBuffer::new("agent_a");
        buf.add_tool_call("search", serde_json::json!({}), Some("c1".into()));
        buf.add_tool_result("search", Some("c1"), "first result");
        buf.add_tool_call("search", serde_json::json!({}), Some("c2".into()));
        buf.add_tool_result("search", Some("c2"), "second result");
        buf.flush_turn();

        let results: Vec<&str> = buf
            .entries
            .iter()
            .filter(|e| e.kind == EntryKind::ToolResult)
            .map(|e| e.content.as_str())
            .collect();
        assert_eq!(results, vec!["first result", "second result"]);
    }

    #[test]
    fn inject_update_builds_exact_template() {
        let mut buf = ConversationBuffer::new("agent_b");
        let mut answers = HashMap::new();
        answers.insert("agent_a".to_string(), "answer from A".to_string());
        let mut anon = HashMap::new();
        anon.insert("agent_a".to_string(), "agent1".to_string());
        buf.inject_update(&answers, &anon);

        let injected = &buf.entries[0];
        assert_eq!(injected.kind, EntryKind::Injection);
        assert!(injected.content.starts_with("UPDATE: While you were working"));
        assert!(injected.content.contains("<agent1>"));
        assert!(injected.content.contains("answer from A"));
        assert!(injected.content.contains("</agent1>"));
        assert!(injected.content.contains("Proceed with your decision."));
        assert!(!injected.content.contains("agent_a"));
    }

    #[test]
    fn inject_update_noop_when_empty() {
        let mut buf = ConversationBuffer::new("agent_b");
        buf.inject_update(&HashMap::new(), &HashMap::new());
        assert!(buf.entries.is_empty());
    }

    #[test]
    fn inject_update_uses_session_wide_anon_tag_not_local_index() {
        // agent_b is the recipient (excluded from `new_answers`); agent_c's real session-wide
        // alias is agent3, not agent2 - the tag must reflect that, not a locally recomputed index.
        let mut buf = ConversationBuffer::new("agent_b");
        let mut answers = HashMap::new();
        answers.insert("agent_c".to_string(), "answer from C".to_string());
        let mut anon = HashMap::new();
        anon.insert("agent_a".to_string(), "agent1".to_string());
        anon.insert("agent_b".to_string(), "agent2".to_string());
        anon.insert("agent_c".to_string(), "agent3".to_string());
        buf.inject_update(&answers, &anon);

        let injected = &buf.entries[0];
        assert!(injected.content.contains("<agent3>"));
        assert!(!injected.content.contains("<agent2>"));
    }

    #[test]
    fn to_simple_messages_renders_tool_result_as_user_role() {
        let mut buf = ConversationBuffer::new("agent_a");
        buf.add_tool_call("calc", serde_json::json!({"x": 1}), None);
        buf.add_tool_result("calc", None, "2");
        buf.flush_turn();

        let simple = buf.to_simple_messages();
        let tool_result_msg = simple.iter().find(|m| m.content.starts_with("[Result from")).unwrap();
        assert_eq!(tool_result_msg.role, "user");
    }

    #[test]
    fn json_round_trip_preserves_entries() {
        let mut buf = ConversationBuffer::new("agent_a");
        buf.add_system("you are an agent");
        buf.add_content("hello");
        buf.flush_turn();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buffer.json");
        buf.save(&path).unwrap();
        let loaded = ConversationBuffer::load(&path).unwrap();

        assert_eq!(loaded.entries.len(), buf.entries.len());
        assert_eq!(loaded.entries[0].content, buf.entries[0].content);
        assert_eq!(loaded.current_round, buf.current_round);
    }

    #[test]
    fn clear_resets_round_and_attempt_counters() {
        let mut buf = ConversationBuffer::new("agent_a");
        buf.current_round = 3;
        buf.current_attempt = 2;
        buf.add_content("x");
        buf.flush_turn();
        buf.clear();

        assert_eq!(buf.current_round, 0);
        assert_eq!(buf.current_attempt, 0);
        assert!(buf.entries.is_empty());
    }
}
