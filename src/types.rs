//! Shared data types for coordination state: agent identity, answers, votes,
//! per-agent runtime state, and the structured broadcast question/response wire shapes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque per-session agent identity. Cheap to clone, shared across tasks.
pub type AgentId = Arc<str>;

/// A single recorded answer from one agent.
#[derive(Debug, Clone)]
pub struct AgentAnswer {
    pub agent_id: AgentId,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub round_number: u32,
    /// `"{anon}.{N}"`, e.g. `agent2.3`.
    pub label: String,
    /// Optional decision-journal text read from the agent's workspace, if any.
    pub changedoc: Option<String>,
}

/// A single recorded vote from one agent for another agent's answer.
///
/// `suggestions` is deliberately tri-state: `None` (field omitted by the caller),
/// `Some(empty map)` (explicitly provided but empty), and `Some(populated map)`.
/// These are three distinct observable states and must not be collapsed.
#[derive(Debug, Clone)]
pub struct AgentVote {
    pub voter_id: AgentId,
    pub voter_anon_id: String,
    pub voted_for: AgentId,
    pub voted_for_label: String,
    pub reason: String,
    pub suggestions: Option<HashMap<String, String>>,
    pub timestamp: DateTime<Utc>,
}

/// Per-agent, per-session live coordination state.
///
/// Owned by the orchestrator; hooks observe and mutate it through a per-agent mutex.
#[derive(Debug, Clone)]
pub struct AgentState {
    pub round: u32,
    pub restart_pending: bool,
    pub injection_count: u32,
    pub known_answer_ids: std::collections::HashSet<AgentId>,
    pub answer: Option<String>,
    pub has_voted: bool,
    pub round_start_time: Instant,
    pub round_timeout_state: Option<RoundTimeoutState>,
    /// Set once an agent's turn has exhausted its backend/enforcement retry budget with no
    /// answer or vote recorded. A failed agent is permanently excluded from re-dispatch and
    /// from the consensus gate so it cannot stall the session forever.
    pub failed: bool,
}

impl AgentState {
    pub fn new() -> Self {
        AgentState {
            round: 0,
            restart_pending: false,
            injection_count: 0,
            known_answer_ids: std::collections::HashSet::new(),
            answer: None,
            has_voted: false,
            round_start_time: Instant::now(),
            round_timeout_state: None,
            failed: false,
        }
    }
}

impl Default for AgentState {
    fn default() -> Self {
        Self::new()
    }
}

/// Mutable bookkeeping for the round-timeout hook; persists across tool calls within a round.
#[derive(Debug, Clone, Default)]
pub struct RoundTimeoutState {
    pub soft_timeout_fired_at: Option<Instant>,
    pub consecutive_hard_denials: u32,
}

/// A structured multiple-choice question option, part of the `ask_others` wire schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionOption {
    pub id: String,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A structured question sent via `ask_others`, preferred over a free-text question.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredQuestion {
    pub text: String,
    #[serde(default)]
    pub options: Vec<QuestionOption>,
    #[serde(default, rename = "multiSelect", skip_serializing_if = "Option::is_none")]
    pub multi_select: Option<bool>,
    #[serde(default, rename = "allowOther", skip_serializing_if = "Option::is_none")]
    pub allow_other: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
}

/// A structured response to a [`StructuredQuestion`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredResponse {
    pub question_id_or_index: String,
    #[serde(default)]
    pub selected_option_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub other_text: Option<String>,
}

/// Either a single free-text question or a set of structured questions.
///
/// `ask_others` accepts both `question` and `questions`; when both are present the
/// structured form wins (see DESIGN.md Open Question 4).
#[derive(Debug, Clone)]
pub enum BroadcastQuestion {
    Simple(String),
    Structured(Vec<StructuredQuestion>),
}

impl BroadcastQuestion {
    /// Render the question(s) as flat text for a shadow agent's simplified prompt.
    pub fn as_prompt_text(&self) -> String {
        match self {
            BroadcastQuestion::Simple(text) => text.clone(),
            BroadcastQuestion::Structured(questions) => questions
                .iter()
                .map(|q| q.text.clone())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}
