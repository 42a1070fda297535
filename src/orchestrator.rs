//! Round/attempt state machine that drives a set of agents through the answer/vote protocol
//! to a single winning answer.
//!
//! Grounded on the orchestrator integration test suite (`test_orchestrator_consensus.py`,
//! `test_orchestrator_voting.py`, `test_orchestrator_stream_enforcement.py`,
//! `test_orchestrator_restart_and_external_tools.py`): the exact corrective-message
//! substrings, the vote-only restart short circuit, the external-tool passthrough chunk, and
//! the registration-order tie-break are all transcribed from those scripted scenarios. The
//! concurrent per-agent task / shared mpsc multiplexing follows the donor crate's
//! `multi_participant_session.rs` fan-out idiom.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{FutureExt, StreamExt};
use lazy_static::lazy_static;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::backend::{AgentBackend, BackendContext, Chunk, ToolSpec};
use crate::broadcast::ShadowAnswerFn;
use crate::config::BroadcastMode;
use crate::conversation_buffer::ConversationBuffer;
use crate::coordination_tracker::VotePayload;
use crate::error::MassGenError;
use crate::hooks::{
    AsyncSubagentResultHook, Hook, HookContext, HookManager, HookType, InjectStrategy,
    PeerAnswerInjection, RoundTimeoutHook,
};
use crate::session::SessionContext;
use crate::system_message::{visible_answers_from, ProtocolMode, SystemMessageBuilder, SystemMessageInputs};
use crate::types::{AgentAnswer, AgentState, AgentVote, BroadcastQuestion};

lazy_static! {
    static ref WORKFLOW_TOOL_NAMES: HashSet<&'static str> = ["vote", "new_answer"].into_iter().collect();
}

/// A tool call the orchestrator doesn't execute itself; the caller runs it and resumes the
/// session externally (SPEC_FULL.md §4.1.1).
#[derive(Debug, Clone)]
pub struct ExternalToolCall {
    pub id: Option<String>,
    pub name: String,
    pub arguments_json: String,
}

#[derive(Debug, Clone)]
pub enum ResultPayload {
    Answer(String),
    Vote(AgentVote),
}

/// One unit of the orchestrator's output stream.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Content { agent_id: String, text: String },
    Result { agent_id: String, payload: ResultPayload },
    ExternalToolCalls { agent_id: String, calls: Vec<ExternalToolCall> },
    Error { agent_id: String, message: String },
    Done,
}

/// Terminal outcome of a coordination run.
#[derive(Debug, Clone)]
pub struct FinalResult {
    pub winner_id: String,
    pub final_answer: String,
}

enum Decision {
    Answer(String),
    Vote(VotePayload),
}

pub struct Orchestrator {
    session: Arc<SessionContext>,
    backends: HashMap<String, Arc<dyn AgentBackend>>,
    buffers: HashMap<String, AsyncMutex<ConversationBuffer>>,
    agent_states: HashMap<String, AsyncMutex<AgentState>>,
    hook_managers: HashMap<String, HookManager>,
}

impl Orchestrator {
    pub fn new(session: Arc<SessionContext>, backends: HashMap<String, Arc<dyn AgentBackend>>) -> Arc<Self> {
        let mut buffers = HashMap::new();
        let mut agent_states = HashMap::new();
        let mut hook_managers = HashMap::new();

        for id in &session.agent_ids {
            buffers.insert(id.clone(), AsyncMutex::new(ConversationBuffer::new(id.clone())));
            agent_states.insert(id.clone(), AsyncMutex::new(AgentState::new()));

            let mut manager = HookManager::new();
            if !session.config.coordination_config.disable_injection {
                manager.register(Box::new(PeerAnswerInjection) as Box<dyn Hook>);
            }
            manager.register(Box::new(RoundTimeoutHook {
                initial_round_timeout: Duration::from_secs(session.config.timeout_config.initial_round_timeout_seconds),
                subsequent_round_timeout: Duration::from_secs(
                    session.config.timeout_config.subsequent_round_timeout_seconds,
                ),
                grace_period: Duration::from_secs(session.config.timeout_config.round_timeout_grace_seconds),
                use_two_tier_workspace: session.config.coordination_config.use_two_tier_workspace,
            }) as Box<dyn Hook>);
            if session.config.async_subagents_enabled {
                if let Some(registry) = backends.get(id).and_then(|b| b.subagent_registry()) {
                    manager.register(
                        Box::new(AsyncSubagentResultHook { registry, strategy: InjectStrategy::Append })
                            as Box<dyn Hook>,
                    );
                }
            }
            hook_managers.insert(id.clone(), manager);
        }

        Arc::new(Orchestrator { session, backends, buffers, agent_states, hook_managers })
    }

    /// Drives the full protocol for `task`, streaming chunks to `tx` and resolving once a
    /// winner has presented its final answer.
    pub async fn run(
        self: &Arc<Self>,
        task: &str,
        tx: mpsc::UnboundedSender<StreamEvent>,
    ) -> Result<FinalResult, MassGenError> {
        let started_at = std::time::Instant::now();
        loop {
            let pending = self.pending_agents().await;
            if pending.is_empty() {
                break;
            }

            if let Some(limit_secs) = self.session.config.session_timeout_seconds {
                if started_at.elapsed() >= Duration::from_secs(limit_secs) {
                    log::warn!(
                        "session timeout ({limit_secs}s) reached with {} agent(s) still pending; forcing votes",
                        pending.len()
                    );
                    self.force_votes_on_timeout(&pending).await;
                    break;
                }
            }

            log::info!("coordination round starting for {} agent(s)", pending.len());
            let mut handles = Vec::with_capacity(pending.len());
            for agent_id in pending {
                let this = Arc::clone(self);
                let task = task.to_string();
                let tx = tx.clone();
                handles.push(tokio::spawn(async move { this.run_agent_turn(agent_id, task, tx).await }));
            }
            for handle in handles {
                let _ = handle.await;
            }

            if self.consensus_reached().await {
                break;
            }
        }

        let winner_id = self.determine_winner().await?;
        log::info!("winner determined: {winner_id}");
        self.session.tracker.start_final_round(&winner_id);
        let final_answer = self.run_presentation_turn(&winner_id, task, tx.clone()).await?;
        let _ = tx.send(StreamEvent::Done);
        Ok(FinalResult { winner_id, final_answer })
    }

    async fn pending_agents(&self) -> Vec<String> {
        let mut out = Vec::new();
        for id in &self.session.agent_ids {
            let state = self.agent_states[id].lock().await;
            if state.failed {
                continue;
            }
            let has_answer = !self.session.tracker.answers_by_agent(id).is_empty();
            let needs_action = if self.session.config.coordination_config.skip_voting {
                !has_answer
            } else {
                !has_answer && !state.has_voted
            };
            if needs_action || state.restart_pending {
                out.push(id.clone());
            }
        }
        out
    }

    /// An agent that exhausted its enforcement retries without producing an answer or vote is
    /// excluded from the consensus gate (SPEC_FULL.md §4.1.5): it can never "complete" its
    /// turn, so waiting on it would hang the session forever.
    async fn consensus_reached(&self) -> bool {
        if self.session.config.coordination_config.skip_voting {
            return self.all_answered().await;
        }
        for id in &self.session.agent_ids {
            let state = self.agent_states[id].lock().await;
            if state.failed {
                continue;
            }
            if !state.has_voted || state.restart_pending {
                return false;
            }
        }
        true
    }

    /// Total session timeout (SPEC_FULL.md §4.1.5): force every still-pending agent to vote
    /// for a last-seen answer so the protocol can still proceed to a final round.
    async fn force_votes_on_timeout(&self, pending: &[String]) {
        for agent_id in pending {
            let already_voted = self.agent_states[agent_id].lock().await.has_voted;
            if already_voted {
                continue;
            }

            let candidate = if !self.session.tracker.answers_by_agent(agent_id).is_empty() {
                Some(agent_id.clone())
            } else {
                self.session
                    .agent_ids
                    .iter()
                    .find(|id| !self.session.tracker.answers_by_agent(id).is_empty())
                    .cloned()
            };
            let Some(candidate) = candidate else {
                continue;
            };

            let payload = VotePayload {
                agent_id: candidate,
                reason: "forced vote: session timeout reached".to_string(),
                suggestions: None,
            };
            match self.session.tracker.add_agent_vote(agent_id, payload) {
                Ok(_) => {
                    let mut state = self.agent_states[agent_id].lock().await;
                    state.has_voted = true;
                    state.restart_pending = false;
                }
                Err(e) => log::warn!("forced vote for {agent_id} failed: {e}"),
            }
        }
    }

    async fn all_answered(&self) -> bool {
        for id in &self.session.agent_ids {
            let state = self.agent_states[id].lock().await;
            if state.failed {
                continue;
            }
            drop(state);
            if self.session.tracker.answers_by_agent(id).is_empty() {
                return false;
            }
        }
        true
    }

    fn is_vote_only(&self, state: &AgentState, agent_id: &str) -> bool {
        state.has_voted && self.session.tracker.answers_by_agent(agent_id).is_empty()
    }

    /// Runs a single agent through (up to) three answer/vote enforcement attempts, or
    /// short-circuits if this is a stale vote-only restart.
    async fn run_agent_turn(self: Arc<Self>, agent_id: String, task: String, tx: mpsc::UnboundedSender<StreamEvent>) {
        {
            let mut state = self.agent_states[&agent_id].lock().await;
            if state.restart_pending && self.is_vote_only(&state, &agent_id) {
                state.restart_pending = false;
                return;
            }
            state.round_start_time = std::time::Instant::now();
        }

        let backend = match self.backends.get(&agent_id) {
            Some(b) => Arc::clone(b),
            None => {
                let _ = tx.send(StreamEvent::Error {
                    agent_id: agent_id.clone(),
                    message: format!("no backend registered for agent {agent_id}"),
                });
                return;
            }
        };

        for attempt in 0..3u32 {
            self.ensure_round_started(&agent_id, &task).await;
            if attempt > 0 {
                // corrective messages were appended by the previous attempt's validation step
            }

            let messages = {
                let buffer = self.buffers[&agent_id].lock().await;
                buffer.to_messages(false, true)
            };
            let tools = self.coordination_tool_specs();
            let context = BackendContext {
                agent_id: agent_id.clone(),
                round: self.session.tracker.get_agent_round(&agent_id),
                is_presentation_turn: false,
            };

            let mut stream = match backend.stream(&messages, &tools, &context).await {
                Ok(s) => s,
                Err(e) => {
                    let _ = tx.send(StreamEvent::Error { agent_id: agent_id.clone(), message: e.to_string() });
                    return;
                }
            };

            let mut workflow_calls: Vec<(String, Value, Option<String>)> = Vec::new();
            let mut external_calls: Vec<ExternalToolCall> = Vec::new();
            let mut saw_external = false;
            let mut saw_error = false;

            while let Some(chunk) = stream.next().await {
                match chunk {
                    Chunk::Content { text } => {
                        let mut buffer = self.buffers[&agent_id].lock().await;
                        buffer.add_content(&text);
                        drop(buffer);
                        let _ = tx.send(StreamEvent::Content { agent_id: agent_id.clone(), text });
                    }
                    Chunk::Reasoning { text } => {
                        self.buffers[&agent_id].lock().await.add_reasoning(&text);
                    }
                    Chunk::ToolCall { id, name, arguments_json } => {
                        let value: Value = serde_json::from_str(&arguments_json).unwrap_or(Value::Null);

                        let pre_allowed = self.run_hooks(HookType::PreToolUse, &agent_id, &name, &arguments_json).await;
                        {
                            let mut buffer = self.buffers[&agent_id].lock().await;
                            buffer.add_tool_call(name.clone(), value.clone(), id.clone());
                        }

                        if let Some(reason) = pre_allowed.deny_reason {
                            self.buffers[&agent_id].lock().await.add_tool_result(&name, id.as_deref(), reason);
                            continue;
                        }

                        if self.session.external_tools.contains(&name) {
                            external_calls.push(ExternalToolCall { id, name, arguments_json });
                            saw_external = true;
                            break;
                        }

                        if WORKFLOW_TOOL_NAMES.contains(name.as_str()) {
                            workflow_calls.push((name.clone(), value, id));
                        } else if name == "ask_others" {
                            let result_text = self.handle_ask_others(&agent_id, &value).await;
                            self.buffers[&agent_id].lock().await.add_tool_result(&name, id.as_deref(), result_text);
                        } else if name == "respond_to_broadcast" {
                            self.buffers[&agent_id].lock().await.add_tool_result(
                                &name,
                                id.as_deref(),
                                "respond_to_broadcast is deprecated and has no effect.".to_string(),
                            );
                        }

                        if let Some(inject) = self.run_post_hooks(&agent_id, &name, &arguments_json).await {
                            self.buffers[&agent_id].lock().await.add_user(inject);
                        }
                    }
                    Chunk::ToolResult { id, content } => {
                        let mut buffer = self.buffers[&agent_id].lock().await;
                        buffer.add_tool_result("", id.as_deref(), content);
                    }
                    Chunk::CompleteMessage { content, .. } => {
                        self.buffers[&agent_id].lock().await.add_content(&content);
                    }
                    Chunk::Error { message } => {
                        let _ = tx.send(StreamEvent::Error { agent_id: agent_id.clone(), message });
                        saw_error = true;
                        break;
                    }
                    Chunk::Done => break,
                }
            }

            if saw_error {
                self.buffers[&agent_id].lock().await.flush_turn();
                return;
            }

            if saw_external {
                self.buffers[&agent_id].lock().await.flush_turn();
                let _ = tx.send(StreamEvent::ExternalToolCalls { agent_id: agent_id.clone(), calls: external_calls });
                return;
            }

            self.buffers[&agent_id].lock().await.flush_turn();

            match self.validate_workflow_calls(&workflow_calls) {
                Ok(Decision::Answer(content)) => {
                    let answer = self.session.tracker.add_agent_answer(&agent_id, &content, None);
                    if let Some(workspace) = backend.workspace() {
                        if let Err(e) = workspace.save_snapshot(chrono::Utc::now(), false).await {
                            log::warn!("failed to snapshot workspace for {agent_id}: {e}");
                        }
                    }
                    self.signal_restart(&agent_id).await;
                    let _ = tx.send(StreamEvent::Result {
                        agent_id: agent_id.clone(),
                        payload: ResultPayload::Answer(content),
                    });
                    let _ = answer;
                    return;
                }
                Ok(Decision::Vote(payload)) => match self.session.tracker.add_agent_vote(&agent_id, payload) {
                    Ok(vote) => {
                        self.agent_states[&agent_id].lock().await.has_voted = true;
                        let _ = tx.send(StreamEvent::Result {
                            agent_id: agent_id.clone(),
                            payload: ResultPayload::Vote(vote),
                        });
                        return;
                    }
                    Err(e) => {
                        log::warn!("protocol violation from {agent_id} on attempt {attempt}: {e}");
                        self.buffers[&agent_id].lock().await.add_user(e.to_string());
                        continue;
                    }
                },
                Err(message) => {
                    log::warn!("protocol violation from {agent_id} on attempt {attempt}: {message}");
                    self.buffers[&agent_id].lock().await.add_user(message);
                    continue;
                }
            }
        }

        self.agent_states[&agent_id].lock().await.failed = true;
        let _ = tx.send(StreamEvent::Error {
            agent_id: agent_id.clone(),
            message: format!("agent {agent_id} failed to use workflow tools after 3 attempts"),
        });
    }

    /// Builds and appends the system/user messages for a fresh turn; a no-op on retry attempts
    /// where the buffer already carries this round's history plus corrective messages.
    async fn ensure_round_started(&self, agent_id: &str, task: &str) {
        let needs_init = {
            let buffer = self.buffers[agent_id].lock().await;
            buffer.is_empty()
        };
        if !needs_init {
            return;
        }
        let system = self.coordination_system_message(agent_id).await;
        let mut buffer = self.buffers[agent_id].lock().await;
        buffer.add_system(system);
        buffer.add_user(task);
    }

    async fn coordination_system_message(&self, agent_id: &str) -> String {
        let real_to_anon = self.session.tracker.get_reverse_agent_mapping();

        let mut latest_by_agent: HashMap<String, AgentAnswer> = HashMap::new();
        let mut visible_ctx: HashMap<String, String> = HashMap::new();
        for id in &self.session.agent_ids {
            if id == agent_id {
                continue;
            }
            if let Some(answer) = self.session.tracker.answers_by_agent(id).last().cloned() {
                visible_ctx.insert(id.clone(), answer.label.clone());
                latest_by_agent.insert(id.clone(), answer);
            }
        }
        self.session.tracker.track_agent_context(agent_id, visible_ctx);

        let visible = visible_answers_from(&real_to_anon, &latest_by_agent, agent_id);
        let has_peer_answers = !visible.is_empty();

        let state = self.agent_states[agent_id].lock().await;
        let vote_only = self.is_vote_only(&state, agent_id);
        drop(state);

        let mode = if vote_only { ProtocolMode::VoteOnly } else { ProtocolMode::Coordination };

        let workspace_path = self
            .backends
            .get(agent_id)
            .and_then(|b| b.workspace())
            .map(|w| w.workspace_path().to_string());

        let inputs = SystemMessageInputs {
            persona: Some("You are one of several collaborating agents working on a shared task."),
            persona_easing_enabled: self.session.config.coordination_config.persona_easing_enabled,
            has_peer_answers,
            protocol_mode: Some(mode),
            planning_mode_instruction: None,
            visible_answers: &visible,
            voting_sensitivity: Some(self.session.config.coordination_config.voting_sensitivity),
            broadcast_sensitivity: Some(self.session.config.coordination_config.broadcast_sensitivity),
            workspace_path: workspace_path.as_deref(),
            ..Default::default()
        };
        SystemMessageBuilder::build(&inputs)
    }

    fn coordination_tool_specs(&self) -> Vec<ToolSpec> {
        let mut tools = vec![
            ToolSpec {
                name: "new_answer".to_string(),
                description: "Submit or revise your answer to the task.".to_string(),
                parameters_schema: serde_json::json!({
                    "type": "object",
                    "properties": {"content": {"type": "string"}},
                    "required": ["content"],
                }),
            },
            ToolSpec {
                name: "vote".to_string(),
                description: "Vote for the strongest existing answer by its anon id.".to_string(),
                parameters_schema: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "agent_id": {"type": "string"},
                        "reason": {"type": "string"},
                        "suggestions": {"type": "object"},
                    },
                    "required": ["agent_id", "reason"],
                }),
            },
        ];

        if self.session.config.coordination_config.broadcast != BroadcastMode::Off {
            tools.push(ToolSpec {
                name: "ask_others".to_string(),
                description: "Ask peer agents (or a human operator) a clarifying question.".to_string(),
                parameters_schema: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "question": {"type": "string"},
                        "questions": {"type": "array"},
                        "target_agents": {"type": "array", "items": {"type": "string"}},
                        "wait": {"type": "boolean"},
                    },
                }),
            });
            tools.push(ToolSpec {
                name: "respond_to_broadcast".to_string(),
                description: "Deprecated no-op kept for backward compatibility.".to_string(),
                parameters_schema: serde_json::json!({"type": "object", "properties": {"answer": {"type": "string"}}}),
            });
        }

        tools
    }

    fn new_answer_tool_spec(&self) -> ToolSpec {
        ToolSpec {
            name: "new_answer".to_string(),
            description: "Submit the final deliverable.".to_string(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "properties": {"content": {"type": "string"}},
                "required": ["content"],
            }),
        }
    }

    fn validate_workflow_calls(&self, calls: &[(String, Value, Option<String>)]) -> Result<Decision, String> {
        let has_vote = calls.iter().any(|(n, _, _)| n == "vote");
        let has_answer = calls.iter().any(|(n, _, _)| n == "new_answer");

        if has_vote && has_answer {
            return Err("Cannot use both 'vote' and 'new_answer' in the same turn.".to_string());
        }

        if has_answer {
            let (_, value, _) = calls.iter().find(|(n, _, _)| n == "new_answer").unwrap();
            let content = value.get("content").and_then(|v| v.as_str()).unwrap_or_default().to_string();
            return Ok(Decision::Answer(content));
        }

        if has_vote {
            let any_answers = self
                .session
                .agent_ids
                .iter()
                .any(|id| !self.session.tracker.answers_by_agent(id).is_empty());
            if !any_answers {
                return Err("Cannot vote when no answers exist yet.".to_string());
            }

            let (_, value, _) = calls.iter().find(|(n, _, _)| n == "vote").unwrap();
            let raw_target = value.get("agent_id").and_then(|v| v.as_str()).unwrap_or_default();
            let agent_id = self.resolve_vote_target(raw_target);
            let reason = value.get("reason").and_then(|v| v.as_str()).unwrap_or_default().to_string();
            let suggestions = value
                .get("suggestions")
                .and_then(|v| serde_json::from_value::<HashMap<String, String>>(v.clone()).ok());
            return Ok(Decision::Vote(VotePayload { agent_id, reason, suggestions }));
        }

        Err("Must call either 'vote' or 'new_answer' this turn.".to_string())
    }

    fn resolve_vote_target(&self, raw: &str) -> String {
        let anon_to_real = self.session.tracker.get_anonymous_agent_mapping();
        anon_to_real.get(raw).cloned().unwrap_or_else(|| raw.to_string())
    }

    async fn signal_restart(&self, source_agent_id: &str) {
        let peers: Vec<String> =
            self.session.agent_ids.iter().filter(|id| id.as_str() != source_agent_id).cloned().collect();
        for peer in &peers {
            self.agent_states[peer].lock().await.restart_pending = true;
        }
        self.session.tracker.track_restart_signal(source_agent_id, &peers);
    }

    async fn run_hooks(&self, hook_type: HookType, agent_id: &str, tool_name: &str, arguments_json: &str) -> HookDenialResult {
        let known = self.known_peer_answers(agent_id);
        let anon_mapping = self.session.tracker.get_reverse_agent_mapping();
        let manager = &self.hook_managers[agent_id];
        let mut state = self.agent_states[agent_id].lock().await;
        let mut ctx = HookContext {
            agent_id,
            agent_state: &mut state,
            known_peer_answers: &known,
            anon_mapping: &anon_mapping,
        };
        let result = manager.execute_hooks(hook_type, tool_name, arguments_json, &mut ctx, None).await;
        HookDenialResult { deny_reason: if result.allowed { None } else { result.reason } }
    }

    async fn run_post_hooks(&self, agent_id: &str, tool_name: &str, arguments_json: &str) -> Option<String> {
        let known = self.known_peer_answers(agent_id);
        let anon_mapping = self.session.tracker.get_reverse_agent_mapping();
        let manager = &self.hook_managers[agent_id];
        let mut state = self.agent_states[agent_id].lock().await;
        let mut ctx = HookContext {
            agent_id,
            agent_state: &mut state,
            known_peer_answers: &known,
            anon_mapping: &anon_mapping,
        };
        let result = manager.execute_hooks(HookType::PostToolUse, tool_name, arguments_json, &mut ctx, None).await;
        result.inject.map(|spec| spec.content)
    }

    /// Resolves an `ask_others` tool call into collected responses: shadow-echoes peers' most
    /// recent answers in `Agents` mode, or prompts a human operator in `Human` mode.
    async fn handle_ask_others(&self, agent_id: &str, value: &Value) -> String {
        let question = if let Some(arr) = value.get("questions").and_then(|v| v.as_array()) {
            let parsed = arr.iter().filter_map(|q| serde_json::from_value(q.clone()).ok()).collect();
            BroadcastQuestion::Structured(parsed)
        } else {
            let text = value.get("question").and_then(|v| v.as_str()).unwrap_or_default().to_string();
            BroadcastQuestion::Simple(text)
        };

        let target_agents = value
            .get("target_agents")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|x| x.as_str().map(String::from)).collect::<Vec<_>>());

        let is_human_mode = self.session.config.coordination_config.broadcast == BroadcastMode::Human;

        let request_id = match self
            .session
            .broadcast
            .create_broadcast(agent_id, question, &self.session.agent_ids, target_agents, is_human_mode)
            .await
        {
            Ok(id) => id,
            Err(e) => return e.to_string(),
        };

        if is_human_mode {
            self.session
                .broadcast
                .prompt_human(&request_id, |q| async move {
                    format!("[no human operator attached; question was: {q}]")
                })
                .await;
        } else {
            let known = self.known_peer_answers(agent_id);
            let answer_fn: ShadowAnswerFn = Arc::new(move |target: String, question_text: String| {
                let known = known.clone();
                async move {
                    match known.get(&target) {
                        Some(answer) => Ok(format!("(echo of {target}'s current answer) {answer}")),
                        None => Ok(format!("(no answer yet from {target} re: {question_text})")),
                    }
                }
                .boxed()
            });
            self.session.broadcast.inject_into_agents(&request_id, answer_fn).await;
        }

        let timeout = Duration::from_millis(self.session.config.coordination_config.broadcast_timeout_ms);
        let (_status, responses) = self.session.broadcast.wait_for_responses(&request_id, timeout).await;
        self.session.broadcast.cleanup_broadcast(&request_id).await;

        if responses.is_empty() {
            return "No responses were collected before the broadcast timed out.".to_string();
        }
        responses.iter().map(|r| format!("- {}: {}", r.responder_id, r.content)).collect::<Vec<_>>().join("\n")
    }

    fn known_peer_answers(&self, agent_id: &str) -> HashMap<String, String> {
        let mut map = HashMap::new();
        for id in &self.session.agent_ids {
            if id == agent_id {
                continue;
            }
            if let Some(answer) = self.session.tracker.answers_by_agent(id).last() {
                map.insert(id.clone(), answer.content.clone());
            }
        }
        map
    }

    async fn determine_winner(&self) -> Result<String, MassGenError> {
        let votes = self.session.tracker.votes();
        if votes.is_empty() {
            return self
                .session
                .agent_ids
                .iter()
                .find(|id| !self.session.tracker.answers_by_agent(id).is_empty())
                .cloned()
                .ok_or_else(|| MassGenError::ProtocolViolation("no agent produced an answer".to_string()));
        }

        let mut tally: HashMap<String, usize> = HashMap::new();
        for vote in &votes {
            *tally.entry(vote.voted_for.to_string()).or_insert(0) += 1;
        }
        let max_count = tally.values().copied().max().unwrap_or(0);

        self.session
            .agent_ids
            .iter()
            .find(|id| tally.get(id.as_str()).copied().unwrap_or(0) == max_count)
            .cloned()
            .ok_or_else(|| MassGenError::ProtocolViolation("no winner could be determined".to_string()))
    }

    async fn run_presentation_turn(
        &self,
        winner_id: &str,
        task: &str,
        tx: mpsc::UnboundedSender<StreamEvent>,
    ) -> Result<String, MassGenError> {
        let backend = self
            .backends
            .get(winner_id)
            .cloned()
            .ok_or_else(|| MassGenError::Configuration(format!("unknown agent {winner_id}")))?;

        {
            let mut buffer = self.buffers[winner_id].lock().await;
            let system = self.presentation_system_message();
            buffer.add_system(system);
            buffer.add_user(task);
        }

        let messages = self.buffers[winner_id].lock().await.to_messages(false, false);
        let tools = vec![self.new_answer_tool_spec()];
        let context = BackendContext {
            agent_id: winner_id.to_string(),
            round: self.session.tracker.get_agent_round(winner_id),
            is_presentation_turn: true,
        };

        let mut stream = backend
            .stream(&messages, &tools, &context)
            .await
            .map_err(|e| MassGenError::BackendStream(e.to_string()))?;

        let mut final_content = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Chunk::Content { text } => {
                    final_content.push_str(&text);
                    let _ = tx.send(StreamEvent::Content { agent_id: winner_id.to_string(), text });
                }
                Chunk::ToolCall { name, arguments_json, .. } if name == "new_answer" => {
                    if let Ok(value) = serde_json::from_str::<Value>(&arguments_json) {
                        if let Some(content) = value.get("content").and_then(|v| v.as_str()) {
                            final_content = content.to_string();
                        }
                    }
                }
                Chunk::Error { message } => return Err(MassGenError::BackendStream(message)),
                Chunk::Done => break,
                _ => {}
            }
        }

        if let Some(workspace) = backend.workspace() {
            if let Err(e) = workspace.save_snapshot(chrono::Utc::now(), true).await {
                log::warn!("failed to snapshot final workspace for {winner_id}: {e}");
            }
        }

        Ok(final_content)
    }

    fn presentation_system_message(&self) -> String {
        let inputs = SystemMessageInputs {
            protocol_mode: Some(ProtocolMode::Presentation),
            enable_command_execution: self.session.config.enable_command_execution,
            ..Default::default()
        };
        SystemMessageBuilder::build(&inputs)
    }
}

struct HookDenialResult {
    deny_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ChunkStream;
    use crate::config::MassGenConfig;
    use crate::conversation_buffer::RenderedMessage;
    use async_trait::async_trait;
    use futures_util::stream;
    use std::error::Error as StdError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    /// Plays back a fixed queue of chunk scripts, one per `stream()` call, in order.
    struct ScriptedBackend {
        scripts: StdMutex<Vec<Vec<Chunk>>>,
        calls: AtomicUsize,
    }

    impl ScriptedBackend {
        fn new(scripts: Vec<Vec<Chunk>>) -> Self {
            ScriptedBackend { scripts: StdMutex::new(scripts), calls: AtomicUsize::new(0) }
        }
    }

    #[async_trait]
    impl AgentBackend for ScriptedBackend {
        async fn stream(
            &self,
            _messages: &[RenderedMessage],
            _tools: &[ToolSpec],
            _context: &BackendContext,
        ) -> Result<ChunkStream, Box<dyn StdError + Send + Sync>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let chunks = {
                let mut scripts = self.scripts.lock().unwrap();
                if scripts.is_empty() { vec![Chunk::Done] } else { scripts.remove(0) }
            };
            Ok(Box::pin(stream::iter(chunks)))
        }
    }

    fn answer_script(content: &str) -> Vec<Chunk> {
        vec![
            Chunk::ToolCall {
                id: Some("1".to_string()),
                name: "new_answer".to_string(),
                arguments_json: serde_json::json!({"content": content}).to_string(),
            },
            Chunk::Done,
        ]
    }

    fn vote_script(target: &str) -> Vec<Chunk> {
        vec![
            Chunk::ToolCall {
                id: Some("1".to_string()),
                name: "vote".to_string(),
                arguments_json: serde_json::json!({"agent_id": target, "reason": "best fit"}).to_string(),
            },
            Chunk::Done,
        ]
    }

    fn presentation_script(content: &str) -> Vec<Chunk> {
        vec![Chunk::Content { text: content.to_string() }, Chunk::Done]
    }

    fn orchestrator(
        agent_ids: &[&str],
        config: MassGenConfig,
        backends: Vec<(&str, ScriptedBackend)>,
    ) -> Arc<Orchestrator> {
        let session = SessionContext::new(
            agent_ids.iter().map(|s| s.to_string()).collect(),
            config,
            HashSet::new(),
        );
        let backend_map: HashMap<String, Arc<dyn AgentBackend>> = backends
            .into_iter()
            .map(|(id, b)| (id.to_string(), Arc::new(b) as Arc<dyn AgentBackend>))
            .collect();
        Orchestrator::new(session, backend_map)
    }

    #[tokio::test]
    async fn unanimous_consensus_single_round() {
        let orch = orchestrator(
            &["agent_a", "agent_b", "agent_c"],
            MassGenConfig::default(),
            vec![
                ("agent_a", ScriptedBackend::new(vec![
                    answer_script("ans_agent_a"),
                    vote_script("agent_a"),
                    presentation_script("final mock answer"),
                ])),
                ("agent_b", ScriptedBackend::new(vec![answer_script("ans_agent_b"), vote_script("agent_a")])),
                ("agent_c", ScriptedBackend::new(vec![answer_script("ans_agent_c"), vote_script("agent_a")])),
            ],
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let result = orch.run("do the task", tx).await.unwrap();
        while rx.recv().await.is_some() {}

        assert_eq!(result.winner_id, "agent_a");
        assert_eq!(result.final_answer, "final mock answer");
    }

    #[tokio::test]
    async fn tie_broken_by_registration_order() {
        let orch = orchestrator(
            &["agent_a", "agent_b"],
            MassGenConfig::default(),
            vec![
                ("agent_a", ScriptedBackend::new(vec![
                    answer_script("ans_a"),
                    vote_script("agent_a"),
                    presentation_script("a wins"),
                ])),
                ("agent_b", ScriptedBackend::new(vec![answer_script("ans_b"), vote_script("agent_b")])),
            ],
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let result = orch.run("do the task", tx).await.unwrap();
        while rx.recv().await.is_some() {}

        assert_eq!(result.winner_id, "agent_a");
    }

    #[tokio::test]
    async fn invalid_vote_retry_then_succeeds() {
        let session = SessionContext::new(
            vec!["agent_a".to_string(), "agent_b".to_string()],
            MassGenConfig::default(),
            HashSet::new(),
        );
        session.tracker.add_agent_answer("agent_b", "answer from b", None);

        let backend = ScriptedBackend::new(vec![vote_script("nonexistent"), vote_script("agent_b")]);

        let mut backend_map: HashMap<String, Arc<dyn AgentBackend>> = HashMap::new();
        backend_map.insert("agent_a".to_string(), Arc::new(backend));
        let orch = Orchestrator::new(session, backend_map);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = Arc::clone(&orch);
        tokio::spawn(async move { handle.run_agent_turn("agent_a".to_string(), "task".to_string(), tx).await })
            .await
            .unwrap();

        let mut saw_vote = false;
        while let Some(event) = rx.recv().await {
            if let StreamEvent::Result { payload: ResultPayload::Vote(vote), .. } = event {
                assert_eq!(vote.voted_for.as_ref(), "agent_b");
                saw_vote = true;
            }
        }
        assert!(saw_vote, "expected the retried vote to succeed");
    }

    #[tokio::test]
    async fn skip_voting_mode_ends_on_all_answered() {
        let mut config = MassGenConfig::default();
        config.coordination_config.skip_voting = true;

        let orch = orchestrator(
            &["agent_a", "agent_b"],
            config,
            vec![
                ("agent_a", ScriptedBackend::new(vec![answer_script("ans_a"), presentation_script("final")])),
                ("agent_b", ScriptedBackend::new(vec![answer_script("ans_b")])),
            ],
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let result = orch.run("do the task", tx).await.unwrap();
        while rx.recv().await.is_some() {}

        assert_eq!(result.winner_id, "agent_a");
        assert_eq!(result.final_answer, "final");
    }

    /// An agent that never manages to call `vote`/`new_answer` must be marked failed and
    /// dropped from the consensus gate instead of being re-dispatched forever.
    #[tokio::test]
    async fn persistently_failing_agent_is_excluded_instead_of_looping_forever() {
        let orch = orchestrator(
            &["agent_a", "agent_b"],
            MassGenConfig::default(),
            vec![
                // agent_a never produces a workflow tool call, on any of its 3 attempts.
                ("agent_a", ScriptedBackend::new(vec![vec![Chunk::Done], vec![Chunk::Done], vec![Chunk::Done]])),
                ("agent_b", ScriptedBackend::new(vec![
                    answer_script("ans_b"),
                    vote_script("agent_b"),
                    presentation_script("final from b"),
                ])),
            ],
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let result = tokio::time::timeout(Duration::from_secs(5), orch.run("do the task", tx))
            .await
            .expect("orchestrator run must terminate instead of looping forever")
            .unwrap();
        while rx.recv().await.is_some() {}

        assert_eq!(result.winner_id, "agent_b");
        assert_eq!(result.final_answer, "final from b");
        assert!(orch.agent_states["agent_a"].lock().await.failed);
    }
}
