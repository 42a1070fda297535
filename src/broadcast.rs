//! Request/response fan-out between agents (via shadow clones) or between an agent and a
//! human operator, with bounded concurrency and timeouts.
//!
//! Transcribed from `_broadcast_channel.py`: rate limiting, `expected_response_count`
//! computation, the concurrent (non-serialized) shadow-agent fan-out in `agents` mode versus
//! the single-slot serialization lock in `human` mode, per-shadow error isolation, and
//! `human_qa_history` retention all mirror that file's behavior.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use crate::error::MassGenError;
use crate::types::BroadcastQuestion;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastStatus {
    Pending,
    Collecting,
    Complete,
    Timeout,
}

#[derive(Debug, Clone)]
pub struct BroadcastResponse {
    pub request_id: String,
    pub responder_id: String,
    pub content: String,
    pub is_human: bool,
    pub timestamp: chrono::DateTime<Utc>,
}

struct BroadcastRequest {
    id: String,
    sender: String,
    #[allow(dead_code)]
    question: BroadcastQuestion,
    expected_response_count: usize,
    responses: Vec<BroadcastResponse>,
    target_agents: Option<Vec<String>>,
    status: BroadcastStatus,
    notify: Arc<Notify>,
}

/// A shadow agent's answering function: given the question text, produce an answer (or an
/// error which becomes a `[Error: ...]` response, per SPEC_FULL.md §4.3).
pub type ShadowAnswerFn =
    Arc<dyn Fn(String, String) -> futures_util::future::BoxFuture<'static, Result<String, String>> + Send + Sync>;

struct BroadcastState {
    active: HashMap<String, BroadcastRequest>,
    in_flight_by_sender: HashMap<String, usize>,
    human_qa_history: Vec<(String, String)>,
}

/// Coordinates broadcast requests for one session. All state mutations take the single
/// `state` mutex briefly; waiting is done via a per-request `Notify`, never under the lock.
pub struct BroadcastChannel {
    state: Mutex<BroadcastState>,
    human_ask_others_lock: Mutex<()>,
    human_input_lock: Mutex<()>,
    max_broadcasts_per_agent: usize,
}

impl BroadcastChannel {
    pub fn new(max_broadcasts_per_agent: usize) -> Self {
        BroadcastChannel {
            state: Mutex::new(BroadcastState {
                active: HashMap::new(),
                in_flight_by_sender: HashMap::new(),
                human_qa_history: Vec::new(),
            }),
            human_ask_others_lock: Mutex::new(()),
            human_input_lock: Mutex::new(()),
            max_broadcasts_per_agent,
        }
    }

    /// Enforces the per-agent in-flight cap, resolves the target set, computes
    /// `expected_response_count`, and registers the request.
    pub async fn create_broadcast(
        &self,
        sender: &str,
        question: BroadcastQuestion,
        all_agent_ids: &[String],
        target_agents: Option<Vec<String>>,
        is_human_mode: bool,
    ) -> Result<String, MassGenError> {
        let mut state = self.state.lock().await;

        let in_flight = state.in_flight_by_sender.get(sender).copied().unwrap_or(0);
        if in_flight >= self.max_broadcasts_per_agent {
            return Err(MassGenError::Configuration(format!(
                "agent {sender} has {in_flight} in-flight broadcasts, at cap {}",
                self.max_broadcasts_per_agent
            )));
        }

        let resolved_targets: Vec<String> = match &target_agents {
            Some(targets) => targets.iter().filter(|id| id.as_str() != sender).cloned().collect(),
            None => all_agent_ids.iter().filter(|id| id.as_str() != sender).cloned().collect(),
        };

        if !is_human_mode && resolved_targets.is_empty() {
            let valid: Vec<&String> = all_agent_ids.iter().filter(|id| id.as_str() != sender).collect();
            return Err(MassGenError::Configuration(format!(
                "ask_others targets resolved to an empty set excluding sender; valid targets: {valid:?}"
            )));
        }

        let expected_response_count = if is_human_mode { 1 } else { resolved_targets.len() };

        let id = Uuid::new_v4().to_string();
        state.active.insert(
            id.clone(),
            BroadcastRequest {
                id: id.clone(),
                sender: sender.to_string(),
                question,
                expected_response_count,
                responses: Vec::new(),
                target_agents: Some(resolved_targets),
                status: BroadcastStatus::Pending,
                notify: Arc::new(Notify::new()),
            },
        );
        *state.in_flight_by_sender.entry(sender.to_string()).or_insert(0) += 1;
        Ok(id)
    }

    /// In `agents` mode, spawns one shadow answer per target concurrently; a failing shadow's
    /// content becomes `"[Error: ...]"` and does not cancel its siblings.
    pub async fn inject_into_agents(&self, request_id: &str, answer_fn: ShadowAnswerFn) {
        let (targets, question_text) = {
            let mut state = self.state.lock().await;
            let Some(req) = state.active.get_mut(request_id) else { return };
            req.status = BroadcastStatus::Collecting;
            (req.target_agents.clone().unwrap_or_default(), req.question.as_prompt_text())
        };

        let futures = targets.into_iter().map(|target| {
            let answer_fn = answer_fn.clone();
            let question_text = question_text.clone();
            let target = target.clone();
            async move {
                let result = answer_fn(target.clone(), question_text).await;
                let content = match result {
                    Ok(answer) => answer,
                    Err(e) => format!("[Error: {e}]"),
                };
                (target, content)
            }
        });

        let results = join_all(futures).await;
        for (responder, content) in results {
            self.collect_response(request_id, &responder, content, false).await;
        }
    }

    /// Prompts a human operator for a response in `human` mode, serialized by a single-slot
    /// lock so overlapping modals never appear.
    pub async fn prompt_human<F, Fut>(&self, request_id: &str, prompt_fn: F)
    where
        F: FnOnce(String) -> Fut,
        Fut: std::future::Future<Output = String>,
    {
        let _guard = self.human_input_lock.lock().await;
        let question_text = {
            let mut state = self.state.lock().await;
            let Some(req) = state.active.get_mut(request_id) else { return };
            req.status = BroadcastStatus::Collecting;
            req.question.as_prompt_text()
        };
        let answer = prompt_fn(question_text.clone()).await;
        {
            let mut state = self.state.lock().await;
            state.human_qa_history.push((question_text, answer.clone()));
        }
        self.collect_response(request_id, "human", answer, true).await;
    }

    /// Serializes an arbitrary `ask_others` call body in human mode (matches
    /// `_execute_ask_others_serialized` in `broadcast.py`).
    pub async fn with_human_ask_others_lock<F, Fut, T>(&self, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        let _guard = self.human_ask_others_lock.lock().await;
        f().await
    }

    pub async fn collect_response(&self, request_id: &str, responder_id: &str, content: String, is_human: bool) {
        let mut state = self.state.lock().await;
        let Some(req) = state.active.get_mut(request_id) else { return };
        req.responses.push(BroadcastResponse {
            request_id: request_id.to_string(),
            responder_id: responder_id.to_string(),
            content,
            is_human,
            timestamp: Utc::now(),
        });
        if req.responses.len() >= req.expected_response_count {
            req.status = BroadcastStatus::Complete;
            req.notify.notify_waiters();
        }
    }

    /// Blocks until complete or timeout; returns whatever responses were collected either way.
    pub async fn wait_for_responses(
        &self,
        request_id: &str,
        timeout: Duration,
    ) -> (BroadcastStatus, Vec<BroadcastResponse>) {
        let notify = {
            let state = self.state.lock().await;
            match state.active.get(request_id) {
                Some(req) if req.status == BroadcastStatus::Complete => {
                    return (BroadcastStatus::Complete, req.responses.clone())
                }
                Some(req) => req.notify.clone(),
                None => return (BroadcastStatus::Timeout, Vec::new()),
            }
        };

        let wait_result = tokio::time::timeout(timeout, notify.notified()).await;

        let mut state = self.state.lock().await;
        let Some(req) = state.active.get_mut(request_id) else {
            return (BroadcastStatus::Timeout, Vec::new());
        };
        if wait_result.is_err() && req.status != BroadcastStatus::Complete {
            log::warn!(
                "broadcast {request_id} timed out after {:?} with {}/{} responses",
                timeout,
                req.responses.len(),
                req.expected_response_count
            );
            req.status = BroadcastStatus::Timeout;
        }
        (req.status, req.responses.clone())
    }

    pub async fn cleanup_broadcast(&self, request_id: &str) {
        let mut state = self.state.lock().await;
        if let Some(req) = state.active.remove(request_id) {
            if let Some(count) = state.in_flight_by_sender.get_mut(&req.sender) {
                *count = count.saturating_sub(1);
            }
        }
    }

    pub async fn get_human_qa_history(&self) -> Vec<(String, String)> {
        self.state.lock().await.human_qa_history.clone()
    }

    pub async fn get_broadcast_status(&self, request_id: &str) -> Option<BroadcastStatus> {
        self.state.lock().await.active.get(request_id).map(|r| r.status)
    }
}

impl std::fmt::Debug for BroadcastStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BroadcastStatus::Pending => "pending",
            BroadcastStatus::Collecting => "collecting",
            BroadcastStatus::Complete => "complete",
            BroadcastStatus::Timeout => "timeout",
        };
        write!(f, "{s}")
    }
}
