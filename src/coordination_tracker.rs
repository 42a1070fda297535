//! Authoritative, thread-safe append-only log of coordination state: answers, votes,
//! rounds, and the anonymous identity mapping.
//!
//! Transcribed from `tests/unit/test_coordination_tracker.py` (the original implementation
//! this crate's specification was distilled from had no kept source for this module, only
//! its test suite, so the exact label/round/mapping semantics below are read off those
//! assertions directly).

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;

use crate::error::MassGenError;
use crate::types::{AgentAnswer, AgentVote};

/// Input payload for [`CoordinationTracker::add_agent_vote`]. `agent_id` is expected to
/// already be resolved to a real agent id by the orchestrator's tool-dispatch boundary
/// (see DESIGN.md Open Question 1).
#[derive(Debug, Clone)]
pub struct VotePayload {
    pub agent_id: String,
    pub reason: String,
    pub suggestions: Option<HashMap<String, String>>,
}

#[derive(Default)]
struct TrackerState {
    agent_ids: Vec<String>,
    anon_forward: HashMap<String, String>,
    anon_reverse: HashMap<String, String>,
    answers_by_agent: HashMap<String, Vec<AgentAnswer>>,
    votes: Vec<AgentVote>,
    agent_rounds: HashMap<String, u32>,
    restart_pending: HashMap<String, bool>,
    last_context: HashMap<String, HashMap<String, String>>,
    is_final_round: bool,
    final_winner: Option<String>,
    iteration: u32,
}

/// Authoritative coordination log, guarded by a single mutex (SPEC_FULL.md §5 shared-resource
/// policy: "single mutex; all mutators hold it briefly; read operations return owned copies").
pub struct CoordinationTracker {
    state: Mutex<TrackerState>,
}

impl CoordinationTracker {
    pub fn new() -> Self {
        CoordinationTracker { state: Mutex::new(TrackerState::default()) }
    }

    pub fn initialize_session(&self, agent_ids: &[String], _user_prompt: &str) {
        let mut state = self.state.lock().unwrap();
        let mut sorted = agent_ids.to_vec();
        sorted.sort();

        state.agent_ids = agent_ids.to_vec();
        state.anon_forward.clear();
        state.anon_reverse.clear();
        for (i, id) in sorted.iter().enumerate() {
            let anon = format!("agent{}", i + 1);
            state.anon_forward.insert(anon.clone(), id.clone());
            state.anon_reverse.insert(id.clone(), anon);
        }
        for id in agent_ids {
            state.agent_rounds.insert(id.clone(), 0);
            state.answers_by_agent.insert(id.clone(), Vec::new());
            state.restart_pending.insert(id.clone(), false);
        }
    }

    /// Adds an answer for `agent_id`, assigning label `"{anon}.{N}"` where N is one more than
    /// the agent's prior answer count. `round` is the agent's current round at commit time.
    pub fn add_agent_answer(&self, agent_id: &str, content: &str, changedoc: Option<String>) -> AgentAnswer {
        let mut state = self.state.lock().unwrap();
        let anon = state
            .anon_reverse
            .get(agent_id)
            .cloned()
            .unwrap_or_else(|| agent_id.to_string());
        let round = *state.agent_rounds.get(agent_id).unwrap_or(&0);
        let entry = state.answers_by_agent.entry(agent_id.to_string()).or_default();
        let n = entry.len() + 1;
        let answer = AgentAnswer {
            agent_id: std::sync::Arc::from(agent_id),
            content: content.to_string(),
            timestamp: Utc::now(),
            round_number: round,
            label: format!("{anon}.{n}"),
            changedoc,
        };
        entry.push(answer.clone());
        answer
    }

    pub fn get_latest_answer_label(&self, agent_id: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        state
            .answers_by_agent
            .get(agent_id)
            .and_then(|answers| answers.last())
            .map(|a| a.label.clone())
    }

    /// Snapshots the answers visible to `voter_id` right now, so that a vote cast shortly
    /// after can attach the exact label the voter actually saw.
    pub fn track_agent_context(&self, voter_id: &str, visible_answers: HashMap<String, String>) {
        let mut state = self.state.lock().unwrap();
        state.last_context.insert(voter_id.to_string(), visible_answers);
    }

    /// Records a vote. Rejects votes for an agent with no recorded answer.
    pub fn add_agent_vote(&self, voter_id: &str, payload: VotePayload) -> Result<AgentVote, MassGenError> {
        let mut state = self.state.lock().unwrap();

        let has_answer = state
            .answers_by_agent
            .get(&payload.agent_id)
            .map(|a| !a.is_empty())
            .unwrap_or(false);
        if !has_answer {
            return Err(MassGenError::ProtocolViolation(format!(
                "Invalid agent_id: {} has no recorded answer",
                payload.agent_id
            )));
        }

        let voter_anon_id = state
            .anon_reverse
            .get(voter_id)
            .cloned()
            .unwrap_or_else(|| voter_id.to_string());

        let voted_for_label = state
            .last_context
            .get(voter_id)
            .and_then(|ctx| ctx.get(&payload.agent_id))
            .cloned()
            .or_else(|| {
                state
                    .answers_by_agent
                    .get(&payload.agent_id)
                    .and_then(|a| a.last())
                    .map(|a| a.label.clone())
            })
            .unwrap_or_default();

        let vote = AgentVote {
            voter_id: std::sync::Arc::from(voter_id),
            voter_anon_id,
            voted_for: std::sync::Arc::from(payload.agent_id.as_str()),
            voted_for_label,
            reason: payload.reason,
            suggestions: payload.suggestions,
            timestamp: Utc::now(),
        };
        state.votes.push(vote.clone());
        Ok(vote)
    }

    pub fn votes(&self) -> Vec<AgentVote> {
        self.state.lock().unwrap().votes.clone()
    }

    pub fn answers_by_agent(&self, agent_id: &str) -> Vec<AgentAnswer> {
        self.state
            .lock()
            .unwrap()
            .answers_by_agent
            .get(agent_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn track_restart_signal(&self, _source: &str, peers: &[String]) {
        let mut state = self.state.lock().unwrap();
        for peer in peers {
            state.restart_pending.insert(peer.clone(), true);
        }
    }

    /// Clears a pending restart for `agent_id` and advances its round by 1. No-op if no
    /// restart was pending.
    pub fn complete_agent_restart(&self, agent_id: &str) {
        let mut state = self.state.lock().unwrap();
        let pending = state.restart_pending.get(agent_id).copied().unwrap_or(false);
        if pending {
            state.restart_pending.insert(agent_id.to_string(), false);
            *state.agent_rounds.entry(agent_id.to_string()).or_insert(0) += 1;
        }
    }

    pub fn start_new_iteration(&self) {
        let mut state = self.state.lock().unwrap();
        state.iteration += 1;
    }

    /// Sets `is_final_round`/`final_winner`, and advances **only the winner's** round to
    /// `max(all rounds) + 1` (other agents' rounds are untouched).
    pub fn start_final_round(&self, winner_id: &str) {
        let mut state = self.state.lock().unwrap();
        let max_round = state.agent_rounds.values().copied().max().unwrap_or(0);
        state.is_final_round = true;
        state.final_winner = Some(winner_id.to_string());
        state.agent_rounds.insert(winner_id.to_string(), max_round + 1);
    }

    pub fn is_final_round(&self) -> bool {
        self.state.lock().unwrap().is_final_round
    }

    pub fn final_winner(&self) -> Option<String> {
        self.state.lock().unwrap().final_winner.clone()
    }

    pub fn get_anonymous_agent_mapping(&self) -> HashMap<String, String> {
        self.state.lock().unwrap().anon_forward.clone()
    }

    pub fn get_reverse_agent_mapping(&self) -> HashMap<String, String> {
        self.state.lock().unwrap().anon_reverse.clone()
    }

    pub fn get_agent_round(&self, agent_id: &str) -> u32 {
        self.state.lock().unwrap().agent_rounds.get(agent_id).copied().unwrap_or(0)
    }

    /// Registration order used for tie-breaking winner determination (§4.1.3).
    pub fn registration_order(&self) -> Vec<String> {
        self.state.lock().unwrap().agent_ids.clone()
    }
}

impl Default for CoordinationTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(agent_ids: &[&str]) -> CoordinationTracker {
        let tracker = CoordinationTracker::new();
        let ids: Vec<String> = agent_ids.iter().map(|s| s.to_string()).collect();
        tracker.initialize_session(&ids, "test");
        tracker
    }

    #[test]
    fn add_agent_answer_assigns_incrementing_labels() {
        let t = tracker(&["agent_a", "agent_b"]);
        t.add_agent_answer("agent_a", "first", None);
        t.add_agent_answer("agent_a", "second", None);

        let labels: Vec<String> = t.answers_by_agent("agent_a").iter().map(|a| a.label.clone()).collect();
        assert_eq!(labels, vec!["agent1.1", "agent1.2"]);
        assert_eq!(t.get_latest_answer_label("agent_a"), Some("agent1.2".to_string()));
    }

    #[test]
    fn vote_uses_label_from_voter_context() {
        let t = tracker(&["agent_a", "agent_b"]);
        t.add_agent_answer("agent_a", "answer from a", None);
        t.add_agent_answer("agent_b", "answer from b", None);
        t.start_new_iteration();

        let mut ctx = HashMap::new();
        ctx.insert("agent_b".to_string(), "answer from b".to_string());
        t.track_agent_context("agent_a", ctx);

        let vote = t
            .add_agent_vote(
                "agent_a",
                VotePayload { agent_id: "agent_b".to_string(), reason: "best fit".to_string(), suggestions: None },
            )
            .unwrap();

        assert_eq!(vote.voter_id.as_ref(), "agent_a");
        assert_eq!(vote.voter_anon_id, "agent1");
        assert_eq!(vote.voted_for.as_ref(), "agent_b");
        assert_eq!(vote.voted_for_label, "agent2.1");
    }

    #[test]
    fn complete_agent_restart_increments_round_only_when_pending() {
        let t = tracker(&["agent_a", "agent_b"]);

        t.complete_agent_restart("agent_a");
        assert_eq!(t.get_agent_round("agent_a"), 0);

        t.track_restart_signal("agent_b", &["agent_a".to_string()]);
        t.complete_agent_restart("agent_a");
        assert_eq!(t.get_agent_round("agent_a"), 1);

        t.complete_agent_restart("agent_a");
        assert_eq!(t.get_agent_round("agent_a"), 1);
    }

    #[test]
    fn start_final_round_sets_winner_and_advances_round_from_max() {
        let t = tracker(&["agent_a", "agent_b"]);
        t.track_restart_signal("x", &["agent_a".to_string()]);
        t.complete_agent_restart("agent_a"); // agent_a round -> 1
        t.track_restart_signal("x", &["agent_b".to_string()]);
        t.complete_agent_restart("agent_b"); // agent_b round -> 1
        t.track_restart_signal("x", &["agent_b".to_string()]);
        t.complete_agent_restart("agent_b"); // agent_b round -> 2

        t.start_final_round("agent_a");

        assert!(t.is_final_round());
        assert_eq!(t.final_winner(), Some("agent_a".to_string()));
        assert_eq!(t.get_agent_round("agent_a"), 3);
        assert_eq!(t.get_agent_round("agent_b"), 2);
    }

    #[test]
    fn anonymous_mapping_uses_sorted_agent_ids() {
        let t = tracker(&["agent_c", "agent_a", "agent_b"]);
        let anon_to_real = t.get_anonymous_agent_mapping();
        let real_to_anon = t.get_reverse_agent_mapping();

        assert_eq!(anon_to_real.get("agent1"), Some(&"agent_a".to_string()));
        assert_eq!(anon_to_real.get("agent2"), Some(&"agent_b".to_string()));
        assert_eq!(anon_to_real.get("agent3"), Some(&"agent_c".to_string()));
        assert_eq!(real_to_anon.get("agent_a"), Some(&"agent1".to_string()));
    }

    #[test]
    fn vote_with_suggestions_tri_state() {
        let t = tracker(&["agent_a", "agent_b", "agent_c"]);
        t.add_agent_answer("agent_a", "a", None);
        t.add_agent_answer("agent_b", "b", None);
        t.add_agent_answer("agent_c", "c", None);
        t.start_new_iteration();
        t.track_agent_context("agent_a", HashMap::new());

        let populated = t
            .add_agent_vote(
                "agent_a",
                VotePayload {
                    agent_id: "agent_b".to_string(),
                    reason: "best".to_string(),
                    suggestions: Some(HashMap::from([("agent_c".to_string(), "add examples".to_string())])),
                },
            )
            .unwrap();
        assert!(matches!(populated.suggestions, Some(ref m) if !m.is_empty()));

        let empty = t
            .add_agent_vote(
                "agent_a",
                VotePayload { agent_id: "agent_b".to_string(), reason: "best".to_string(), suggestions: Some(HashMap::new()) },
            )
            .unwrap();
        assert_eq!(empty.suggestions, Some(HashMap::new()));

        let absent = t
            .add_agent_vote(
                "agent_a",
                VotePayload { agent_id: "agent_b".to_string(), reason: "best".to_string(), suggestions: None },
            )
            .unwrap();
        assert_eq!(absent.suggestions, None);
    }

    #[test]
    fn add_vote_with_unknown_agent_is_rejected() {
        let t = tracker(&["agent_a", "agent_b"]);
        let result = t.add_agent_vote(
            "agent_a",
            VotePayload { agent_id: "nonexistent".to_string(), reason: "x".to_string(), suggestions: None },
        );
        assert!(result.is_err());
    }
}
