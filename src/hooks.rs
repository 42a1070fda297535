//! Pre/post tool-use hook pipeline.
//!
//! Mirrors the hook architecture exercised by `test_orchestrator_hooks_broadcast_subagents.py`:
//! hooks run in registration order, a `PreToolUse` deny short-circuits the remaining hooks,
//! and `inject` results accumulate with last-write-wins on `strategy`. Built on `async-trait`
//! the same way `AgentBackend` is, matching the donor crate's trait-object collaborator style.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use crate::backend::SubagentRegistry;
use crate::conversation_buffer::format_injection_message;
use crate::types::{AgentState, RoundTimeoutState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookType {
    PreToolUse,
    PostToolUse,
}

/// How injected content should be merged into the agent's conversation by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectStrategy {
    /// Append as a new turn.
    Append,
    /// Replace any pending injection of the same kind instead of stacking.
    Replace,
}

#[derive(Debug, Clone)]
pub struct InjectSpec {
    pub content: String,
    pub strategy: InjectStrategy,
}

/// Outcome of running the hook pipeline once for a single tool event.
#[derive(Debug, Clone, Default)]
pub struct HookResult {
    pub allowed: bool,
    pub decision: Option<String>,
    pub reason: Option<String>,
    pub inject: Option<InjectSpec>,
}

impl HookResult {
    fn allow() -> Self {
        HookResult { allowed: true, decision: None, reason: None, inject: None }
    }

    fn deny(reason: impl Into<String>) -> Self {
        HookResult {
            allowed: false,
            decision: Some("deny".to_string()),
            reason: Some(reason.into()),
            inject: None,
        }
    }
}

/// Context a hook needs to inspect the calling agent and its known peers.
pub struct HookContext<'a> {
    pub agent_id: &'a str,
    pub agent_state: &'a mut AgentState,
    pub known_peer_answers: &'a HashMap<String, String>,
    /// Real agent id -> anon alias, used to tag peer answers in injected updates
    /// (SPEC_FULL.md §3: "Anon mapping ... used in all peer-visible prompts").
    pub anon_mapping: &'a HashMap<String, String>,
}

#[async_trait]
pub trait Hook: Send + Sync {
    fn hook_type(&self) -> HookType;

    async fn run(
        &self,
        tool_name: &str,
        arguments_json: &str,
        tool_output: Option<&str>,
        ctx: &mut HookContext<'_>,
    ) -> HookResult;
}

/// Injects newly-arrived peer answers into an agent whose restart signal is pending; clears
/// `restart_pending` regardless of whether there was anything new to inject (a stale restart
/// against already-known answers is a no-op, not an error).
pub struct PeerAnswerInjection;

#[async_trait]
impl Hook for PeerAnswerInjection {
    fn hook_type(&self) -> HookType {
        HookType::PostToolUse
    }

    async fn run(
        &self,
        _tool_name: &str,
        _arguments_json: &str,
        _tool_output: Option<&str>,
        ctx: &mut HookContext<'_>,
    ) -> HookResult {
        if !ctx.agent_state.restart_pending {
            return HookResult::allow();
        }

        let new_ids: Vec<String> = ctx
            .known_peer_answers
            .keys()
            .filter(|id| !ctx.agent_state.known_answer_ids.contains(id.as_str()))
            .cloned()
            .collect();

        ctx.agent_state.restart_pending = false;
        ctx.agent_state.round += 1;

        if new_ids.is_empty() {
            return HookResult::allow();
        }

        let new_answers: HashMap<String, String> = new_ids
            .iter()
            .filter_map(|id| ctx.known_peer_answers.get(id).map(|content| (id.clone(), content.clone())))
            .collect();
        for id in &new_ids {
            ctx.agent_state.known_answer_ids.insert(AgentIdStr::from(id.as_str()));
        }
        ctx.agent_state.injection_count += 1;

        let content = format_injection_message(&new_answers, ctx.anon_mapping);

        HookResult {
            allowed: true,
            decision: None,
            reason: None,
            inject: Some(InjectSpec { content, strategy: InjectStrategy::Append }),
        }
    }
}

/// Helper so `PeerAnswerInjection` can insert into `HashSet<AgentId>` (`Arc<str>`) from a
/// borrowed `&str` without an extra trait bound leaking into the public API.
type AgentIdStr = std::sync::Arc<str>;

/// Soft-then-hard round timeout enforcement. On the soft boundary it injects a warning; past
/// the hard boundary (soft + grace) it denies non-workflow tool use until the agent calls a
/// workflow tool (`vote` / `new_answer`), which resets the hard-denial counter. The soft
/// boundary itself is round-aware: an agent's first round (`agent_state.round == 0`) uses
/// `initial_round_timeout`, any later round uses `subsequent_round_timeout`
/// (SPEC_FULL.md §4.4 item 2).
pub struct RoundTimeoutHook {
    pub initial_round_timeout: std::time::Duration,
    pub subsequent_round_timeout: std::time::Duration,
    pub grace_period: std::time::Duration,
    pub use_two_tier_workspace: bool,
}

#[async_trait]
impl Hook for RoundTimeoutHook {
    fn hook_type(&self) -> HookType {
        HookType::PreToolUse
    }

    async fn run(
        &self,
        tool_name: &str,
        _arguments_json: &str,
        _tool_output: Option<&str>,
        ctx: &mut HookContext<'_>,
    ) -> HookResult {
        let elapsed = ctx.agent_state.round_start_time.elapsed();
        let soft_timeout = if ctx.agent_state.round == 0 {
            self.initial_round_timeout
        } else {
            self.subsequent_round_timeout
        };
        let hard_timeout = soft_timeout + self.grace_period;

        let state = ctx
            .agent_state
            .round_timeout_state
            .get_or_insert_with(RoundTimeoutState::default);

        if tool_name == "vote" || tool_name == "new_answer" {
            state.consecutive_hard_denials = 0;
        }

        if elapsed >= hard_timeout {
            if tool_name == "vote" || tool_name == "new_answer" {
                return HookResult::allow();
            }
            state.consecutive_hard_denials += 1;
            log::warn!(
                "{}: denying tool '{tool_name}' under hard round timeout ({} consecutive denials)",
                ctx.agent_id,
                state.consecutive_hard_denials
            );
            return HookResult::deny(format!(
                "HARD TIMEOUT exceeded for this round ({} consecutive denials); call vote or new_answer now",
                state.consecutive_hard_denials
            ));
        }

        if elapsed >= soft_timeout && state.soft_timeout_fired_at.is_none() {
            state.soft_timeout_fired_at = Some(Instant::now());
            let mut content = String::from("ROUND TIME LIMIT APPROACHING. Wrap up your work soon.");
            if self.use_two_tier_workspace {
                content.push_str(" Make sure your final output is saved under deliverable/.");
            }
            return HookResult {
                allowed: true,
                decision: None,
                reason: None,
                inject: Some(InjectSpec { content, strategy: InjectStrategy::Append }),
            };
        }

        HookResult::allow()
    }
}

/// Surfaces completed async subagent results to the parent agent as an injection. Polls
/// `registry` for the calling agent on every tool event; a backend with no subagent capability
/// never gets this hook registered at all (`AgentBackend::subagent_registry` returns `None`).
pub struct AsyncSubagentResultHook {
    pub registry: Arc<dyn SubagentRegistry>,
    pub strategy: InjectStrategy,
}

#[async_trait]
impl Hook for AsyncSubagentResultHook {
    fn hook_type(&self) -> HookType {
        HookType::PostToolUse
    }

    async fn run(
        &self,
        _tool_name: &str,
        _arguments_json: &str,
        _tool_output: Option<&str>,
        ctx: &mut HookContext<'_>,
    ) -> HookResult {
        let completed = self.registry.poll_completed(ctx.agent_id).await;
        if completed.is_empty() {
            return HookResult::allow();
        }

        let content = completed
            .iter()
            .map(|(subagent_id, summary)| self.build_injection(subagent_id, summary).content)
            .collect::<Vec<_>>()
            .join("\n\n");

        HookResult {
            allowed: true,
            decision: None,
            reason: None,
            inject: Some(InjectSpec { content, strategy: self.strategy.clone() }),
        }
    }
}

impl AsyncSubagentResultHook {
    /// Builds the injection text for a single completed subagent result.
    pub fn build_injection(&self, subagent_id: &str, result_summary: &str) -> InjectSpec {
        InjectSpec {
            content: format!(
                "ASYNC SUBAGENT RESULTS: subagent {subagent_id} completed:\n{result_summary}"
            ),
            strategy: self.strategy.clone(),
        }
    }
}

/// Runs registered hooks of a given type in order; the first `PreToolUse` deny stops the
/// pipeline, while `PostToolUse` hooks all run and their injections are merged
/// (last-write-wins per `InjectStrategy::Replace`, otherwise concatenated).
pub struct HookManager {
    hooks: Vec<Box<dyn Hook>>,
}

impl HookManager {
    pub fn new() -> Self {
        HookManager { hooks: Vec::new() }
    }

    pub fn register(&mut self, hook: Box<dyn Hook>) {
        self.hooks.push(hook);
    }

    pub async fn execute_hooks(
        &self,
        hook_type: HookType,
        tool_name: &str,
        arguments_json: &str,
        ctx: &mut HookContext<'_>,
        tool_output: Option<&str>,
    ) -> HookResult {
        let mut merged: Option<InjectSpec> = None;
        let mut accumulated = String::new();

        for hook in self.hooks.iter().filter(|h| h.hook_type() == hook_type) {
            let result = hook.run(tool_name, arguments_json, tool_output, ctx).await;

            if !result.allowed {
                return result;
            }

            if let Some(spec) = result.inject {
                match spec.strategy {
                    InjectStrategy::Replace => merged = Some(spec),
                    InjectStrategy::Append => {
                        if !accumulated.is_empty() {
                            accumulated.push_str("\n\n");
                        }
                        accumulated.push_str(&spec.content);
                        merged = Some(InjectSpec {
                            content: accumulated.clone(),
                            strategy: InjectStrategy::Append,
                        });
                    }
                }
            }
        }

        HookResult { allowed: true, decision: None, reason: None, inject: merged }
    }
}

impl Default for HookManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AgentState;
    use std::sync::Mutex as StdMutex;

    #[tokio::test]
    async fn peer_answer_injection_clears_stale_restart_without_content() {
        let mut manager = HookManager::new();
        manager.register(Box::new(PeerAnswerInjection));

        let mut state = AgentState::new();
        state.restart_pending = true;
        let known = HashMap::new();
        let anon = HashMap::new();
        let mut ctx = HookContext {
            agent_id: "agent_a",
            agent_state: &mut state,
            known_peer_answers: &known,
            anon_mapping: &anon,
        };

        let result = manager
            .execute_hooks(HookType::PostToolUse, "read_file", "{}", &mut ctx, None)
            .await;

        assert!(result.inject.is_none());
        assert!(!ctx.agent_state.restart_pending);
    }

    #[tokio::test]
    async fn peer_answer_injection_surfaces_new_answers_under_anon_tag() {
        let mut manager = HookManager::new();
        manager.register(Box::new(PeerAnswerInjection));

        let mut state = AgentState::new();
        state.restart_pending = true;
        let mut known = HashMap::new();
        known.insert("agent_b".to_string(), "42".to_string());
        let mut anon = HashMap::new();
        anon.insert("agent_b".to_string(), "agent2".to_string());
        let mut ctx = HookContext {
            agent_id: "agent_a",
            agent_state: &mut state,
            known_peer_answers: &known,
            anon_mapping: &anon,
        };

        let result = manager
            .execute_hooks(HookType::PostToolUse, "read_file", "{}", &mut ctx, None)
            .await;

        let inject = result.inject.expect("expected injection");
        assert!(inject.content.contains("<agent2>"));
        assert!(inject.content.contains("42"));
        assert!(!inject.content.contains("agent_b"));
        assert!(!ctx.agent_state.restart_pending);
        assert_eq!(ctx.agent_state.injection_count, 1);
    }

    #[tokio::test]
    async fn round_timeout_hook_denies_past_hard_timeout_and_resets_on_vote() {
        let hook = RoundTimeoutHook {
            initial_round_timeout: std::time::Duration::from_secs(0),
            subsequent_round_timeout: std::time::Duration::from_secs(0),
            grace_period: std::time::Duration::from_secs(0),
            use_two_tier_workspace: true,
        };
        let mut manager = HookManager::new();
        manager.register(Box::new(hook));

        let mut state = AgentState::new();
        let known = HashMap::new();
        let anon = HashMap::new();
        let mut ctx = HookContext {
            agent_id: "agent_a",
            agent_state: &mut state,
            known_peer_answers: &known,
            anon_mapping: &anon,
        };

        let result = manager
            .execute_hooks(HookType::PreToolUse, "read_file", "{}", &mut ctx, None)
            .await;
        assert!(!result.allowed);
        assert!(result.reason.unwrap().contains("HARD TIMEOUT"));
        assert_eq!(ctx.agent_state.round_timeout_state.as_ref().unwrap().consecutive_hard_denials, 1);

        let result = manager
            .execute_hooks(HookType::PreToolUse, "vote", "{}", &mut ctx, None)
            .await;
        assert!(result.allowed);
        assert_eq!(ctx.agent_state.round_timeout_state.as_ref().unwrap().consecutive_hard_denials, 0);
    }

    #[tokio::test]
    async fn round_timeout_hook_uses_subsequent_timeout_past_round_zero() {
        // Round 0 would already be past a 0s initial timeout; a generous subsequent timeout
        // on round 1 must NOT fire the soft warning yet.
        let hook = RoundTimeoutHook {
            initial_round_timeout: std::time::Duration::from_secs(0),
            subsequent_round_timeout: std::time::Duration::from_secs(3600),
            grace_period: std::time::Duration::from_secs(3600),
            use_two_tier_workspace: false,
        };
        let mut manager = HookManager::new();
        manager.register(Box::new(hook));

        let mut state = AgentState::new();
        state.round = 1;
        let known = HashMap::new();
        let anon = HashMap::new();
        let mut ctx = HookContext {
            agent_id: "agent_a",
            agent_state: &mut state,
            known_peer_answers: &known,
            anon_mapping: &anon,
        };

        let result = manager
            .execute_hooks(HookType::PreToolUse, "read_file", "{}", &mut ctx, None)
            .await;
        assert!(result.allowed);
        assert!(result.inject.is_none());
    }

    struct MockRegistry {
        results: StdMutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl SubagentRegistry for MockRegistry {
        async fn poll_completed(&self, _agent_id: &str) -> Vec<(String, String)> {
            std::mem::take(&mut *self.results.lock().unwrap())
        }
    }

    #[tokio::test]
    async fn async_subagent_result_hook_injects_polled_completions() {
        let registry =
            Arc::new(MockRegistry { results: StdMutex::new(vec![("sub-1".to_string(), "done: 42".to_string())]) });
        let hook = AsyncSubagentResultHook { registry: registry.clone(), strategy: InjectStrategy::Append };
        let mut manager = HookManager::new();
        manager.register(Box::new(hook));

        let mut state = AgentState::new();
        let known = HashMap::new();
        let anon = HashMap::new();
        let mut ctx = HookContext {
            agent_id: "agent_a",
            agent_state: &mut state,
            known_peer_answers: &known,
            anon_mapping: &anon,
        };

        let result = manager
            .execute_hooks(HookType::PostToolUse, "read_file", "{}", &mut ctx, None)
            .await;
        let inject = result.inject.expect("expected injection");
        assert!(inject.content.contains("ASYNC SUBAGENT RESULTS"));
        assert!(inject.content.contains("sub-1"));
        assert!(inject.content.contains("done: 42"));

        // Second poll drains an empty queue; no further injection.
        let result = manager
            .execute_hooks(HookType::PostToolUse, "read_file", "{}", &mut ctx, None)
            .await;
        assert!(result.inject.is_none());
    }
}
