//! Session configuration, following the donor crate's philosophy of a plain, hand-built
//! struct tree with a `Default` impl rather than a config-file parsing dependency
//! (see `cloudllm::config::CloudLLMConfig`).

/// How peer-to-peer / peer-to-human broadcast is wired up for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastMode {
    Agents,
    Human,
    Off,
}

/// How strongly `ask_others` usage is encouraged in the evaluation-protocol prompt section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sensitivity {
    Low,
    Medium,
    High,
}

/// Knobs governing the `BroadcastChannel` and the `ask_others`/`vote` prompting guidance.
#[derive(Debug, Clone)]
pub struct CoordinationConfig {
    pub max_broadcasts_per_agent: usize,
    pub broadcast_timeout_ms: u64,
    pub broadcast_sensitivity: Sensitivity,
    pub broadcast: BroadcastMode,
    pub skip_voting: bool,
    pub disable_injection: bool,
    pub voting_sensitivity: Sensitivity,
    pub persona_easing_enabled: bool,
    pub planning_mode_instruction: String,
    pub use_two_tier_workspace: bool,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        CoordinationConfig {
            max_broadcasts_per_agent: 3,
            broadcast_timeout_ms: 60_000,
            broadcast_sensitivity: Sensitivity::Medium,
            broadcast: BroadcastMode::Off,
            skip_voting: false,
            disable_injection: false,
            voting_sensitivity: Sensitivity::Medium,
            persona_easing_enabled: false,
            planning_mode_instruction: String::from(
                "Before acting, outline your plan in a few bullet points.",
            ),
            use_two_tier_workspace: false,
        }
    }
}

/// Per-round soft/hard timeout knobs consumed by `RoundTimeoutHook`.
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    pub initial_round_timeout_seconds: u64,
    pub subsequent_round_timeout_seconds: u64,
    pub round_timeout_grace_seconds: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        TimeoutConfig {
            initial_round_timeout_seconds: 300,
            subsequent_round_timeout_seconds: 180,
            round_timeout_grace_seconds: 30,
        }
    }
}

/// Top-level session configuration.
#[derive(Debug, Clone, Default)]
pub struct MassGenConfig {
    pub coordination_config: CoordinationConfig,
    pub timeout_config: TimeoutConfig,
    /// Total session wall-clock budget; `None` means unbounded.
    pub session_timeout_seconds: Option<u64>,
    pub enable_memory: bool,
    pub enable_task_planning: bool,
    pub use_skills: bool,
    pub async_subagents_enabled: bool,
    /// Whether agents may execute shell commands; gates the presentation turn's unconditional
    /// `requirements.txt` packaging guidance (see DESIGN.md Open Question 2).
    pub enable_command_execution: bool,
}
