//! Shared run-scoped state, passed as a value rather than reached for through a global
//! singleton (SPEC_FULL.md §9 Design Notes: "pass as a `SessionContext` value through the
//! orchestrator and its subcomponents; init once in `run()`; all sub-tasks receive the
//! context").

use std::collections::HashSet;
use std::sync::Arc;

use crate::broadcast::BroadcastChannel;
use crate::config::MassGenConfig;
use crate::coordination_tracker::CoordinationTracker;

/// Everything the orchestrator's subcomponents need that is fixed for the lifetime of one
/// coordination run: configuration, the coordination log, the broadcast channel, the
/// registration-order agent id list, and the set of externally-executed tool names.
pub struct SessionContext {
    pub config: MassGenConfig,
    pub tracker: Arc<CoordinationTracker>,
    pub broadcast: Arc<BroadcastChannel>,
    pub agent_ids: Vec<String>,
    pub external_tools: HashSet<String>,
}

impl SessionContext {
    /// Initializes the coordination log with `agent_ids` (registration order) and wires up a
    /// broadcast channel sized from the session's configuration. Call once per run; clone the
    /// returned `Arc` into each agent task.
    pub fn new(agent_ids: Vec<String>, config: MassGenConfig, external_tools: HashSet<String>) -> Arc<Self> {
        let tracker = Arc::new(CoordinationTracker::new());
        tracker.initialize_session(&agent_ids, "");
        let broadcast = Arc::new(BroadcastChannel::new(config.coordination_config.max_broadcasts_per_agent));
        Arc::new(SessionContext { config, tracker, broadcast, agent_ids, external_tools })
    }
}
