//! Abstract agent-backend collaborator interface.
//!
//! Concrete LLM backends are explicitly out of scope for this crate (see SPEC_FULL.md §1
//! Non-goals); this module only defines the trait boundary the orchestrator drives, modeled
//! on the donor crate's `client_wrapper::ClientWrapper` trait shape but adapted to the exact
//! `Chunk` variant set the coordination protocol needs.

use std::error::Error;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::Stream;
use serde_json::Value;

use crate::conversation_buffer::RenderedMessage;

/// A tool schema surfaced to the backend alongside a chat request.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters_schema: Value,
}

/// One streamed unit of output from an agent backend.
#[derive(Debug, Clone)]
pub enum Chunk {
    Content { text: String },
    Reasoning { text: String },
    ToolCall { id: Option<String>, name: String, arguments_json: String },
    ToolResult { id: Option<String>, content: String },
    Done,
    Error { message: String },
    CompleteMessage { role: String, content: String },
}

/// Ambient per-turn information threaded through to the backend: which agent is running,
/// what round it's in, and whether this is the final presentation turn.
#[derive(Debug, Clone)]
pub struct BackendContext {
    pub agent_id: String,
    pub round: u32,
    pub is_presentation_turn: bool,
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Chunk> + Send>>;

/// The abstract agent backend: given a rendered message history and the tool set available
/// this turn, stream back content/reasoning/tool-call chunks until `Done` or `Error`.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    async fn stream(
        &self,
        messages: &[RenderedMessage],
        tools: &[ToolSpec],
        context: &BackendContext,
    ) -> Result<ChunkStream, Box<dyn Error + Send + Sync>>;

    /// Optional workspace capability. Backends without a filesystem return `None`, and the
    /// system-message builder omits the Filesystem section entirely (SPEC_FULL.md §4.5 item 4).
    fn workspace(&self) -> Option<&dyn WorkspaceOps> {
        None
    }

    /// Optional async-subagent capability. Backends that never spawn background subagents
    /// return `None`, and `AsyncSubagentResultHook` is simply not registered for them
    /// (SPEC_FULL.md §4.4 item 3).
    fn subagent_registry(&self) -> Option<Arc<dyn SubagentRegistry>> {
        None
    }
}

/// Filesystem collaborator interface. The sandboxing/snapshotting mechanics themselves are an
/// out-of-scope external collaborator (SPEC_FULL.md §1); the core only needs these three calls.
#[async_trait]
pub trait WorkspaceOps: Send + Sync {
    async fn save_snapshot(
        &self,
        timestamp: chrono::DateTime<chrono::Utc>,
        is_final: bool,
    ) -> Result<String, Box<dyn Error + Send + Sync>>;

    async fn clear_workspace(&self) -> Result<(), Box<dyn Error + Send + Sync>>;

    async fn copy_snapshots_to_temp_workspace(
        &self,
        snapshots_by_agent: &std::collections::HashMap<String, String>,
        anon_mapping: &std::collections::HashMap<String, String>,
    ) -> Result<String, Box<dyn Error + Send + Sync>>;

    /// Current workspace root, used by the Filesystem system-message section.
    fn workspace_path(&self) -> &str;
}

/// Background-subagent result collaborator. The subagent execution mechanics themselves are
/// an out-of-scope external collaborator (SPEC_FULL.md §1); the core only needs to poll
/// whichever of an agent's dispatched subagents have finished since the last poll.
#[async_trait]
pub trait SubagentRegistry: Send + Sync {
    /// Drains and returns `(subagent_id, result_summary)` pairs completed since the last call
    /// for `agent_id`. Must not return the same completion twice.
    async fn poll_completed(&self, agent_id: &str) -> Vec<(String, String)>;
}
