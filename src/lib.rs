//! Multi-agent coordination orchestrator: drives heterogeneous LLM-backed agents through a
//! round-based answer/vote protocol to converge on a single best answer.

pub mod backend;
pub mod broadcast;
pub mod config;
pub mod conversation_buffer;
pub mod coordination_tracker;
pub mod error;
pub mod hooks;
pub mod orchestrator;
pub mod session;
pub mod system_message;
pub mod types;

pub use backend::{AgentBackend, BackendContext, Chunk, ChunkStream, SubagentRegistry, ToolSpec, WorkspaceOps};
pub use config::{BroadcastMode, CoordinationConfig, MassGenConfig, Sensitivity, TimeoutConfig};
pub use conversation_buffer::{ConversationBuffer, ConversationEntry, EntryKind, RenderedMessage};
pub use coordination_tracker::{CoordinationTracker, VotePayload};
pub use error::MassGenError;
pub use orchestrator::{ExternalToolCall, FinalResult, Orchestrator, ResultPayload, StreamEvent};
pub use session::SessionContext;
pub use types::{AgentAnswer, AgentId, AgentState, AgentVote, BroadcastQuestion};
