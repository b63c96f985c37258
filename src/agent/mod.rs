pub mod compaction;
pub mod conversation;
pub mod dispatch;
#[path = "loop.rs"]
pub mod agent_loop;
pub mod memory;
pub mod subagent;
pub mod tools;
pub mod verify;

pub use agent_loop::{AgentEvent, AgentLoop, FinalResponse, LoopConfig, RunOptions};
pub use conversation::Conversation;
pub use dispatch::ToolDispatcher;
pub use subagent::{SubagentOrchestrator, SubagentResult, SubagentTask};
pub use verify::{RequestProfile, VerificationOutcome, Verifier};
