//! 核心编排：错误体系、重试、上下文构建与多轮循环

pub mod context;
pub mod error;
pub mod orchestrator;
pub mod retry;
pub mod state;

pub use context::ContextBuilder;
pub use error::{AgentError, DomainError};
pub use orchestrator::{Orchestrator, TurnRequest};
pub use retry::RetryGovernor;
pub use state::{ToolCallSummary, TurnEvent, TurnOutcome};
