//! 持久化存储：会话日志与任务/依赖图（rusqlite，Mutex<Connection>）

pub mod conversations;
pub mod tasks;

pub use conversations::{
    Conversation, ConversationStore, Message, MessageBody, Role, ToolErrorKind, ToolFault,
    ToolRecord,
};
pub use tasks::{Task, TaskFilter, TaskPatch, TaskStore, TaskStoreError};
