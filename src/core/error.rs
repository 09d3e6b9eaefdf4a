//! 错误类型体系
//!
//! AgentError：中断当前轮次的进程级错误（鉴权、上游模型、存储）。
//! DomainError：工具处理器的业务失败（任务不存在、非属主、循环依赖等），
//! 不中断轮次，折叠进 tool-result 消息回馈给模型。

use thiserror::Error;

/// 进程级错误：会中断当前轮次（已持久化的消息与工具结果不回滚）
#[derive(Error, Debug)]
pub enum AgentError {
    /// 会话/资源属主不匹配，在任何模型或工具调用之前拒绝
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// 请求引用的会话不存在
    #[error("Not found: {0}")]
    NotFound(String),

    /// 上游模型瞬时故障（限流、5xx、网络），由 RetryGovernor 重试
    #[error("Upstream transient failure: {0}")]
    UpstreamTransient(String),

    /// 上游模型不可恢复故障（响应格式错误、鉴权失败），不重试
    #[error("Upstream fatal failure: {0}")]
    UpstreamFatal(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl From<rusqlite::Error> for AgentError {
    fn from(e: rusqlite::Error) -> Self {
        AgentError::Storage(e.to_string())
    }
}

/// 业务级错误：工具调用范围内可恢复，作为 tool-result 回馈给模型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("Task {0} not found")]
    TaskNotFound(i64),

    #[error("Task {0} does not belong to the caller")]
    NotOwner(i64),

    /// 加边会闭合环路（depends_on 已可达 task）
    #[error("Dependency {task_id} -> {depends_on} would create a cycle")]
    CircularDependency { task_id: i64, depends_on: i64 },

    #[error("Task {0} cannot depend on itself")]
    SelfDependency(i64),

    #[error("Dependency {task_id} -> {depends_on} already exists")]
    DuplicateDependency { task_id: i64, depends_on: i64 },

    /// 前置依赖未全部完成时禁止完成任务
    #[error("Task {task_id} has incomplete dependencies: {pending:?}")]
    DependenciesIncomplete { task_id: i64, pending: Vec<i64> },

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}
