//! 模型客户端抽象
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 ModelClient：输入有序消息窗口与
//! 工具 schema 列表，输出最终文本或一组按序的工具调用请求。模型是
//! 不可信调用方：它提出的参数一律经 ToolExecutor 校验与身份注入。

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::core::AgentError;

/// 发给模型的消息角色
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelRole {
    System,
    User,
    Assistant,
}

/// 发给模型的单条消息（由 ContextBuilder 从持久化日志重建）
#[derive(Clone, Debug, PartialEq)]
pub struct ModelMessage {
    pub role: ModelRole,
    pub content: String,
}

impl ModelMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: ModelRole::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: ModelRole::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: ModelRole::Assistant, content: content.into() }
    }
}

/// 模型提出的一次工具调用（原样参数，未经校验）
#[derive(Clone, Debug, PartialEq)]
pub struct ProposedCall {
    pub name: String,
    pub arguments: Value,
}

/// 模型回复：最终文本，或一组按提出顺序排列的工具调用
#[derive(Clone, Debug, PartialEq)]
pub enum ModelReply {
    Text(String),
    ToolCalls(Vec<ProposedCall>),
}

/// 模型调用错误：Transient 由 RetryGovernor 重试，Fatal 立即上抛
#[derive(Error, Debug, Clone)]
pub enum ModelError {
    /// 限流、5xx、网络故障等瞬时错误
    #[error("transient model error: {0}")]
    Transient(String),

    /// 响应格式错误、鉴权失败等不可恢复错误
    #[error("fatal model error: {0}")]
    Fatal(String),
}

impl From<ModelError> for AgentError {
    fn from(e: ModelError) -> Self {
        match e {
            ModelError::Transient(msg) => AgentError::UpstreamTransient(msg),
            ModelError::Fatal(msg) => AgentError::UpstreamFatal(msg),
        }
    }
}

/// 模型客户端 trait：单次补全（tools 为注册表导出的 function-calling schema）
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(
        &self,
        messages: &[ModelMessage],
        tools: &[Value],
    ) -> Result<ModelReply, ModelError>;
}
