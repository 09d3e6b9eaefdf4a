//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / parameters / call），
//! 进程启动时一次性注册，运行期只读。describe() 每次调用重建 schema
//! 列表（不跨轮缓存）；register 重名报 DuplicateTool，resolve 未知名
//! 报 UnknownTool。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;

use crate::core::{AgentError, DomainError};
use crate::store::TaskStoreError;

/// 参数类型（schema 与校验共用）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParamKind {
    String,
    Integer,
    Boolean,
}

impl ParamKind {
    fn json_type(&self) -> &'static str {
        match self {
            ParamKind::String => "string",
            ParamKind::Integer => "integer",
            ParamKind::Boolean => "boolean",
        }
    }
}

/// 单个参数声明：注册时定型，ToolExecutor 据此校验模型提出的参数
#[derive(Clone, Debug)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    pub required: bool,
    pub description: &'static str,
}

impl ParamSpec {
    pub fn string(name: &'static str, description: &'static str) -> Self {
        Self { name, kind: ParamKind::String, required: false, description }
    }

    pub fn integer(name: &'static str, description: &'static str) -> Self {
        Self { name, kind: ParamKind::Integer, required: false, description }
    }

    pub fn boolean(name: &'static str, description: &'static str) -> Self {
        Self { name, kind: ParamKind::Boolean, required: false, description }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// 工具处理器失败
///
/// Validation / Domain 折叠进 tool-result 回馈模型（不中断轮次）；
/// Infra 为存储等基础设施故障，向上传播中断轮次。
#[derive(Error, Debug)]
pub enum ToolCallError {
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Infra(AgentError),
}

impl From<TaskStoreError> for ToolCallError {
    fn from(e: TaskStoreError) -> Self {
        match e {
            TaskStoreError::Domain(d) => ToolCallError::Domain(d),
            TaskStoreError::Storage(s) => ToolCallError::Infra(s),
        }
    }
}

/// 注册/查找错误
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Duplicate tool: {0}")]
    DuplicateTool(String),
    #[error("Unknown tool: {0}")]
    UnknownTool(String),
}

/// 工具 trait：名称、描述（供模型理解）、参数声明、异步执行
///
/// caller_id 是服务端鉴权得到的权威身份，由 ToolExecutor 带外注入，
/// 永远不来自模型参数。
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn parameters(&self) -> Vec<ParamSpec>;

    async fn call(&self, args: Value, caller_id: &str) -> Result<Value, ToolCallError>;
}

/// 工具注册表：注册顺序即 describe() 顺序（模型输入可复现）
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) -> Result<(), RegistryError> {
        if self.tools.iter().any(|t| t.name() == tool.name()) {
            return Err(RegistryError::DuplicateTool(tool.name().to_string()));
        }
        self.tools.push(Arc::new(tool));
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Tool>, RegistryError> {
        self.tools
            .iter()
            .find(|t| t.name() == name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownTool(name.to_string()))
    }

    /// 每个工具的 function-calling schema，每次调用重建
    pub fn describe(&self) -> Vec<Value> {
        self.tools
            .iter()
            .map(|tool| {
                let mut properties = serde_json::Map::new();
                let mut required = Vec::new();
                for p in tool.parameters() {
                    properties.insert(
                        p.name.to_string(),
                        json!({ "type": p.kind.json_type(), "description": p.description }),
                    );
                    if p.required {
                        required.push(p.name);
                    }
                }
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name(),
                        "description": tool.description(),
                        "parameters": {
                            "type": "object",
                            "properties": properties,
                            "required": required,
                        }
                    }
                })
            })
            .collect()
    }
}
