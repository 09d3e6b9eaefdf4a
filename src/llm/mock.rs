//! Mock 模型客户端（测试与无 API Key 场景）
//!
//! 按脚本顺序出队回复；脚本耗尽后返回 default_reply。记录每次收到的
//! 消息窗口，供「无状态重建」类测试断言模型实际看到的上下文。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::llm::{ModelClient, ModelError, ModelMessage, ModelReply};

type Scripted = Result<ModelReply, ModelError>;

/// 脚本化客户端：出队回复并记录请求
pub struct ScriptedModelClient {
    replies: Mutex<VecDeque<Scripted>>,
    default_reply: Scripted,
    requests: Mutex<Vec<Vec<ModelMessage>>>,
}

impl ScriptedModelClient {
    pub fn new(script: Vec<Scripted>) -> Self {
        Self {
            replies: Mutex::new(script.into()),
            default_reply: Ok(ModelReply::Text("(no scripted reply)".to_string())),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// 脚本耗尽后的默认回复（如「永远请求工具」的轮次上限测试）
    pub fn with_default(mut self, reply: Scripted) -> Self {
        self.default_reply = reply;
        self
    }

    /// 已发生的模型调用次数
    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// 最后一次调用收到的消息窗口
    pub fn last_request(&self) -> Option<Vec<ModelMessage>> {
        self.requests.lock().unwrap().last().cloned()
    }
}

impl Default for ScriptedModelClient {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl ModelClient for ScriptedModelClient {
    async fn complete(
        &self,
        messages: &[ModelMessage],
        _tools: &[Value],
    ) -> Result<ModelReply, ModelError> {
        self.requests.lock().unwrap().push(messages.to_vec());
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default_reply.clone())
    }
}
