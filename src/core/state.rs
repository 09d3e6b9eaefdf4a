//! 轮次结果与流式事件类型

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::ToolRecord;

/// 单次工具调用的对外摘要（进入 ChatResponse / Done 事件）
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ToolCallSummary {
    pub tool: String,
    pub arguments: Value,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&ToolRecord> for ToolCallSummary {
    fn from(r: &ToolRecord) -> Self {
        Self {
            tool: r.tool.clone(),
            arguments: r.raw_args.clone(),
            ok: r.is_ok(),
            result: r.result.clone(),
            error: r.error.as_ref().map(|f| f.message.clone()),
        }
    }
}

/// 一轮对话的最终结果；degraded 表示答复是兜底文案而非模型原话
#[derive(Clone, Debug, Serialize)]
pub struct TurnOutcome {
    pub conversation_id: String,
    pub response: String,
    pub tool_calls: Vec<ToolCallSummary>,
    pub degraded: bool,
}

/// 流式端点逐行下发的事件（ndjson，一行一个）
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    Conversation { conversation_id: String },
    ToolCall { tool: String, arguments: Value },
    ToolResult { tool: String, ok: bool, preview: String },
    Fragment { text: String },
    Done { conversation_id: String, tool_calls: Vec<ToolCallSummary> },
    Error { text: String },
}
