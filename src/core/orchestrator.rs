//! 多轮编排循环
//!
//! 一次聊天轮次：解析/创建会话 -> 持久化用户消息 -> 循环（重建上下文、
//! 调模型、执行工具、持久化 tool-result）直到模型给出文本答复或触达
//! 轮数/时间上限。先持久化、后下发是唯一顺序；原子与流式路径共享同一
//! 条持久化路径，差别只在是否给了事件通道。

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::UnboundedSender;
use tracing::{error, info, warn};

use crate::core::context::ContextBuilder;
use crate::core::error::AgentError;
use crate::core::retry::RetryGovernor;
use crate::core::state::{ToolCallSummary, TurnEvent, TurnOutcome};
use crate::llm::{ModelClient, ModelError, ModelReply};
use crate::store::{Conversation, ConversationStore, MessageBody, Role};
use crate::tools::ToolExecutor;

/// 流式答复按字符切片的片段大小
const FRAGMENT_CHARS: usize = 24;

/// ToolResult 事件里结果预览的最大长度
const RESULT_PREVIEW_CHARS: usize = 120;

pub struct TurnRequest {
    pub user_id: String,
    pub conversation_id: Option<String>,
    pub message: String,
}

pub struct Orchestrator {
    conversations: Arc<ConversationStore>,
    executor: Arc<ToolExecutor>,
    model: Arc<dyn ModelClient>,
    retry: RetryGovernor,
    context: ContextBuilder,
    max_tool_rounds: u32,
    turn_timeout: Duration,
}

impl Orchestrator {
    pub fn new(
        conversations: Arc<ConversationStore>,
        executor: Arc<ToolExecutor>,
        model: Arc<dyn ModelClient>,
        retry: RetryGovernor,
        context: ContextBuilder,
        max_tool_rounds: u32,
        turn_timeout: Duration,
    ) -> Self {
        Self {
            conversations,
            executor,
            model,
            retry,
            context,
            max_tool_rounds,
            turn_timeout,
        }
    }

    pub fn conversations(&self) -> &ConversationStore {
        &self.conversations
    }

    /// 执行一轮对话
    ///
    /// event_tx 为 None 时走原子路径（只返回 TurnOutcome）；为 Some 时
    /// 逐步下发 TurnEvent。接收端断开只是事件发不出去，循环照常跑完，
    /// 持久化不受影响。
    pub async fn run_turn(
        &self,
        req: TurnRequest,
        event_tx: Option<&UnboundedSender<TurnEvent>>,
    ) -> Result<TurnOutcome, AgentError> {
        let conversation = self.resolve_conversation(&req)?;
        let cid = conversation.id.clone();
        emit(event_tx, TurnEvent::Conversation { conversation_id: cid.clone() });

        // 用户消息先落库，之后的任何失败都不丢输入
        self.conversations.append_message(
            &cid,
            Role::User,
            MessageBody::Text { text: req.message.clone() },
        )?;

        let deadline = Instant::now() + self.turn_timeout;
        let mut tool_calls: Vec<ToolCallSummary> = Vec::new();
        let mut round = 0u32;

        loop {
            round += 1;
            if round > self.max_tool_rounds {
                warn!(conversation_id = %cid, round, "Tool round limit reached, degrading");
                let text =
                    "I couldn't finish this request within the allowed number of tool steps. \
                     Here is what was done so far; please ask again to continue.";
                return self.finish(&cid, text, tool_calls, true, event_tx);
            }
            // 剩余预算同时约束本轮模型调用：挂死的上游不能拖垮整轮
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(conversation_id = %cid, round, "Turn deadline exceeded, degrading");
                let text = "This request took too long to process. \
                            The steps completed so far have been saved.";
                return self.finish(&cid, text, tool_calls, true, event_tx);
            }

            let messages = self.context.build(&self.conversations, &cid)?;
            let schemas = self.executor.tool_schemas();

            let reply = match tokio::time::timeout(
                remaining,
                self.retry.call(|| self.model.complete(&messages, &schemas)),
            )
            .await
            {
                Ok(reply) => reply,
                Err(_) => {
                    warn!(conversation_id = %cid, round, "Model call exceeded the turn deadline, degrading");
                    let text = "This request took too long to process. \
                                The steps completed so far have been saved.";
                    return self.finish(&cid, text, tool_calls, true, event_tx);
                }
            };

            let reply = match reply {
                Ok(reply) => reply,
                Err(ModelError::Transient(msg)) => {
                    warn!(conversation_id = %cid, error = %msg, "Model unavailable after retries");
                    let text = "The assistant is temporarily unavailable. \
                                Please try again in a moment.";
                    return self.finish(&cid, text, tool_calls, true, event_tx);
                }
                Err(ModelError::Fatal(msg)) => {
                    error!(conversation_id = %cid, error = %msg, "Fatal model failure");
                    self.conversations.append_message(
                        &cid,
                        Role::Assistant,
                        MessageBody::Text {
                            text: "The assistant failed to answer this request.".into(),
                        },
                    )?;
                    emit(event_tx, TurnEvent::Error { text: msg.clone() });
                    return Err(AgentError::UpstreamFatal(msg));
                }
            };

            match reply {
                ModelReply::Text(text) => {
                    info!(conversation_id = %cid, round, tools = tool_calls.len(), "Turn complete");
                    return self.finish(&cid, &text, tool_calls, false, event_tx);
                }
                ModelReply::ToolCalls(calls) => {
                    for call in calls {
                        emit(
                            event_tx,
                            TurnEvent::ToolCall {
                                tool: call.name.clone(),
                                arguments: call.arguments.clone(),
                            },
                        );
                        let record = match self
                            .executor
                            .execute(&call.name, call.arguments, &req.user_id)
                            .await
                        {
                            Ok(record) => record,
                            Err(e) => {
                                error!(conversation_id = %cid, tool = %call.name, error = %e,
                                       "Tool infrastructure failure");
                                self.conversations.append_message(
                                    &cid,
                                    Role::Assistant,
                                    MessageBody::Text {
                                        text: "The assistant failed to answer this request."
                                            .into(),
                                    },
                                )?;
                                emit(event_tx, TurnEvent::Error { text: e.to_string() });
                                return Err(e);
                            }
                        };

                        tool_calls.push(ToolCallSummary::from(&record));
                        let preview = result_preview(&record);
                        let (tool, ok) = (record.tool.clone(), record.is_ok());
                        self.conversations.append_message(
                            &cid,
                            Role::ToolResult,
                            MessageBody::Tool { record },
                        )?;
                        emit(event_tx, TurnEvent::ToolResult { tool, ok, preview });
                    }
                }
            }
        }
    }

    fn resolve_conversation(&self, req: &TurnRequest) -> Result<Conversation, AgentError> {
        match &req.conversation_id {
            Some(id) => {
                let conv = self
                    .conversations
                    .get_conversation(id)?
                    .ok_or_else(|| AgentError::NotFound(format!("conversation {id}")))?;
                if conv.user_id != req.user_id {
                    return Err(AgentError::Unauthorized(format!(
                        "conversation {id} belongs to another user"
                    )));
                }
                Ok(conv)
            }
            None => self.conversations.create_conversation(&req.user_id),
        }
    }

    /// 持久化最终答复并下发 Fragment/Done 事件
    fn finish(
        &self,
        cid: &str,
        text: &str,
        tool_calls: Vec<ToolCallSummary>,
        degraded: bool,
        event_tx: Option<&UnboundedSender<TurnEvent>>,
    ) -> Result<TurnOutcome, AgentError> {
        self.conversations.append_message(
            cid,
            Role::Assistant,
            MessageBody::Text { text: text.to_string() },
        )?;

        let chars: Vec<char> = text.chars().collect();
        for chunk in chars.chunks(FRAGMENT_CHARS) {
            emit(event_tx, TurnEvent::Fragment { text: chunk.iter().collect() });
        }
        emit(
            event_tx,
            TurnEvent::Done { conversation_id: cid.to_string(), tool_calls: tool_calls.clone() },
        );

        Ok(TurnOutcome {
            conversation_id: cid.to_string(),
            response: text.to_string(),
            tool_calls,
            degraded,
        })
    }
}

fn emit(event_tx: Option<&UnboundedSender<TurnEvent>>, event: TurnEvent) {
    if let Some(tx) = event_tx {
        // 接收端断开（客户端掉线）时静默丢弃，轮次照常完成
        let _ = tx.send(event);
    }
}

fn result_preview(record: &crate::store::ToolRecord) -> String {
    let raw = match (&record.result, &record.error) {
        (Some(result), _) => result.to_string(),
        (None, Some(fault)) => fault.message.clone(),
        (None, None) => String::new(),
    };
    if raw.chars().count() > RESULT_PREVIEW_CHARS {
        raw.chars().take(RESULT_PREVIEW_CHARS).collect()
    } else {
        raw
    }
}
