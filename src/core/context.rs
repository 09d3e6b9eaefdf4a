//! 模型上下文构建
//!
//! 每轮循环都从存储重建窗口（服务进程不保存任何会话内存状态）：
//! system 提示 + 最近 N 条消息，超窗丢最旧。tool_result 消息渲染为
//! 一对 assistant/user 文本（调用 + 观察），让模型在下一轮读到自己
//! 上一步的结果。

use crate::core::AgentError;
use crate::llm::ModelMessage;
use crate::store::{ConversationStore, MessageBody, Role, ToolRecord};

pub struct ContextBuilder {
    system_prompt: String,
    window: usize,
}

impl ContextBuilder {
    pub fn new(system_prompt: impl Into<String>, window: usize) -> Self {
        Self { system_prompt: system_prompt.into(), window }
    }

    pub fn build(
        &self,
        store: &ConversationStore,
        conversation_id: &str,
    ) -> Result<Vec<ModelMessage>, AgentError> {
        let messages = store.load_messages(conversation_id, Some(self.window))?;

        let mut out = Vec::with_capacity(messages.len() + 1);
        out.push(ModelMessage::system(&self.system_prompt));
        for msg in &messages {
            match (&msg.role, &msg.body) {
                (Role::User, MessageBody::Text { text }) => out.push(ModelMessage::user(text)),
                (Role::Assistant, MessageBody::Text { text }) => {
                    out.push(ModelMessage::assistant(text))
                }
                (Role::ToolResult, MessageBody::Tool { record }) => {
                    out.push(ModelMessage::assistant(render_call(record)));
                    out.push(ModelMessage::user(render_observation(record)));
                }
                // 角色与消息体不匹配时按纯文本兜底
                (_, body) => {
                    out.push(ModelMessage::user(body.as_text().unwrap_or_default()))
                }
            }
        }
        Ok(out)
    }
}

fn render_call(record: &ToolRecord) -> String {
    format!("Tool call: {}({})", record.tool, record.resolved_args)
}

fn render_observation(record: &ToolRecord) -> String {
    let payload = match (&record.result, &record.error) {
        (Some(result), _) => result.to_string(),
        (None, Some(fault)) => serde_json::json!({ "error": fault.message }).to_string(),
        (None, None) => "null".to_string(),
    };
    format!("Observation from {}: {}", record.tool, payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ModelRole;
    use crate::store::{ToolErrorKind, ToolFault};
    use serde_json::json;

    fn store() -> ConversationStore {
        ConversationStore::open_in_memory().unwrap()
    }

    #[test]
    fn renders_system_then_history_with_tool_pairs() {
        let s = store();
        let c = s.create_conversation("u1").unwrap();
        s.append_message(&c.id, Role::User, MessageBody::Text { text: "加个任务".into() })
            .unwrap();
        s.append_message(
            &c.id,
            Role::ToolResult,
            MessageBody::Tool {
                record: ToolRecord {
                    tool: "add_task".into(),
                    raw_args: json!({"title": "t"}),
                    resolved_args: json!({"title": "t"}),
                    result: Some(json!({"task_id": 1, "status": "created"})),
                    error: None,
                },
            },
        )
        .unwrap();
        s.append_message(&c.id, Role::Assistant, MessageBody::Text { text: "已创建".into() })
            .unwrap();

        let ctx = ContextBuilder::new("You are a todo assistant", 20)
            .build(&s, &c.id)
            .unwrap();

        assert_eq!(ctx.len(), 5);
        assert_eq!(ctx[0].role, ModelRole::System);
        assert_eq!(ctx[1], ModelMessage::user("加个任务"));
        assert!(ctx[2].content.starts_with("Tool call: add_task("));
        assert!(ctx[3].content.starts_with("Observation from add_task:"));
        assert!(ctx[3].content.contains("created"));
        assert_eq!(ctx[4], ModelMessage::assistant("已创建"));
    }

    #[test]
    fn failed_tool_calls_render_their_error() {
        let s = store();
        let c = s.create_conversation("u1").unwrap();
        s.append_message(
            &c.id,
            Role::ToolResult,
            MessageBody::Tool {
                record: ToolRecord {
                    tool: "complete_task".into(),
                    raw_args: json!({"task_id": 9}),
                    resolved_args: json!({"task_id": 9}),
                    result: None,
                    error: Some(ToolFault {
                        kind: ToolErrorKind::Domain,
                        message: "Task 9 not found".into(),
                    }),
                },
            },
        )
        .unwrap();

        let ctx = ContextBuilder::new("sys", 20).build(&s, &c.id).unwrap();
        assert!(ctx[2].content.contains("Task 9 not found"));
    }

    #[test]
    fn window_drops_oldest_messages() {
        let s = store();
        let c = s.create_conversation("u1").unwrap();
        for i in 0..6 {
            s.append_message(&c.id, Role::User, MessageBody::Text { text: format!("m{i}") })
                .unwrap();
        }

        let ctx = ContextBuilder::new("sys", 4).build(&s, &c.id).unwrap();
        // system + 最近 4 条
        assert_eq!(ctx.len(), 5);
        assert_eq!(ctx[1].content, "m2");
        assert_eq!(ctx[4].content, "m5");
    }
}
