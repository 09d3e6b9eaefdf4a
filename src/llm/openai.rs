//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url），走
//! function calling：注册表的工具 schema 随每次请求下发，模型返回的
//! tool_calls 转为 ProposedCall 交还编排层。错误按可重试性分类：
//! 网络/限流/5xx 为 Transient，其余为 Fatal。

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    ChatCompletionToolChoiceOption, ChatCompletionTools, CreateChatCompletionRequestArgs,
    ToolChoiceOptions,
};
use async_openai::Client;
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::llm::{ModelClient, ModelError, ModelMessage, ModelReply, ModelRole, ProposedCall};

/// OpenAI 兼容客户端：持有 Client 与 model 名
pub struct OpenAiModelClient {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiModelClient {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = if let Some(url) = base_url {
            OpenAIConfig::new().with_api_base(url).with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
        }
    }

    fn to_openai_messages(&self, messages: &[ModelMessage]) -> Vec<ChatCompletionRequestMessage> {
        messages
            .iter()
            .map(|m| match m.role {
                ModelRole::System => ChatCompletionRequestMessage::System(
                    ChatCompletionRequestSystemMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .unwrap(),
                ),
                ModelRole::User => ChatCompletionRequestMessage::User(
                    ChatCompletionRequestUserMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .unwrap(),
                ),
                ModelRole::Assistant => ChatCompletionRequestMessage::Assistant(
                    ChatCompletionRequestAssistantMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .unwrap(),
                ),
            })
            .collect()
    }
}

/// 按可重试性分类 OpenAI 错误：网络层与限流/服务端错误可重试
fn classify(e: OpenAIError) -> ModelError {
    match &e {
        OpenAIError::Reqwest(_) | OpenAIError::StreamError(_) => {
            ModelError::Transient(e.to_string())
        }
        OpenAIError::ApiError(api) => {
            let ty = api.r#type.as_deref().unwrap_or("");
            let code = api.code.as_deref().unwrap_or("");
            if ty.contains("rate_limit")
                || ty.contains("server_error")
                || ty.contains("overloaded")
                || code.contains("rate_limit")
            {
                ModelError::Transient(e.to_string())
            } else {
                ModelError::Fatal(e.to_string())
            }
        }
        _ => ModelError::Fatal(e.to_string()),
    }
}

#[async_trait]
impl ModelClient for OpenAiModelClient {
    async fn complete(
        &self,
        messages: &[ModelMessage],
        tools: &[Value],
    ) -> Result<ModelReply, ModelError> {
        let mut builder = CreateChatCompletionRequestArgs::default();
        builder
            .model(&self.model)
            .messages(self.to_openai_messages(messages));
        if !tools.is_empty() {
            let typed: Vec<ChatCompletionTools> = tools
                .iter()
                .map(|t| serde_json::from_value(t.clone()))
                .collect::<Result<_, _>>()
                .map_err(|e| ModelError::Fatal(format!("bad tool schema: {e}")))?;
            builder
                .tools(typed)
                .tool_choice(ChatCompletionToolChoiceOption::Mode(ToolChoiceOptions::Auto));
        }
        let request = builder.build().map_err(|e| ModelError::Fatal(e.to_string()))?;

        let response = self.client.chat().create(request).await.map_err(classify)?;

        if let Some(usage) = &response.usage {
            debug!(
                model = %self.model,
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "Model usage"
            );
        }

        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ModelError::Fatal("empty completion: no choices".to_string()))?;

        // tool_calls 经 Value 提取，按 OpenAI 线上格式取 function.name/arguments
        if let Some(tool_calls) = &choice.message.tool_calls {
            let raw = serde_json::to_value(tool_calls)
                .map_err(|e| ModelError::Fatal(format!("bad tool_calls payload: {e}")))?;
            let items = raw.as_array().cloned().unwrap_or_default();
            if !items.is_empty() {
                let mut proposed = Vec::with_capacity(items.len());
                for item in items {
                    let name = item["function"]["name"]
                        .as_str()
                        .ok_or_else(|| {
                            ModelError::Fatal("tool call without function name".to_string())
                        })?
                        .to_string();
                    let raw_args = item["function"]["arguments"].as_str().unwrap_or("").to_string();
                    // 参数 JSON 不合法时原样包成字符串，交给 ToolExecutor
                    // 产出 Validation 失败回馈模型纠正
                    let arguments =
                        serde_json::from_str(&raw_args).unwrap_or(Value::String(raw_args));
                    proposed.push(ProposedCall { name, arguments });
                }
                return Ok(ModelReply::ToolCalls(proposed));
            }
        }

        match choice.message.content {
            Some(text) if !text.is_empty() => Ok(ModelReply::Text(text)),
            _ => Err(ModelError::Fatal(
                "empty completion: no content and no tool calls".to_string(),
            )),
        }
    }
}
