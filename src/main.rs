//! taskchat - 对话式待办助手服务
//!
//! 入口：初始化日志、打开存储、注册工具、选择模型后端、起 HTTP 服务。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use taskchat::config::load_config;
use taskchat::core::{ContextBuilder, Orchestrator, RetryGovernor};
use taskchat::llm::{ModelClient, OpenAiModelClient, ScriptedModelClient};
use taskchat::server::{build_router, AppState};
use taskchat::store::{ConversationStore, TaskStore};
use taskchat::tools::{
    AddDependencyTool, AddTaskTool, CompleteTaskTool, DeleteTaskTool, ListTasksTool, ToolExecutor,
    ToolRegistry, UpdateTaskTool,
};

/// 没有 config/prompts/system.md 时的内置系统提示
const DEFAULT_SYSTEM_PROMPT: &str = "\
You are a helpful todo assistant. You manage the current user's tasks through the \
provided tools and never invent task data you have not read from a tool result.\n\
Guidelines:\n\
- Use the tools to create, list, update, complete and delete tasks, and to declare \
dependencies between tasks.\n\
- Before deleting a task, ask the user to confirm unless they already did.\n\
- When a tool reports an error, explain the problem to the user in plain language \
instead of retrying blindly.\n\
- Answer in the user's language and keep answers short.";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 日志：默认 info，可通过 RUST_LOG 覆盖
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .with(fmt::layer())
        .init();

    let cfg = load_config(None).context("Failed to load config")?;
    std::fs::create_dir_all(&cfg.app.data_dir).context("Failed to create data dir")?;

    let conversations = Arc::new(
        ConversationStore::open(cfg.app.data_dir.join("conversations.db"))
            .context("Failed to open conversation store")?,
    );
    let tasks = Arc::new(
        TaskStore::open(cfg.app.data_dir.join("tasks.db"))
            .context("Failed to open task store")?,
    );

    let mut registry = ToolRegistry::new();
    registry.register(AddTaskTool::new(tasks.clone()))?;
    registry.register(ListTasksTool::new(tasks.clone()))?;
    registry.register(UpdateTaskTool::new(tasks.clone()))?;
    registry.register(CompleteTaskTool::new(tasks.clone()))?;
    registry.register(DeleteTaskTool::new(tasks.clone()))?;
    registry.register(AddDependencyTool::new(tasks.clone()))?;
    let executor = Arc::new(ToolExecutor::new(
        Arc::new(registry),
        Duration::from_secs(cfg.tools.tool_timeout_secs),
    ));

    let model: Arc<dyn ModelClient> = if std::env::var("OPENAI_API_KEY").is_ok() {
        tracing::info!("Using OpenAI model ({})", cfg.llm.model);
        Arc::new(OpenAiModelClient::new(
            cfg.llm.base_url.as_deref(),
            &cfg.llm.model,
            std::env::var("OPENAI_API_KEY").ok().as_deref(),
        ))
    } else {
        tracing::warn!("No OPENAI_API_KEY set, using scripted mock model");
        Arc::new(ScriptedModelClient::new(vec![]))
    };

    let system_prompt = std::fs::read_to_string("config/prompts/system.md")
        .unwrap_or_else(|_| DEFAULT_SYSTEM_PROMPT.to_string());

    let orchestrator = Arc::new(Orchestrator::new(
        conversations.clone(),
        executor,
        model,
        RetryGovernor::new(
            cfg.retry.max_attempts,
            Duration::from_millis(cfg.retry.base_delay_ms),
            cfg.retry.jitter,
        ),
        ContextBuilder::new(system_prompt, cfg.app.max_context_messages),
        cfg.app.max_tool_rounds,
        Duration::from_secs(cfg.app.turn_timeout_secs),
    ));

    let state = Arc::new(AppState::new(orchestrator, conversations));
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&cfg.app.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", cfg.app.bind_addr))?;
    tracing::info!("Listening on {}", cfg.app.bind_addr);
    axum::serve(listener, app).await.context("Server exited")?;

    Ok(())
}
