//! add_task 工具：为当前用户创建任务

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::warn;

use crate::store::TaskStore;
use crate::tools::registry::{ParamSpec, Tool, ToolCallError};

pub const VALID_PRIORITIES: [&str; 3] = ["low", "medium", "high"];
pub const MAX_TITLE_CHARS: usize = 200;

/// 标题校验：去首尾空白，1..=200 字符
pub(crate) fn validate_title(raw: &str) -> Result<String, ToolCallError> {
    let title = raw.trim();
    if title.is_empty() {
        return Err(ToolCallError::Validation("title must not be empty".into()));
    }
    if title.chars().count() > MAX_TITLE_CHARS {
        return Err(ToolCallError::Validation(format!(
            "title must be at most {MAX_TITLE_CHARS} characters"
        )));
    }
    Ok(title.to_string())
}

/// 非法优先级不报错，回退到 medium（模型常拼出 urgent 之类的值）
pub(crate) fn coerce_priority(raw: Option<&str>) -> String {
    match raw {
        None => "medium".to_string(),
        Some(p) if VALID_PRIORITIES.contains(&p) => p.to_string(),
        Some(p) => {
            warn!(priority = %p, "Invalid priority, falling back to medium");
            "medium".to_string()
        }
    }
}

pub struct AddTaskTool {
    store: Arc<TaskStore>,
}

impl AddTaskTool {
    pub fn new(store: Arc<TaskStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for AddTaskTool {
    fn name(&self) -> &str {
        "add_task"
    }

    fn description(&self) -> &str {
        "Create a new todo task for the current user"
    }

    fn parameters(&self) -> Vec<ParamSpec> {
        vec![
            ParamSpec::string("title", "Short task title (1-200 characters)").required(),
            ParamSpec::string("description", "Optional longer description"),
            ParamSpec::string("priority", "One of: low, medium, high (default medium)"),
            ParamSpec::string("due_date", "Optional due date, e.g. 2026-09-15"),
        ]
    }

    async fn call(&self, args: Value, caller_id: &str) -> Result<Value, ToolCallError> {
        let title = validate_title(args["title"].as_str().unwrap_or_default())?;
        let priority = coerce_priority(args["priority"].as_str());
        let task = self.store.create_task(
            caller_id,
            &title,
            args["description"].as_str(),
            &priority,
            args["due_date"].as_str(),
        )?;
        Ok(json!({
            "task_id": task.id,
            "status": "created",
            "title": task.title,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn creates_task_under_caller_identity() {
        let store = Arc::new(TaskStore::open_in_memory().unwrap());
        let tool = AddTaskTool::new(store.clone());

        let result = tool
            .call(json!({"title": "  买牛奶  ", "priority": "high"}), "alice")
            .await
            .unwrap();
        assert_eq!(result["status"], "created");
        assert_eq!(result["title"], "买牛奶");

        let task = store
            .get_task_owned("alice", result["task_id"].as_i64().unwrap())
            .unwrap();
        assert_eq!(task.user_id, "alice");
        assert_eq!(task.priority, "high");
    }

    #[tokio::test]
    async fn empty_and_oversized_titles_are_rejected() {
        let store = Arc::new(TaskStore::open_in_memory().unwrap());
        let tool = AddTaskTool::new(store);

        let err = tool.call(json!({"title": "   "}), "alice").await.unwrap_err();
        assert!(matches!(err, ToolCallError::Validation(_)));

        let long = "x".repeat(201);
        let err = tool.call(json!({"title": long}), "alice").await.unwrap_err();
        assert!(matches!(err, ToolCallError::Validation(_)));
    }

    #[tokio::test]
    async fn invalid_priority_falls_back_to_medium() {
        let store = Arc::new(TaskStore::open_in_memory().unwrap());
        let tool = AddTaskTool::new(store.clone());

        let result = tool
            .call(json!({"title": "t", "priority": "urgent"}), "alice")
            .await
            .unwrap();
        let task = store
            .get_task_owned("alice", result["task_id"].as_i64().unwrap())
            .unwrap();
        assert_eq!(task.priority, "medium");
    }
}
