//! list_tasks 工具：按状态列出当前用户的任务

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::store::{TaskFilter, TaskStore};
use crate::tools::registry::{ParamSpec, Tool, ToolCallError};

pub struct ListTasksTool {
    store: Arc<TaskStore>,
}

impl ListTasksTool {
    pub fn new(store: Arc<TaskStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for ListTasksTool {
    fn name(&self) -> &str {
        "list_tasks"
    }

    fn description(&self) -> &str {
        "List the current user's tasks, optionally filtered by status"
    }

    fn parameters(&self) -> Vec<ParamSpec> {
        vec![ParamSpec::string(
            "status",
            "One of: all, pending, completed (default all)",
        )]
    }

    async fn call(&self, args: Value, caller_id: &str) -> Result<Value, ToolCallError> {
        let status = args["status"].as_str().unwrap_or("all");
        let filter = TaskFilter::parse(status).ok_or_else(|| {
            ToolCallError::Validation(format!(
                "status must be one of all/pending/completed, got: {status}"
            ))
        })?;

        let tasks = self.store.list_tasks(caller_id, filter)?;
        let items: Vec<Value> = tasks
            .iter()
            .map(|t| {
                json!({
                    "id": t.id,
                    "title": t.title,
                    "description": t.description,
                    "completed": t.completed,
                    "priority": t.priority,
                    "due_date": t.due_date,
                })
            })
            .collect();

        Ok(json!({
            "count": items.len(),
            "status": status,
            "tasks": items,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lists_only_caller_tasks_with_filter() {
        let store = Arc::new(TaskStore::open_in_memory().unwrap());
        let a = store.create_task("alice", "a1", None, "medium", None).unwrap();
        store.create_task("alice", "a2", None, "medium", None).unwrap();
        store.create_task("bob", "b1", None, "medium", None).unwrap();
        store.complete_task("alice", a.id).unwrap();

        let tool = ListTasksTool::new(store);
        let all = tool.call(json!({}), "alice").await.unwrap();
        assert_eq!(all["count"], 2);

        let pending = tool.call(json!({"status": "pending"}), "alice").await.unwrap();
        assert_eq!(pending["count"], 1);
        assert_eq!(pending["tasks"][0]["title"], "a2");
    }

    #[tokio::test]
    async fn unknown_status_is_a_validation_error() {
        let store = Arc::new(TaskStore::open_in_memory().unwrap());
        let tool = ListTasksTool::new(store);
        let err = tool.call(json!({"status": "done"}), "alice").await.unwrap_err();
        assert!(matches!(err, ToolCallError::Validation(_)));
    }
}
