//! update_task 工具：按给定字段局部更新任务

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::store::{TaskPatch, TaskStore};
use crate::tools::add_task::{coerce_priority, validate_title};
use crate::tools::registry::{ParamSpec, Tool, ToolCallError};

pub struct UpdateTaskTool {
    store: Arc<TaskStore>,
}

impl UpdateTaskTool {
    pub fn new(store: Arc<TaskStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for UpdateTaskTool {
    fn name(&self) -> &str {
        "update_task"
    }

    fn description(&self) -> &str {
        "Update fields of one of the current user's tasks. Only provided fields change."
    }

    fn parameters(&self) -> Vec<ParamSpec> {
        vec![
            ParamSpec::integer("task_id", "ID of the task to update").required(),
            ParamSpec::string("title", "New title (1-200 characters)"),
            ParamSpec::string("description", "New description"),
            ParamSpec::string("priority", "One of: low, medium, high"),
            ParamSpec::string("due_date", "New due date, e.g. 2026-09-15"),
        ]
    }

    async fn call(&self, args: Value, caller_id: &str) -> Result<Value, ToolCallError> {
        let task_id = args["task_id"]
            .as_i64()
            .ok_or_else(|| ToolCallError::Validation("task_id must be an integer".into()))?;

        let patch = TaskPatch {
            title: match args["title"].as_str() {
                Some(t) => Some(validate_title(t)?),
                None => None,
            },
            description: args["description"].as_str().map(str::to_string),
            priority: args["priority"].as_str().map(|p| coerce_priority(Some(p))),
            due_date: args["due_date"].as_str().map(str::to_string),
        };
        if patch.is_empty() {
            return Err(ToolCallError::Validation(
                "at least one field to update must be provided".into(),
            ));
        }

        let task = self.store.update_task(caller_id, task_id, patch)?;
        Ok(json!({
            "task_id": task.id,
            "status": "updated",
            "title": task.title,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn updates_only_the_given_fields() {
        let store = Arc::new(TaskStore::open_in_memory().unwrap());
        let task = store
            .create_task("alice", "t", Some("desc"), "low", None)
            .unwrap();
        let tool = UpdateTaskTool::new(store.clone());

        tool.call(json!({"task_id": task.id, "priority": "high"}), "alice")
            .await
            .unwrap();

        let after = store.get_task_owned("alice", task.id).unwrap();
        assert_eq!(after.priority, "high");
        assert_eq!(after.title, "t");
        assert_eq!(after.description.as_deref(), Some("desc"));
    }

    #[tokio::test]
    async fn empty_patch_is_rejected() {
        let store = Arc::new(TaskStore::open_in_memory().unwrap());
        let task = store.create_task("alice", "t", None, "medium", None).unwrap();
        let tool = UpdateTaskTool::new(store);

        let err = tool.call(json!({"task_id": task.id}), "alice").await.unwrap_err();
        assert!(matches!(err, ToolCallError::Validation(_)));
    }
}
