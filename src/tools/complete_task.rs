//! complete_task 工具：标记任务完成（前置依赖未完成则拒绝）

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::store::TaskStore;
use crate::tools::registry::{ParamSpec, Tool, ToolCallError};

pub struct CompleteTaskTool {
    store: Arc<TaskStore>,
}

impl CompleteTaskTool {
    pub fn new(store: Arc<TaskStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for CompleteTaskTool {
    fn name(&self) -> &str {
        "complete_task"
    }

    fn description(&self) -> &str {
        "Mark one of the current user's tasks as completed"
    }

    fn parameters(&self) -> Vec<ParamSpec> {
        vec![ParamSpec::integer("task_id", "ID of the task to complete").required()]
    }

    async fn call(&self, args: Value, caller_id: &str) -> Result<Value, ToolCallError> {
        let task_id = args["task_id"]
            .as_i64()
            .ok_or_else(|| ToolCallError::Validation("task_id must be an integer".into()))?;
        let task = self.store.complete_task(caller_id, task_id)?;
        Ok(json!({
            "task_id": task.id,
            "status": "completed",
            "title": task.title,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DomainError;

    #[tokio::test]
    async fn completes_own_task() {
        let store = Arc::new(TaskStore::open_in_memory().unwrap());
        let task = store.create_task("alice", "t", None, "medium", None).unwrap();
        let tool = CompleteTaskTool::new(store.clone());

        let result = tool.call(json!({"task_id": task.id}), "alice").await.unwrap();
        assert_eq!(result["status"], "completed");
        assert!(store.get_task_owned("alice", task.id).unwrap().completed);
    }

    #[tokio::test]
    async fn foreign_task_is_a_domain_error() {
        let store = Arc::new(TaskStore::open_in_memory().unwrap());
        let task = store.create_task("bob", "t", None, "medium", None).unwrap();
        let tool = CompleteTaskTool::new(store);

        let err = tool.call(json!({"task_id": task.id}), "alice").await.unwrap_err();
        assert!(matches!(
            err,
            ToolCallError::Domain(DomainError::NotOwner(_))
        ));
    }
}
