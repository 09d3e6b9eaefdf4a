//! delete_task 工具：删除任务（系统提示约定模型须先向用户确认）

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::store::TaskStore;
use crate::tools::registry::{ParamSpec, Tool, ToolCallError};

pub struct DeleteTaskTool {
    store: Arc<TaskStore>,
}

impl DeleteTaskTool {
    pub fn new(store: Arc<TaskStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for DeleteTaskTool {
    fn name(&self) -> &str {
        "delete_task"
    }

    fn description(&self) -> &str {
        "Delete one of the current user's tasks. Ask the user to confirm before calling this."
    }

    fn parameters(&self) -> Vec<ParamSpec> {
        vec![ParamSpec::integer("task_id", "ID of the task to delete").required()]
    }

    async fn call(&self, args: Value, caller_id: &str) -> Result<Value, ToolCallError> {
        let task_id = args["task_id"]
            .as_i64()
            .ok_or_else(|| ToolCallError::Validation("task_id must be an integer".into()))?;
        let task = self.store.delete_task(caller_id, task_id)?;
        Ok(json!({
            "task_id": task.id,
            "status": "deleted",
            "title": task.title,
        }))
    }
}
