//! add_task_dependency 工具：声明任务间的前置关系（禁止成环）

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::store::TaskStore;
use crate::tools::registry::{ParamSpec, Tool, ToolCallError};

pub struct AddDependencyTool {
    store: Arc<TaskStore>,
}

impl AddDependencyTool {
    pub fn new(store: Arc<TaskStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for AddDependencyTool {
    fn name(&self) -> &str {
        "add_task_dependency"
    }

    fn description(&self) -> &str {
        "Declare that one task depends on another. The dependent task cannot be completed until its prerequisite is done."
    }

    fn parameters(&self) -> Vec<ParamSpec> {
        vec![
            ParamSpec::integer("task_id", "ID of the dependent task").required(),
            ParamSpec::integer("depends_on_task_id", "ID of the prerequisite task").required(),
        ]
    }

    async fn call(&self, args: Value, caller_id: &str) -> Result<Value, ToolCallError> {
        let task_id = args["task_id"]
            .as_i64()
            .ok_or_else(|| ToolCallError::Validation("task_id must be an integer".into()))?;
        let depends_on = args["depends_on_task_id"].as_i64().ok_or_else(|| {
            ToolCallError::Validation("depends_on_task_id must be an integer".into())
        })?;

        self.store.add_dependency(caller_id, task_id, depends_on)?;
        Ok(json!({
            "task_id": task_id,
            "depends_on_task_id": depends_on,
            "status": "dependency_added",
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DomainError;

    #[tokio::test]
    async fn adds_edge_and_rejects_the_closing_cycle() {
        let store = Arc::new(TaskStore::open_in_memory().unwrap());
        let a = store.create_task("alice", "a", None, "medium", None).unwrap();
        let b = store.create_task("alice", "b", None, "medium", None).unwrap();
        let tool = AddDependencyTool::new(store.clone());

        let result = tool
            .call(json!({"task_id": a.id, "depends_on_task_id": b.id}), "alice")
            .await
            .unwrap();
        assert_eq!(result["status"], "dependency_added");

        let err = tool
            .call(json!({"task_id": b.id, "depends_on_task_id": a.id}), "alice")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ToolCallError::Domain(DomainError::CircularDependency { .. })
        ));
    }
}
