//! 工具层：注册表、执行器与六个任务工具

pub mod add_dependency;
pub mod add_task;
pub mod complete_task;
pub mod delete_task;
pub mod executor;
pub mod list_tasks;
pub mod registry;
pub mod update_task;

pub use add_dependency::AddDependencyTool;
pub use add_task::AddTaskTool;
pub use complete_task::CompleteTaskTool;
pub use delete_task::DeleteTaskTool;
pub use executor::ToolExecutor;
pub use list_tasks::ListTasksTool;
pub use registry::{ParamKind, ParamSpec, RegistryError, Tool, ToolCallError, ToolRegistry};
pub use update_task::UpdateTaskTool;
