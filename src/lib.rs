//! taskchat - 对话式待办助手
//!
//! 无状态 HTTP 服务：用户一句话进来，服务端把鉴权身份、会话历史与
//! 工具 schema 组装成模型请求，多轮往返直到模型给出文本答复。模型是
//! 不可信调用方，身份永远由服务端注入；所有消息与工具结果先落库再
//! 下发。
//!
//! 模块总览：
//! - `config`：TOML + 环境变量配置
//! - `core`：错误体系、重试、上下文构建、多轮编排循环
//! - `llm`：模型客户端抽象（OpenAI 兼容 / 脚本化 Mock）
//! - `server`：axum HTTP 层（原子与 ndjson 流式聊天端点）
//! - `store`：sqlite 持久化（会话/消息、任务/依赖图）
//! - `tools`：工具注册表、执行器与六个任务工具

pub mod config;
pub mod core;
pub mod llm;
pub mod server;
pub mod store;
pub mod tools;
