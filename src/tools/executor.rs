//! 工具执行器
//!
//! 编排循环与工具实现之间的安全边界：剥离模型伪造的身份字段、按
//! ParamSpec 校验参数、注入服务端权威 caller_id、施加超时，并把每次
//! 调用的结果折叠成 ToolRecord（校验失败 / 领域拒绝 / 超时都是记录，
//! 不是进程错误；只有基础设施故障向上传播）。

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::core::AgentError;
use crate::store::{ToolErrorKind, ToolFault, ToolRecord};
use crate::tools::registry::{ParamKind, ToolCallError, ToolRegistry};

/// 模型参数里绝不允许出现的身份字段，出现即剥离并告警
const IDENTITY_FIELDS: [&str; 3] = ["user_id", "owner_id", "caller_id"];

/// 审计日志里参数预览的最大长度
const ARGS_PREVIEW_CHARS: usize = 200;

pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    pub fn tool_schemas(&self) -> Vec<Value> {
        self.registry.describe()
    }

    /// 执行一次模型提出的工具调用
    ///
    /// raw_args 是模型原样提出的参数；caller_id 是鉴权层得到的身份。
    /// 返回 Ok(ToolRecord) 表示本次调用有了结论（成功或失败都算），
    /// Err 只在基础设施故障时出现。
    pub async fn execute(
        &self,
        name: &str,
        raw_args: Value,
        caller_id: &str,
    ) -> Result<ToolRecord, AgentError> {
        let start = std::time::Instant::now();

        let tool = match self.registry.resolve(name) {
            Ok(t) => t,
            Err(_) => {
                let record = ToolRecord {
                    tool: name.to_string(),
                    raw_args,
                    resolved_args: Value::Null,
                    result: None,
                    error: Some(ToolFault {
                        kind: ToolErrorKind::Validation,
                        message: format!("unknown tool: {name}"),
                    }),
                };
                self.audit(&record, start.elapsed());
                return Ok(record);
            }
        };

        let resolved = match self.resolve_args(name, &raw_args, tool.parameters()) {
            Ok(v) => v,
            Err(message) => {
                let record = ToolRecord {
                    tool: name.to_string(),
                    raw_args,
                    resolved_args: Value::Null,
                    result: None,
                    error: Some(ToolFault { kind: ToolErrorKind::Validation, message }),
                };
                self.audit(&record, start.elapsed());
                return Ok(record);
            }
        };

        let outcome =
            tokio::time::timeout(self.timeout, tool.call(resolved.clone(), caller_id)).await;

        let record = match outcome {
            Ok(Ok(result)) => ToolRecord {
                tool: name.to_string(),
                raw_args,
                resolved_args: resolved,
                result: Some(result),
                error: None,
            },
            Ok(Err(ToolCallError::Validation(message))) => ToolRecord {
                tool: name.to_string(),
                raw_args,
                resolved_args: resolved,
                result: None,
                error: Some(ToolFault { kind: ToolErrorKind::Validation, message }),
            },
            Ok(Err(ToolCallError::Domain(d))) => ToolRecord {
                tool: name.to_string(),
                raw_args,
                resolved_args: resolved,
                result: None,
                error: Some(ToolFault {
                    kind: ToolErrorKind::Domain,
                    message: d.to_string(),
                }),
            },
            Ok(Err(ToolCallError::Infra(e))) => return Err(e),
            Err(_) => ToolRecord {
                tool: name.to_string(),
                raw_args,
                resolved_args: resolved,
                result: None,
                error: Some(ToolFault {
                    kind: ToolErrorKind::Timeout,
                    message: format!("tool timed out after {:?}", self.timeout),
                }),
            },
        };

        self.audit(&record, start.elapsed());
        Ok(record)
    }

    /// 剥离身份字段 + 按 ParamSpec 校验，产出可执行的参数对象
    fn resolve_args(
        &self,
        tool: &str,
        raw: &Value,
        specs: Vec<crate::tools::registry::ParamSpec>,
    ) -> Result<Value, String> {
        let obj = match raw {
            Value::Object(m) => m.clone(),
            Value::Null => Map::new(),
            other => return Err(format!("arguments must be a JSON object, got: {other}")),
        };

        let mut cleaned = Map::new();
        for (key, value) in obj {
            if IDENTITY_FIELDS.contains(&key.as_str()) {
                warn!(tool, field = %key, "Stripped identity field from model-supplied arguments");
                continue;
            }
            cleaned.insert(key, value);
        }

        for key in cleaned.keys() {
            if !specs.iter().any(|s| s.name == key.as_str()) {
                return Err(format!("unexpected argument: {key}"));
            }
        }

        for spec in &specs {
            match cleaned.get(spec.name) {
                None | Some(Value::Null) => {
                    if spec.required {
                        return Err(format!("missing required argument: {}", spec.name));
                    }
                }
                Some(value) => {
                    let ok = match spec.kind {
                        ParamKind::String => value.is_string(),
                        ParamKind::Integer => value.is_i64() || value.is_u64(),
                        ParamKind::Boolean => value.is_boolean(),
                    };
                    if !ok {
                        return Err(format!(
                            "argument {} must be of type {}",
                            spec.name,
                            match spec.kind {
                                ParamKind::String => "string",
                                ParamKind::Integer => "integer",
                                ParamKind::Boolean => "boolean",
                            }
                        ));
                    }
                }
            }
        }

        Ok(Value::Object(cleaned))
    }

    /// 每次工具调用写一条结构化审计日志
    fn audit(&self, record: &ToolRecord, elapsed: Duration) {
        let mut preview = record.raw_args.to_string();
        if preview.chars().count() > ARGS_PREVIEW_CHARS {
            preview = preview.chars().take(ARGS_PREVIEW_CHARS).collect();
        }
        let outcome = match &record.error {
            None => "ok".to_string(),
            Some(fault) => format!("{:?}: {}", fault.kind, fault.message),
        };
        info!(
            event = "tool_audit",
            tool = %record.tool,
            ok = record.is_ok(),
            outcome = %outcome,
            duration_ms = elapsed.as_millis() as u64,
            args_preview = %preview,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::registry::{ParamSpec, Tool};
    use async_trait::async_trait;
    use serde_json::json;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echoes its arguments back"
        }
        fn parameters(&self) -> Vec<ParamSpec> {
            vec![
                ParamSpec::string("text", "text to echo").required(),
                ParamSpec::integer("times", "repeat count"),
            ]
        }
        async fn call(&self, args: Value, caller_id: &str) -> Result<Value, ToolCallError> {
            Ok(json!({"args": args, "caller": caller_id}))
        }
    }

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "sleeps forever"
        }
        fn parameters(&self) -> Vec<ParamSpec> {
            vec![]
        }
        async fn call(&self, _args: Value, _caller_id: &str) -> Result<Value, ToolCallError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Value::Null)
        }
    }

    fn executor(timeout: Duration) -> ToolExecutor {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool).unwrap();
        reg.register(SlowTool).unwrap();
        ToolExecutor::new(Arc::new(reg), timeout)
    }

    #[tokio::test]
    async fn identity_fields_are_stripped_before_the_tool_sees_arguments() {
        let exec = executor(Duration::from_secs(5));
        let record = exec
            .execute(
                "echo",
                json!({"text": "hi", "user_id": "mallory", "owner_id": "mallory"}),
                "alice",
            )
            .await
            .unwrap();

        assert!(record.is_ok());
        let result = record.result.unwrap();
        assert_eq!(result["caller"], "alice");
        assert_eq!(result["args"], json!({"text": "hi"}));
        assert!(record.resolved_args.get("user_id").is_none());
    }

    #[tokio::test]
    async fn validation_failure_becomes_a_record_not_an_error() {
        let exec = executor(Duration::from_secs(5));

        let record = exec.execute("echo", json!({"times": 2}), "alice").await.unwrap();
        assert!(!record.is_ok());
        let fault = record.error.unwrap();
        assert_eq!(fault.kind, ToolErrorKind::Validation);
        assert!(fault.message.contains("text"));
        assert_eq!(record.resolved_args, Value::Null);

        let record = exec.execute("nope", json!({}), "alice").await.unwrap();
        assert_eq!(record.error.unwrap().kind, ToolErrorKind::Validation);
    }

    #[tokio::test]
    async fn wrong_type_and_unexpected_keys_are_rejected() {
        let exec = executor(Duration::from_secs(5));

        let record = exec.execute("echo", json!({"text": 42}), "alice").await.unwrap();
        assert_eq!(record.error.unwrap().kind, ToolErrorKind::Validation);

        let record = exec
            .execute("echo", json!({"text": "hi", "bogus": 1}), "alice")
            .await
            .unwrap();
        let fault = record.error.unwrap();
        assert_eq!(fault.kind, ToolErrorKind::Validation);
        assert!(fault.message.contains("bogus"));
    }

    #[tokio::test]
    async fn slow_tool_yields_timeout_record() {
        let exec = executor(Duration::from_millis(20));
        let record = exec.execute("slow", json!({}), "alice").await.unwrap();
        assert_eq!(record.error.unwrap().kind, ToolErrorKind::Timeout);
    }
}
