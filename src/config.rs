//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `TASKCHAT__*` 覆盖（双下划线
//! 表示嵌套，如 `TASKCHAT__LLM__MODEL=gpt-4o`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub tools: ToolsSection,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app: AppSection::default(),
            llm: LlmSection::default(),
            retry: RetrySection::default(),
            tools: ToolsSection::default(),
        }
    }
}

/// [app] 段：监听地址、数据目录、轮次上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// sqlite 数据目录，未设置时用 ./data
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// 模型窗口的历史消息条数上限
    #[serde(default = "default_max_context_messages")]
    pub max_context_messages: usize,
    /// 单轮最多几次模型往返（工具轮）
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: u32,
    /// 整轮墙钟上限（秒），超过给兜底答复
    #[serde(default = "default_turn_timeout_secs")]
    pub turn_timeout_secs: u64,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            data_dir: default_data_dir(),
            bind_addr: default_bind_addr(),
            max_context_messages: default_max_context_messages(),
            max_tool_rounds: default_max_tool_rounds(),
            turn_timeout_secs: default_turn_timeout_secs(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_bind_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_max_context_messages() -> usize {
    20
}

fn default_max_tool_rounds() -> u32 {
    5
}

fn default_turn_timeout_secs() -> u64 {
    120
}

/// [llm] 段：后端选择
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

/// [retry] 段：模型调用重试
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_jitter() -> bool {
    true
}

/// [tools] 段：单次工具调用超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self { tool_timeout_secs: default_tool_timeout_secs() }
    }
}

fn default_tool_timeout_secs() -> u64 {
    30
}

/// 从 config 目录加载配置，环境变量 TASKCHAT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 TASKCHAT__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("TASKCHAT")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible_without_any_file() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.app.max_context_messages, 20);
        assert_eq!(cfg.app.max_tool_rounds, 5);
        assert_eq!(cfg.retry.max_attempts, 3);
        assert!(cfg.retry.jitter);
        assert_eq!(cfg.tools.tool_timeout_secs, 30);
        assert_eq!(cfg.llm.model, "gpt-4o-mini");
    }
}
