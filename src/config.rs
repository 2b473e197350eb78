//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__LLM__PROVIDER=mock`）。

use std::path::PathBuf;

use serde::Deserialize;
use serde_json::Value;

use crate::react::ContextConfig;

/// 显式配置文件路径的环境变量
pub const CONFIG_PATH_ENV: &str = "HIVE_CONFIG";

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub engine: EngineSection,
    pub context: ContextSection,
    pub process: ProcessSection,
    pub tools: ToolsSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 智能体标识，决定 Transcript 文件名
    pub agent_id: String,
    /// 持久化根目录（transcripts/、进程会话状态）
    pub data_dir: PathBuf,
    /// 工作区根目录，未设置时用当前目录
    pub workspace_root: Option<PathBuf>,
    /// system prompt 文件；未设置时使用内置 prompt
    pub system_prompt_path: Option<PathBuf>,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            agent_id: "default".to_string(),
            data_dir: PathBuf::from("data"),
            workspace_root: None,
            system_prompt_path: None,
        }
    }
}

impl AppSection {
    pub fn workspace(&self) -> PathBuf {
        self.workspace_root
            .clone()
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn transcript_dir(&self) -> PathBuf {
        self.data_dir.join("transcripts")
    }
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// openai（任意兼容端点）/ mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    /// 读取 API Key 的环境变量名
    pub api_key_env: String,
    pub request_timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o".to_string(),
            base_url: None,
            api_key_env: "OPENAI_API_KEY".to_string(),
            request_timeout_secs: 60,
        }
    }
}

/// [engine] 段：重试、唤醒节奏、工具超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub max_retries: u32,
    /// 指数退避基数（秒），第 n 次失败后等待 base * 2^n
    pub retry_base_secs: u64,
    pub wake_interval_secs: u64,
    /// 空闲时唤醒间隔的上限
    pub max_idle_interval_secs: u64,
    pub tool_timeout_secs: u64,
    /// 启动时从存储恢复的消息数；未设置时等于 context.max_messages
    pub history_load_limit: Option<usize>,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_secs: 1,
            wake_interval_secs: 60,
            max_idle_interval_secs: 900,
            tool_timeout_secs: 900,
            history_load_limit: None,
        }
    }
}

/// [context] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContextSection {
    pub max_messages: usize,
    pub max_message_chars: usize,
    pub max_total_chars: usize,
    pub min_window: usize,
    pub knowledge_hint: String,
}

impl Default for ContextSection {
    fn default() -> Self {
        let c = ContextConfig::default();
        Self {
            max_messages: c.max_messages,
            max_message_chars: c.max_message_chars,
            max_total_chars: c.max_total_chars,
            min_window: c.min_window,
            knowledge_hint: c.knowledge_hint,
        }
    }
}

impl From<&ContextSection> for ContextConfig {
    fn from(s: &ContextSection) -> Self {
        ContextConfig {
            max_messages: s.max_messages,
            max_message_chars: s.max_message_chars,
            max_total_chars: s.max_total_chars,
            min_window: s.min_window,
            knowledge_hint: s.knowledge_hint.clone(),
        }
    }
}

/// [process] 段：进程会话
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProcessSection {
    /// 每个流在内存中保留的最大字符数
    pub max_output_chars: usize,
    /// SIGTERM 到 SIGKILL 的宽限期（秒）
    pub grace_secs: u64,
    pub default_timeout_secs: u64,
    /// 写入状态文件时每个流保留的字符数
    pub persisted_output_chars: usize,
    /// 状态文件；未设置时为 <data_dir>/process_sessions.json
    pub state_file: Option<PathBuf>,
    pub shell: String,
}

impl Default for ProcessSection {
    fn default() -> Self {
        Self {
            max_output_chars: 100_000,
            grace_secs: 5,
            default_timeout_secs: 300,
            persisted_output_chars: 10_000,
            state_file: None,
            shell: "sh".to_string(),
        }
    }
}

/// [tools] 段
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ToolsSection {
    pub plugins: Vec<PluginEntry>,
}

/// [[tools.plugins]] 条目：程序 + 参数模板
#[derive(Debug, Clone, Deserialize)]
pub struct PluginEntry {
    pub name: String,
    pub description: String,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// 命名空间；未设置时为 "plugin"
    #[serde(default)]
    pub provider: Option<String>,
    /// 参数 JSON Schema
    #[serde(default)]
    pub parameters: Option<Value>,
}

impl PluginEntry {
    pub fn provider(&self) -> &str {
        self.provider.as_deref().unwrap_or("plugin")
    }
}

impl AppConfig {
    pub fn context_config(&self) -> ContextConfig {
        ContextConfig::from(&self.context)
    }

    pub fn history_load_limit(&self) -> usize {
        self.engine
            .history_load_limit
            .unwrap_or(self.context.max_messages)
    }

    pub fn process_state_file(&self) -> PathBuf {
        self.process
            .state_file
            .clone()
            .unwrap_or_else(|| self.app.data_dir.join("process_sessions.json"))
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{name}.toml");
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    let config_path = config_path.or_else(|| std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from));
    if let Some(path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}
