//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / parameters_schema / execute），
//! 启动时每个名字只登记一次并标注来源（内置 / 外部 provider）；外部工具名带 `<provider>__` 前缀避免冲突。
//! 调度是一次 map 查找，不依赖名字里的分隔符做运行时判断。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::llm::ToolSpec;
use crate::memory::ToolOutput;

/// 外部工具名的命名空间分隔符
pub const NAMESPACE_SEPARATOR: &str = "__";

/// 工具 trait
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（对外部工具是未加前缀的原名）
    fn name(&self) -> &str;

    /// 工具描述（供推理后端理解功能）
    fn description(&self) -> &str;

    /// 参数 JSON Schema
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 执行工具；Err 中的文本会原样成为工具结果
    async fn execute(&self, args: Value) -> Result<ToolOutput, String>;
}

/// 工具来源
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolProvider {
    Builtin,
    External { provider: String },
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Tool '{0}' is already registered")]
    Duplicate(String),
}

/// 已登记的工具
#[derive(Clone)]
pub struct RegisteredTool {
    pub provider: ToolProvider,
    pub tool: Arc<dyn Tool>,
}

/// 工具注册表：名称 -> (来源, 工具)
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(
        &mut self,
        name: String,
        provider: ToolProvider,
        tool: Arc<dyn Tool>,
    ) -> Result<(), RegistryError> {
        if self.tools.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }
        tracing::debug!(tool = %name, provider = ?provider, "tool registered");
        self.tools.insert(name, RegisteredTool { provider, tool });
        Ok(())
    }

    /// 登记内置工具
    pub fn register(&mut self, tool: impl Tool + 'static) -> Result<(), RegistryError> {
        let name = tool.name().to_string();
        self.insert(name, ToolProvider::Builtin, Arc::new(tool))
    }

    /// 登记外部 provider 的工具，名称为 `<provider>__<name>`
    pub fn register_external(
        &mut self,
        provider: &str,
        tool: Arc<dyn Tool>,
    ) -> Result<String, RegistryError> {
        let name = format!("{provider}{NAMESPACE_SEPARATOR}{}", tool.name());
        self.insert(
            name.clone(),
            ToolProvider::External {
                provider: provider.to_string(),
            },
            tool,
        )?;
        Ok(name)
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredTool> {
        self.tools.get(name)
    }

    /// 已登记的名称（排序）
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// 工具目录（按名称排序，保证请求稳定）
    pub fn catalogue(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self
            .tools
            .iter()
            .map(|(name, entry)| ToolSpec {
                name: name.clone(),
                description: entry.tool.description().to_string(),
                parameters: entry.tool.parameters_schema(),
            })
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
