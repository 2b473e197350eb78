//! 外部插件工具：由配置 [[tools.plugins]] 注册，运行「程序 + 参数模板」
//!
//! 参数模板中 {{workspace}} 替换为工作区根路径，{{key}} 从调用参数中取 key；
//! 不经过 shell，直接 exec program + 替换后的参数。注册名为 `<provider>__<name>`。

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;

use crate::config::PluginEntry;
use crate::memory::ToolOutput;
use crate::tools::Tool;

/// 从配置项构建的插件工具
pub struct PluginTool {
    name: String,
    description: String,
    program: String,
    args_template: Vec<String>,
    parameters: Option<Value>,
    workspace: PathBuf,
}

impl PluginTool {
    pub fn new(entry: &PluginEntry, workspace: &Path) -> Self {
        Self {
            name: entry.name.clone(),
            description: entry.description.clone(),
            program: entry.program.clone(),
            args_template: entry.args.clone(),
            parameters: entry.parameters.clone(),
            workspace: workspace.to_path_buf(),
        }
    }

    /// 替换模板中的 {{workspace}} 和 {{key}}
    fn substitute(&self, args: &Value) -> Vec<String> {
        let workspace = self.workspace.to_string_lossy();
        let empty = serde_json::Map::new();
        let obj = args.as_object().unwrap_or(&empty);
        self.args_template
            .iter()
            .map(|tpl| {
                let mut s = tpl.replace("{{workspace}}", &workspace);
                for (k, v) in obj {
                    let placeholder = format!("{{{{{k}}}}}");
                    let val = match v {
                        Value::String(x) => x.clone(),
                        _ => v.to_string(),
                    };
                    s = s.replace(&placeholder, &val);
                }
                s
            })
            .collect()
    }
}

#[async_trait]
impl Tool for PluginTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        self.parameters.clone().unwrap_or_else(|| {
            serde_json::json!({
                "type": "object",
                "properties": {},
                "additionalProperties": true
            })
        })
    }

    // 超时由 ToolExecutor 统一施加；kill_on_drop 保证超时后子进程被回收
    async fn execute(&self, args: Value) -> Result<ToolOutput, String> {
        let argv = self.substitute(&args);
        tracing::info!(tool = %self.name, program = %self.program, "plugin tool invoke");
        let child = Command::new(&self.program)
            .args(&argv)
            .current_dir(&self.workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("plugin spawn failed: {e}"))?;
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| format!("plugin wait failed: {e}"))?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(format!(
                "exit {:?}: stderr {}",
                output.status.code(),
                stderr.trim()
            ));
        }
        Ok(ToolOutput::text(stdout.trim()))
    }
}
