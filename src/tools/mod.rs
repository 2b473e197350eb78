//! 工具层：注册表、调度器、内置 process 工具与配置驱动的外部插件

pub mod executor;
pub mod plugin;
pub mod process;
pub mod registry;

pub use executor::ToolExecutor;
pub use plugin::PluginTool;
pub use process::{process_args_schema, ProcessTool};
pub use registry::{RegisteredTool, RegistryError, Tool, ToolProvider, ToolRegistry, NAMESPACE_SEPARATOR};
