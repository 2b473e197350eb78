//! Hive - 自主运行的 Rust 智能体
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型、优雅关闭、主控循环（AgentRuntime）
//! - **llm**: 推理后端抽象与实现（OpenAI 兼容 / Mock）
//! - **memory**: 消息模型、对话记录与 JSONL 持久化
//! - **observability**: 日志初始化
//! - **process**: 进程会话管理（后台命令、输出缓冲、取消与升级、崩溃恢复）
//! - **react**: 上下文管理、回合引擎、重试与唤醒策略
//! - **tools**: 工具注册表、执行器、process 工具与外部插件

pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod process;
pub mod react;
pub mod tools;

pub use crate::core::{AgentError, AgentRuntime};
