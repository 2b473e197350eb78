//! 核心编排层：错误类型、优雅关闭、主控循环

pub mod error;
pub mod orchestrator;
pub mod shutdown;

pub use error::AgentError;
pub use orchestrator::{build_registry, create_llm_from_config, AgentRuntime};
pub use shutdown::{
    ProcessSessionCleanup, ShutdownCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason,
};
