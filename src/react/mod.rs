//! 认知层：上下文管理、回合引擎、重试与唤醒策略

pub mod context;
pub mod events;
pub mod loop_;
pub mod preamble;
pub mod retry;
pub mod wake;

pub use context::{
    sanitize, truncate_keep_suffix, CompactionReport, ContextConfig, ContextManager, SteadyTrim,
};
pub use events::TurnEvent;
pub use loop_::{TurnEngine, TurnOutcome};
pub use preamble::{PreambleSource, StaticPreamble, DEFAULT_SYSTEM_PROMPT};
pub use retry::RetryPolicy;
pub use wake::{AdaptiveWake, FixedWake, WakePolicy};
