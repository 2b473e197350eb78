//! 可观测性：tracing 日志初始化
//!
//! 默认 info，可通过 RUST_LOG 覆盖；工具审计日志以 `audit` 字段输出单行 JSON。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // 测试或嵌入场景下可能已有全局 subscriber
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}
