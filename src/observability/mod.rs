//! 可观测性：tracing 订阅器初始化
//!
//! 默认 `info`，可通过 RUST_LOG 覆盖。工具审计日志（`tool_audit`）以 JSON 字段输出在 info 级别。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 安装全局订阅器；重复调用（如测试中）静默忽略
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .try_init();
}
