//! 可观测性：日志初始化
//!
//! 默认 info 级别，可通过 RUST_LOG 覆盖（如 `RUST_LOG=concierge=debug`）。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // 测试或多次调用时可能已有全局 subscriber，忽略即可
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}
