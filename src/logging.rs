//! 日志初始化

use crate::error::{Error, Result};
use tracing_subscriber::EnvFilter;

/// 安装全局 `tracing` 订阅者
///
/// 设置了 `RUST_LOG` 时优先使用环境变量，否则使用 `filter`（如 `"info,nimbus_network=debug"`）。
/// 重复调用返回错误。
pub fn init_tracing(filter: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter))
        .map_err(|e| Error::Custom(format!("无效的日志过滤器 {}: {}", filter, e)))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .try_init()
        .map_err(|e| Error::Custom(format!("初始化日志失败: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice() {
        // 其他测试可能已经装过订阅者，这里只保证第二次一定失败
        let _ = init_tracing("warn");
        assert!(init_tracing("warn").is_err());
    }
}
