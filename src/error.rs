//! 错误类型定义
//!
//! 汇总各个子 crate 的错误，作为门面 crate 的统一错误类型。

use std::io;

/// Nimbus 统一错误枚举
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// 核心错误
    #[cfg(feature = "server")]
    #[error(transparent)]
    Core(#[from] nimbus_core::NimbusError),

    /// 客户端错误
    #[cfg(feature = "client")]
    #[error(transparent)]
    Client(#[from] nimbus_client::ClientError),

    /// 配置错误
    #[cfg(feature = "server")]
    #[error(transparent)]
    Config(#[from] nimbus_config::ConfigError),

    /// IO 错误
    #[error(transparent)]
    Io(#[from] io::Error),

    /// 自定义错误
    #[error("{0}")]
    Custom(String),
}

/// Nimbus 统一 Result 类型
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Custom("测试错误".to_string());
        assert_eq!(err.to_string(), "测试错误");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "文件未找到");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[cfg(feature = "server")]
    #[test]
    fn test_error_from_core() {
        let err: Error = nimbus_core::NimbusError::timeout().into();
        assert!(matches!(err, Error::Core(_)));
        assert_eq!(err.to_string(), nimbus_core::NimbusError::timeout().to_string());
    }
}
