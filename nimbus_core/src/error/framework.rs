//! Nimbus 引擎核心错误类型
//!
//! 定义所有引擎级别的错误类型。

use super::context::ErrorContext;
use crate::marshal::MarshalError;
use crate::pool::PoolError;
use nimbus_config::ConfigError;
use std::io;
use thiserror::Error;

/// Nimbus 引擎核心错误类型
#[derive(Error, Debug)]
pub enum NimbusError {
    /// IO 错误
    #[error("IO 错误: {0}")]
    Io(#[from] io::Error),

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),

    /// 网络错误
    #[error("网络错误: {0}")]
    Network(String),

    /// 协议错误
    #[error("协议错误: {0}")]
    Protocol(String),

    /// 编解码错误
    #[error("编解码错误: {0}")]
    Marshal(#[from] MarshalError),

    /// 会话错误
    #[error("会话错误: {0}")]
    Session(String),

    /// RPC 错误
    #[error("RPC 错误: {0}")]
    Rpc(String),

    /// 超时错误
    #[error("操作超时")]
    Timeout,

    /// 容量不足（对象池耗尽、队列已满）
    #[error("容量不足: {0}")]
    Capacity(String),

    /// 验证错误
    #[error("验证失败: {0}")]
    Validation(String),

    /// 带上下文的错误
    #[error("{0} ({1})")]
    WithContext(#[source] Box<NimbusError>, ErrorContext),
}

impl NimbusError {
    /// 获取错误类型
    pub fn kind(&self) -> NimbusErrorKind {
        match self {
            NimbusError::Io(_) => NimbusErrorKind::Io,
            NimbusError::Config(_) => NimbusErrorKind::Config,
            NimbusError::Network(_) => NimbusErrorKind::Network,
            NimbusError::Protocol(_) => NimbusErrorKind::Protocol,
            NimbusError::Marshal(_) => NimbusErrorKind::Marshal,
            NimbusError::Session(_) => NimbusErrorKind::Session,
            NimbusError::Rpc(_) => NimbusErrorKind::Rpc,
            NimbusError::Timeout => NimbusErrorKind::Timeout,
            NimbusError::Capacity(_) => NimbusErrorKind::Capacity,
            NimbusError::Validation(_) => NimbusErrorKind::Validation,
            NimbusError::WithContext(inner, _) => inner.kind(),
        }
    }

    /// 添加上下文信息
    pub fn with_context<C>(self, context: C) -> Self
    where
        C: Into<ErrorContext>,
    {
        NimbusError::WithContext(Box::new(self), context.into())
    }

    /// 创建配置错误
    pub fn config(msg: impl Into<String>) -> Self {
        NimbusError::Config(msg.into())
    }

    /// 创建网络错误
    pub fn network(msg: impl Into<String>) -> Self {
        NimbusError::Network(msg.into())
    }

    /// 创建协议错误
    pub fn protocol(msg: impl Into<String>) -> Self {
        NimbusError::Protocol(msg.into())
    }

    /// 创建会话错误
    pub fn session(msg: impl Into<String>) -> Self {
        NimbusError::Session(msg.into())
    }

    /// 创建 RPC 错误
    pub fn rpc(msg: impl Into<String>) -> Self {
        NimbusError::Rpc(msg.into())
    }

    /// 创建超时错误
    pub fn timeout() -> Self {
        NimbusError::Timeout
    }

    /// 创建容量错误
    pub fn capacity(msg: impl Into<String>) -> Self {
        NimbusError::Capacity(msg.into())
    }

    /// 创建验证错误
    pub fn validation(msg: impl Into<String>) -> Self {
        NimbusError::Validation(msg.into())
    }
}

impl From<ConfigError> for NimbusError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Io(e) => NimbusError::Io(e),
            ConfigError::Validation(msg) => NimbusError::Validation(msg),
            other => NimbusError::Config(other.to_string()),
        }
    }
}

impl From<PoolError> for NimbusError {
    fn from(err: PoolError) -> Self {
        NimbusError::Capacity(err.to_string())
    }
}

/// 错误类型分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NimbusErrorKind {
    /// IO 错误
    Io,
    /// 配置错误
    Config,
    /// 网络错误
    Network,
    /// 协议错误
    Protocol,
    /// 编解码错误
    Marshal,
    /// 会话错误
    Session,
    /// RPC 错误
    Rpc,
    /// 超时错误
    Timeout,
    /// 容量不足
    Capacity,
    /// 验证错误
    Validation,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = NimbusError::config("test error");
        assert!(matches!(err, NimbusError::Config(_)));
        assert_eq!(err.kind(), NimbusErrorKind::Config);
    }

    #[test]
    fn test_error_with_context_keeps_kind() {
        let err = NimbusError::network("connection refused")
            .with_context(("peer_address", "127.0.0.1:8888"));
        assert!(matches!(err, NimbusError::WithContext(_, _)));
        assert_eq!(err.kind(), NimbusErrorKind::Network);
        assert!(err.to_string().contains("peer_address: 127.0.0.1:8888"));
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(NimbusError::config("").kind(), NimbusErrorKind::Config);
        assert_eq!(NimbusError::rpc("").kind(), NimbusErrorKind::Rpc);
        assert_eq!(NimbusError::timeout().kind(), NimbusErrorKind::Timeout);
    }

    #[test]
    fn test_from_config_error() {
        let err: NimbusError = ConfigError::Validation("bad".to_string()).into();
        assert_eq!(err.kind(), NimbusErrorKind::Validation);

        let err: NimbusError = ConfigError::MissingManager("gate".to_string()).into();
        assert_eq!(err.kind(), NimbusErrorKind::Config);
    }

    #[test]
    fn test_from_marshal_error() {
        let err: NimbusError = MarshalError::NotEnoughData.into();
        assert_eq!(err.kind(), NimbusErrorKind::Marshal);
    }
}
