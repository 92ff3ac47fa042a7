//! 序列化模块
//!
//! 字节缓冲区、带事务游标的序列化流，以及紧凑整数编码。

pub mod impls;
pub mod octets;
pub mod stream;
pub mod varint;

pub use octets::{Octets, frob_size};
pub use stream::{OctetsStream, SHRINK_THRESHOLD, Transaction};
pub use varint::{MAX_VARINT_LEN, compact_size, decode_varint, encode_varint};

use thiserror::Error;

/// 序列化错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MarshalError {
    /// 数据不足
    #[error("数据不足")]
    NotEnoughData,

    /// varint 超过 10 字节或溢出 u64
    #[error("varint 溢出")]
    VarintOverflow,

    /// 解出的值超出目标类型范围
    #[error("{ty} 超出范围: {value}")]
    ValueOutOfRange {
        /// 目标类型
        ty: &'static str,
        /// 解出的值
        value: u64,
    },

    /// 事务回滚位置越界
    #[error("回滚位置 {transpos} 越界 (长度 {len})")]
    InvalidRollback {
        /// 事务起点
        transpos: usize,
        /// 当前数据长度
        len: usize,
    },

    /// 字符串不是合法 UTF-8
    #[error("非法 UTF-8 字符串")]
    InvalidUtf8,

    /// 长度前缀超过剩余数据
    #[error("长度前缀 {0} 超过剩余数据")]
    LengthOverflow(u64),

    /// 非法的 bool 字节
    #[error("非法的 bool 值: {0}")]
    InvalidBool(u8),
}

/// 可序列化类型
///
/// 每个值编码后至少占 1 个字节，容器解码时据此校验元素个数。
pub trait Marshal {
    /// 写入流
    fn pack(&self, os: &mut OctetsStream);

    /// 从流中读取并覆盖自身
    fn unpack(&mut self, os: &mut OctetsStream) -> Result<(), MarshalError>;
}
