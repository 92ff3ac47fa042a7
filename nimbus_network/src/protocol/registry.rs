//! 协议注册表
//!
//! 按类型 ID 保存协议原型，负责在序列化流上编码和事务式解码整帧协议。

use crate::protocol::Protocol;
use nimbus_core::marshal::{MAX_VARINT_LEN, compact_size, encode_varint};
use nimbus_core::{MarshalError, NimbusError, OctetsStream, Transaction};
use std::collections::{HashMap, HashSet};
use std::fmt;
use thiserror::Error;
use tracing::debug;

/// 注册错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// 协议 ID 重复
    #[error("协议 ID {id} 重复: {existing} 与 {name}")]
    Duplicate {
        /// 协议 ID
        id: u32,
        /// 已注册的协议名
        existing: &'static str,
        /// 新协议名
        name: &'static str,
    },
}

/// 解码错误，出现后会话会被关闭
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// 未注册的协议
    #[error("未知协议: {0}")]
    UnknownProtocol(u64),

    /// 会话管理器禁止的协议
    #[error("协议 {name}({id}) 被禁止")]
    Forbidden {
        /// 协议 ID
        id: u32,
        /// 协议名
        name: &'static str,
    },

    /// 负载超过上限
    #[error("协议 {id} 负载 {size} 超过上限 {max}")]
    Oversized {
        /// 协议 ID
        id: u32,
        /// 声明的负载长度
        size: u64,
        /// 上限
        max: u64,
    },

    /// 负载无法反序列化
    #[error("协议 {name}({id}) 反序列化失败: {source}")]
    Marshal {
        /// 协议 ID
        id: u32,
        /// 协议名
        name: &'static str,
        /// 原因
        #[source]
        source: MarshalError,
    },

    /// 帧头不合法
    #[error("帧头错误: {0}")]
    Stream(#[from] MarshalError),
}

impl From<DecodeError> for NimbusError {
    fn from(err: DecodeError) -> Self {
        NimbusError::protocol(err.to_string())
    }
}

impl From<RegistryError> for NimbusError {
    fn from(err: RegistryError) -> Self {
        NimbusError::validation(err.to_string())
    }
}

/// 编码一个协议到流末尾
///
/// 长度字段先按 [`Protocol::size_hint`] 预留，负载写完后再按实际长度插入或删除字节。
pub fn encode_protocol(protocol: &dyn Protocol, os: &mut OctetsStream) {
    os.push_varint(u64::from(protocol.protocol_id()));
    let size_pos = os.len();
    let guess = compact_size(protocol.size_hint() as u64);
    let zeros = [0u8; MAX_VARINT_LEN];
    os.append(&zeros[..guess]);

    let payload_start = os.len();
    protocol.pack(os);
    let size = (os.len() - payload_start) as u64;

    let need = compact_size(size);
    if need > guess {
        os.data_mut().insert(size_pos, &zeros[..need - guess]);
    } else if need < guess {
        os.data_mut().erase(size_pos, size_pos + guess - need);
    }
    let mut buf = [0u8; MAX_VARINT_LEN];
    let len = encode_varint(size, &mut buf);
    os.data_mut().replace(size_pos, &buf[..len]);
}

/// 读取一个 varint，数据不足时返回 `None`
fn pop_header(os: &mut OctetsStream) -> Result<Option<u64>, MarshalError> {
    match os.pop_varint() {
        Ok(value) => Ok(Some(value)),
        Err(MarshalError::NotEnoughData) => Ok(None),
        Err(e) => Err(e),
    }
}

/// 协议注册表
#[derive(Default)]
pub struct ProtocolRegistry {
    prototypes: HashMap<u32, Box<dyn Protocol>>,
}

impl ProtocolRegistry {
    /// 创建空注册表
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册协议原型
    pub fn register(&mut self, prototype: Box<dyn Protocol>) -> Result<(), RegistryError> {
        let id = prototype.protocol_id();
        if let Some(existing) = self.prototypes.get(&id) {
            return Err(RegistryError::Duplicate {
                id,
                existing: existing.name(),
                name: prototype.name(),
            });
        }
        debug!(id, name = prototype.name(), "注册协议");
        self.prototypes.insert(id, prototype);
        Ok(())
    }

    /// 获取原型
    pub fn get(&self, id: u32) -> Option<&dyn Protocol> {
        self.prototypes.get(&id).map(|p| p.as_ref())
    }

    /// 复制出一个新实例
    pub fn create(&self, id: u32) -> Option<Box<dyn Protocol>> {
        self.prototypes.get(&id).map(|p| p.dup())
    }

    /// 是否已注册
    pub fn contains(&self, id: u32) -> bool {
        self.prototypes.contains_key(&id)
    }

    /// 已注册的协议数
    pub fn len(&self) -> usize {
        self.prototypes.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.prototypes.is_empty()
    }

    /// 从流中解码一个协议
    ///
    /// 数据不足一帧时回滚读位置并返回 `Ok(None)`。
    pub fn decode(
        &self,
        os: &mut OctetsStream,
        forbidden: &HashSet<u32>,
    ) -> Result<Option<Box<dyn Protocol>>, DecodeError> {
        os.transaction(Transaction::Begin)?;
        let Some(id) = pop_header(os)? else {
            os.transaction(Transaction::Rollback)?;
            return Ok(None);
        };
        let Some(size) = pop_header(os)? else {
            os.transaction(Transaction::Rollback)?;
            return Ok(None);
        };

        let id = u32::try_from(id).map_err(|_| DecodeError::UnknownProtocol(id))?;
        let prototype = self
            .prototypes
            .get(&id)
            .ok_or(DecodeError::UnknownProtocol(u64::from(id)))?;
        if forbidden.contains(&id) {
            return Err(DecodeError::Forbidden {
                id,
                name: prototype.name(),
            });
        }
        if size > prototype.max_size() {
            return Err(DecodeError::Oversized {
                id,
                size,
                max: prototype.max_size(),
            });
        }
        if !os.data_ready(size) {
            os.transaction(Transaction::Rollback)?;
            return Ok(None);
        }

        let size = size as usize;
        let start = os.pos();
        let mut protocol = prototype.dup();
        os.with_limit(size, |os| protocol.unpack(os))
            .map_err(|source| DecodeError::Marshal {
                id,
                name: prototype.name(),
                source,
            })?;
        let consumed = os.pos() - start;
        os.skip(size - consumed)?;
        os.transaction(Transaction::Commit)?;
        Ok(Some(protocol))
    }
}

impl fmt::Debug for ProtocolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self
            .prototypes
            .iter()
            .map(|(id, p)| (*id, p.name()))
            .collect();
        ids.sort_unstable();
        f.debug_struct("ProtocolRegistry")
            .field("prototypes", &ids)
            .finish()
    }
}
