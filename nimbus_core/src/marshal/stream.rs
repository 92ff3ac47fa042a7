//! 序列化流
//!
//! 在 [`Octets`] 之上维护读游标 `pos` 与事务游标 `transpos`，
//! 支持 Begin / Rollback / Commit 三种事务标记，用于处理半包。

use super::octets::Octets;
use super::varint::{MAX_VARINT_LEN, decode_varint, encode_varint};
use super::{Marshal, MarshalError};

/// 已消费数据超过该阈值时，Commit 会压缩缓冲区
pub const SHRINK_THRESHOLD: usize = 0x100000;

/// 事务标记
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transaction {
    /// 记录当前读位置
    Begin,
    /// 恢复到 Begin 时的读位置
    Rollback,
    /// 确认读取，必要时压缩缓冲区
    Commit,
}

/// 序列化流
#[derive(Clone, Debug, Default)]
pub struct OctetsStream {
    data: Octets,
    pos: usize,
    transpos: usize,
    limit: Option<usize>,
}

impl OctetsStream {
    /// 创建空流
    pub fn new() -> Self {
        Self::default()
    }

    /// 创建预留容量的流
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Octets::with_capacity(capacity),
            ..Default::default()
        }
    }

    /// 底层数据
    pub fn data(&self) -> &Octets {
        &self.data
    }

    /// 底层数据（可变）
    ///
    /// 修改已读区域之前的数据会破坏游标，调用方需自行保证。
    pub fn data_mut(&mut self) -> &mut Octets {
        &mut self.data
    }

    /// 取出底层数据
    pub fn into_octets(self) -> Octets {
        self.data
    }

    /// 数据总长度（包含已读部分）
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// 是否没有任何数据
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// 当前读位置
    pub fn pos(&self) -> usize {
        self.pos
    }

    fn end(&self) -> usize {
        match self.limit {
            Some(limit) => limit.min(self.data.len()),
            None => self.data.len(),
        }
    }

    /// 剩余可读字节数
    pub fn remaining(&self) -> usize {
        self.end() - self.pos
    }

    /// 是否还有至少 `size` 个字节可读
    pub fn data_ready(&self, size: u64) -> bool {
        self.remaining() as u64 >= size
    }

    /// 尚未读取的数据
    pub fn unread(&self) -> &[u8] {
        &self.data[self.pos..self.end()]
    }

    /// 执行事务标记
    pub fn transaction(&mut self, op: Transaction) -> Result<(), MarshalError> {
        match op {
            Transaction::Begin => {
                self.transpos = self.pos;
            }
            Transaction::Rollback => {
                if self.transpos > self.data.len() {
                    return Err(MarshalError::InvalidRollback {
                        transpos: self.transpos,
                        len: self.data.len(),
                    });
                }
                self.pos = self.transpos;
            }
            Transaction::Commit => {
                self.try_shrink();
            }
        }
        Ok(())
    }

    /// 已消费数据超过阈值时丢弃已读部分
    pub fn try_shrink(&mut self) {
        if self.pos > SHRINK_THRESHOLD {
            self.data.erase(0, self.pos);
            self.limit = self.limit.map(|limit| limit.saturating_sub(self.pos));
            self.pos = 0;
            self.transpos = 0;
        }
    }

    /// 清空数据与游标
    pub fn clear(&mut self) {
        self.data.clear();
        self.pos = 0;
        self.transpos = 0;
        self.limit = None;
    }

    /// 追加原始字节
    pub fn append(&mut self, bytes: &[u8]) -> &mut Self {
        self.data.append(bytes);
        self
    }

    /// 写入单个字节
    pub fn push_u8(&mut self, byte: u8) -> &mut Self {
        self.data.append(&[byte]);
        self
    }

    /// 写入 varint
    pub fn push_varint(&mut self, value: u64) -> &mut Self {
        let mut buf = [0u8; MAX_VARINT_LEN];
        let len = encode_varint(value, &mut buf);
        self.data.append(&buf[..len]);
        self
    }

    /// 写入带长度前缀的字节串
    pub fn push_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.push_varint(bytes.len() as u64);
        self.data.append(bytes);
        self
    }

    /// 序列化一个值
    pub fn pack<T: Marshal + ?Sized>(&mut self, value: &T) -> &mut Self {
        value.pack(self);
        self
    }

    /// 读取单个字节
    pub fn pop_u8(&mut self) -> Result<u8, MarshalError> {
        if self.remaining() < 1 {
            return Err(MarshalError::NotEnoughData);
        }
        let byte = self.data[self.pos];
        self.pos += 1;
        Ok(byte)
    }

    /// 读取 varint
    pub fn pop_varint(&mut self) -> Result<u64, MarshalError> {
        match decode_varint(self.unread())? {
            Some((value, len)) => {
                self.pos += len;
                Ok(value)
            }
            None => Err(MarshalError::NotEnoughData),
        }
    }

    /// 读取 `len` 个原始字节
    pub fn pop_raw(&mut self, len: usize) -> Result<&[u8], MarshalError> {
        if self.remaining() < len {
            return Err(MarshalError::NotEnoughData);
        }
        let start = self.pos;
        self.pos += len;
        Ok(&self.data[start..start + len])
    }

    /// 读取带长度前缀的字节串
    pub fn pop_bytes(&mut self) -> Result<&[u8], MarshalError> {
        let len = self.pop_varint()?;
        if len > self.remaining() as u64 {
            return Err(MarshalError::LengthOverflow(len));
        }
        self.pop_raw(len as usize)
    }

    /// 跳过 `len` 个字节
    pub fn skip(&mut self, len: usize) -> Result<(), MarshalError> {
        self.pop_raw(len).map(|_| ())
    }

    /// 反序列化一个新值
    pub fn unpack<T: Marshal + Default>(&mut self) -> Result<T, MarshalError> {
        let mut value = T::default();
        value.unpack(self)?;
        Ok(value)
    }

    /// 反序列化到已有的值
    pub fn unpack_into<T: Marshal + ?Sized>(&mut self, value: &mut T) -> Result<(), MarshalError> {
        value.unpack(self)
    }

    /// 限制 `f` 最多只能从当前位置读取 `len` 个字节
    pub fn with_limit<R>(&mut self, len: usize, f: impl FnOnce(&mut Self) -> R) -> R {
        let saved = self.limit;
        self.limit = Some((self.pos + len).min(self.end()));
        let result = f(self);
        self.limit = saved;
        result
    }
}

impl From<Octets> for OctetsStream {
    fn from(data: Octets) -> Self {
        Self {
            data,
            ..Default::default()
        }
    }
}
