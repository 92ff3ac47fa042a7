//! 字节缓冲区
//!
//! 容量总是按 2 的幂次增长（最小 16 字节）的可变长字节数组。

use std::fmt;
use std::ops::Deref;

/// 最小容量
pub const MIN_CAPACITY: usize = 16;

/// 计算不小于 `size` 的容量（2 的幂次，最小 16）
pub fn frob_size(size: usize) -> usize {
    size.max(MIN_CAPACITY)
        .checked_next_power_of_two()
        .unwrap_or(usize::MAX)
}

/// 字节缓冲区
///
/// 底层存储总是初始化到完整容量，`len` 之后的区域可以直接作为
/// socket 读取的目标，再通过 [`Octets::advance_len`] 提交。
#[derive(Clone, Default)]
pub struct Octets {
    buf: Box<[u8]>,
    len: usize,
}

impl Octets {
    /// 创建空缓冲区（不分配内存）
    pub fn new() -> Self {
        Self::default()
    }

    /// 创建至少能容纳 `capacity` 字节的缓冲区
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; frob_size(capacity)].into_boxed_slice(),
            len: 0,
        }
    }

    /// 当前长度
    pub fn len(&self) -> usize {
        self.len
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 当前容量
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// 剩余可写空间
    pub fn free_space(&self) -> usize {
        self.capacity() - self.len
    }

    /// 已写入的数据
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// 已写入的数据（可变）
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf[..self.len]
    }

    /// 确保容量不小于 `capacity`
    pub fn reserve(&mut self, capacity: usize) {
        if capacity <= self.capacity() {
            return;
        }
        let mut grown = vec![0u8; frob_size(capacity)].into_boxed_slice();
        grown[..self.len].copy_from_slice(self.as_slice());
        self.buf = grown;
    }

    /// 追加数据
    pub fn append(&mut self, data: &[u8]) {
        let end = self.len + data.len();
        self.reserve(end);
        self.buf[self.len..end].copy_from_slice(data);
        self.len = end;
    }

    /// 在 `pos` 处插入数据
    ///
    /// # Panics
    ///
    /// `pos > len` 时 panic。
    pub fn insert(&mut self, pos: usize, data: &[u8]) {
        assert!(pos <= self.len, "insert position {} out of range {}", pos, self.len);
        let end = self.len + data.len();
        self.reserve(end);
        self.buf.copy_within(pos..self.len, pos + data.len());
        self.buf[pos..pos + data.len()].copy_from_slice(data);
        self.len = end;
    }

    /// 删除 `[from, to)` 区间的数据
    ///
    /// # Panics
    ///
    /// `from > to` 或 `to > len` 时 panic。
    pub fn erase(&mut self, from: usize, to: usize) {
        assert!(from <= to && to <= self.len, "erase range {}..{} out of range {}", from, to, self.len);
        self.buf.copy_within(to..self.len, from);
        self.len -= to - from;
    }

    /// 从 `pos` 开始原地覆盖数据，长度保持不变
    ///
    /// # Panics
    ///
    /// 覆盖区间超出 `len` 时 panic。
    pub fn replace(&mut self, pos: usize, data: &[u8]) {
        let end = pos + data.len();
        assert!(end <= self.len, "replace range {}..{} out of range {}", pos, end, self.len);
        self.buf[pos..end].copy_from_slice(data);
    }

    /// 直接调整长度，不初始化新增区域
    pub fn fast_resize(&mut self, len: usize) {
        self.reserve(len);
        self.len = len;
    }

    /// `len` 之后尚未写入的区域
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.len..]
    }

    /// 提交通过 [`Octets::spare_mut`] 写入的 `n` 个字节
    ///
    /// # Panics
    ///
    /// 超出容量时 panic。
    pub fn advance_len(&mut self, n: usize) {
        assert!(self.len + n <= self.capacity(), "advance {} beyond capacity", n);
        self.len += n;
    }

    /// 清空数据，保留容量
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// 截断到 `len`
    pub fn truncate(&mut self, len: usize) {
        self.len = self.len.min(len);
    }

    /// 交换两个缓冲区
    pub fn swap(&mut self, other: &mut Octets) {
        std::mem::swap(self, other);
    }
}

impl Deref for Octets {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsRef<[u8]> for Octets {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl PartialEq for Octets {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for Octets {}

impl fmt::Debug for Octets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Octets")
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .finish()
    }
}

impl From<&[u8]> for Octets {
    fn from(data: &[u8]) -> Self {
        let mut octets = Octets::with_capacity(data.len());
        octets.append(data);
        octets
    }
}

impl From<Vec<u8>> for Octets {
    fn from(data: Vec<u8>) -> Self {
        Octets::from(data.as_slice())
    }
}
