//! 对象池
//!
//! 固定容量的槽位池，槽位通过 [`PoolKey`]（下标 + 代数）访问。
//! 释放槽位时代数递增，因此过期的 key 永远不会访问到新对象。
//!
//! 空闲链表有两种实现：
//! - [`LockedFreeList`]：自旋锁保护的下标栈
//! - [`AtomicFreeList`]：带版本号的无锁 Treiber 栈

use crate::sync::SpinLock;
use crossbeam::utils::Backoff;
use nimbus_config::MAX_POOL_SIZE;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use thiserror::Error;

/// 对象池最大容量
pub const OBJECT_POOL_MAX: usize = MAX_POOL_SIZE;

const NIL: u32 = u32::MAX;

/// 对象池错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// 所有槽位都已被占用
    #[error("对象池已满 (容量 {capacity})")]
    Exhausted {
        /// 池容量
        capacity: usize,
    },

    /// 容量为 0 或超过上限
    #[error("非法的对象池容量 {capacity} (上限 {max})")]
    InvalidCapacity {
        /// 请求的容量
        capacity: usize,
        /// 容量上限
        max: usize,
    },
}

/// 槽位句柄
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolKey {
    index: u32,
    generation: u32,
}

impl PoolKey {
    /// 槽位下标
    pub fn index(&self) -> usize {
        self.index as usize
    }

    /// 槽位代数
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PoolKey({}v{})", self.index, self.generation)
    }
}

/// 空闲下标链表
pub trait FreeList: Send + Sync {
    /// 创建包含 `0..capacity` 全部下标的链表，`pop` 从 0 开始返回
    fn with_capacity(capacity: usize) -> Self
    where
        Self: Sized;

    /// 取出一个空闲下标
    fn pop(&self) -> Option<u32>;

    /// 归还下标
    fn push(&self, index: u32);
}

/// 自旋锁保护的空闲链表
pub struct LockedFreeList {
    stack: SpinLock<Vec<u32>>,
}

impl FreeList for LockedFreeList {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            stack: SpinLock::new((0..capacity as u32).rev().collect()),
        }
    }

    fn pop(&self) -> Option<u32> {
        self.stack.lock().pop()
    }

    fn push(&self, index: u32) {
        self.stack.lock().push(index);
    }
}

/// 无锁空闲链表
///
/// 头指针高 32 位是版本号，低 32 位是下标，每次修改都递增版本号以避免 ABA。
pub struct AtomicFreeList {
    next: Box<[AtomicU32]>,
    head: AtomicU64,
}

impl AtomicFreeList {
    fn pack(tag: u32, index: u32) -> u64 {
        (u64::from(tag) << 32) | u64::from(index)
    }

    fn unpack(head: u64) -> (u32, u32) {
        ((head >> 32) as u32, head as u32)
    }
}

impl FreeList for AtomicFreeList {
    fn with_capacity(capacity: usize) -> Self {
        let next = (0..capacity)
            .map(|i| {
                let succ = if i + 1 < capacity { (i + 1) as u32 } else { NIL };
                AtomicU32::new(succ)
            })
            .collect();
        let first = if capacity > 0 { 0 } else { NIL };
        Self {
            next,
            head: AtomicU64::new(Self::pack(0, first)),
        }
    }

    fn pop(&self) -> Option<u32> {
        let backoff = Backoff::new();
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let (tag, index) = Self::unpack(head);
            if index == NIL {
                return None;
            }
            let succ = self.next[index as usize].load(Ordering::Acquire);
            match self.head.compare_exchange_weak(
                head,
                Self::pack(tag.wrapping_add(1), succ),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(index),
                Err(current) => {
                    head = current;
                    backoff.spin();
                }
            }
        }
    }

    fn push(&self, index: u32) {
        let backoff = Backoff::new();
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let (tag, top) = Self::unpack(head);
            self.next[index as usize].store(top, Ordering::Release);
            match self.head.compare_exchange_weak(
                head,
                Self::pack(tag.wrapping_add(1), index),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(current) => {
                    head = current;
                    backoff.spin();
                }
            }
        }
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// 固定容量对象池
pub struct Pool<T, F: FreeList = LockedFreeList> {
    slots: Box<[SpinLock<Slot<T>>]>,
    free: F,
    len: AtomicUsize,
}

/// 自旋锁空闲链表的对象池
pub type ObjectPool<T> = Pool<T, LockedFreeList>;

/// 无锁空闲链表的对象池
pub type LockFreePool<T> = Pool<T, AtomicFreeList>;

impl<T, F: FreeList> Pool<T, F> {
    /// 创建容量为 `capacity` 的对象池
    pub fn new(capacity: usize) -> Result<Self, PoolError> {
        if capacity == 0 || capacity > OBJECT_POOL_MAX {
            return Err(PoolError::InvalidCapacity {
                capacity,
                max: OBJECT_POOL_MAX,
            });
        }
        let slots = (0..capacity)
            .map(|_| {
                SpinLock::new(Slot {
                    generation: 0,
                    value: None,
                })
            })
            .collect();
        Ok(Self {
            slots,
            free: F::with_capacity(capacity),
            len: AtomicUsize::new(0),
        })
    }

    /// 放入对象
    pub fn insert(&self, value: T) -> Result<PoolKey, PoolError> {
        let index = self.free.pop().ok_or(PoolError::Exhausted {
            capacity: self.capacity(),
        })?;
        let mut slot = self.slots[index as usize].lock();
        slot.value = Some(value);
        self.len.fetch_add(1, Ordering::Relaxed);
        Ok(PoolKey {
            index,
            generation: slot.generation,
        })
    }

    /// 取出对象并释放槽位，key 过期时返回 `None`
    pub fn remove(&self, key: PoolKey) -> Option<T> {
        let slot = self.slots.get(key.index())?;
        let value = {
            let mut slot = slot.lock();
            if slot.generation != key.generation {
                return None;
            }
            let value = slot.value.take()?;
            slot.generation = slot.generation.wrapping_add(1);
            value
        };
        self.free.push(key.index);
        self.len.fetch_sub(1, Ordering::Relaxed);
        Some(value)
    }

    /// 在槽位锁内访问对象，key 过期时返回 `None`
    pub fn with<R>(&self, key: PoolKey, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut slot = self.slots.get(key.index())?.lock();
        if slot.generation != key.generation {
            return None;
        }
        slot.value.as_mut().map(f)
    }

    /// key 是否仍然有效
    pub fn contains(&self, key: PoolKey) -> bool {
        self.with(key, |_| ()).is_some()
    }

    /// 已占用的槽位数
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// 是否没有占用任何槽位
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 容量
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

impl<T, F: FreeList> fmt::Debug for Pool<T, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}
