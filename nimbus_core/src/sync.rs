//! 同步原语
//!
//! - [`SpinLock`]：只保护极短临界区的自旋锁
//! - [`ChangeList`]：多写单读的双缓冲变更队列

use parking_lot::Mutex;
use std::fmt;

/// 自旋锁，竞争时忙等而不是让出线程
pub type SpinLock<T> = spin::Mutex<T>;

/// 自旋锁守卫
pub type SpinLockGuard<'a, T> = spin::MutexGuard<'a, T>;

/// 双缓冲变更队列
///
/// 任意线程通过 [`ChangeList::push`] 写入前台缓冲区（自旋锁保护），
/// 唯一的读线程通过 [`ChangeList::drain`] 交换前后台缓冲区后逐条处理，
/// 处理过程中写线程不会被阻塞。
pub struct ChangeList<T> {
    front: SpinLock<Vec<T>>,
    back: Mutex<Vec<T>>,
}

impl<T> ChangeList<T> {
    /// 创建空队列
    pub fn new() -> Self {
        Self {
            front: SpinLock::new(Vec::new()),
            back: Mutex::new(Vec::new()),
        }
    }

    /// 写入一条变更
    pub fn push(&self, item: T) {
        self.front.lock().push(item);
    }

    /// 前台缓冲区中待处理的条数
    pub fn pending(&self) -> usize {
        self.front.lock().len()
    }

    /// 交换缓冲区并依次处理所有变更，返回处理的条数
    ///
    /// `f` 中可以继续 `push`，新写入的变更留到下一次 `drain`。
    pub fn drain(&self, mut f: impl FnMut(T)) -> usize {
        let mut back = self.back.lock();
        std::mem::swap(&mut *self.front.lock(), &mut *back);
        let count = back.len();
        for item in back.drain(..) {
            f(item);
        }
        count
    }
}

impl<T> Default for ChangeList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for ChangeList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeList")
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_spinlock_counter() {
        let lock = Arc::new(SpinLock::new(0u64));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                thread::spawn(move || {
                    for _ in 0..10_000 {
                        *lock.lock() += 1;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*lock.lock(), 40_000);
    }

    #[test]
    fn test_try_lock() {
        let lock = SpinLock::new(1);
        let guard = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn test_change_list_order() {
        let list = ChangeList::new();
        list.push(1);
        list.push(2);
        list.push(3);
        assert_eq!(list.pending(), 3);

        let mut seen = Vec::new();
        assert_eq!(list.drain(|v| seen.push(v)), 3);
        assert_eq!(seen, vec![1, 2, 3]);
        assert_eq!(list.pending(), 0);
    }

    #[test]
    fn test_change_list_push_during_drain() {
        let list = ChangeList::new();
        list.push(1);
        let mut seen = Vec::new();
        list.drain(|v| {
            seen.push(v);
            list.push(v + 10);
        });
        assert_eq!(seen, vec![1]);
        assert_eq!(list.pending(), 1);
        list.drain(|v| seen.push(v));
        assert_eq!(seen, vec![1, 11]);
    }

    #[test]
    fn test_change_list_concurrent_writers() {
        let list = Arc::new(ChangeList::new());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let list = Arc::clone(&list);
                thread::spawn(move || {
                    for i in 0..1000 {
                        list.push(t * 1000 + i);
                    }
                })
            })
            .collect();
        let mut total = 0;
        for handle in handles {
            handle.join().unwrap();
        }
        total += list.drain(|_| {});
        assert_eq!(total, 4000);
    }
}
