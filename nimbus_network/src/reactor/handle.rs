//! Reactor 句柄
//!
//! 任意线程都可以通过 [`ReactorHandle`] 向 Reactor 提交变更，
//! 变更写入双缓冲队列后唤醒 Reactor，由 Reactor 线程在下一轮循环中统一处理。

use crate::demultiplexer::Wakeup;
use crate::event::IoEvent;
use mio::Token;
use nimbus_core::sync::ChangeList;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Reactor 定时器回调，返回 `true` 表示继续
pub type ReactorTimerHandler = Box<dyn FnMut() -> bool + Send>;

/// 信号回调，返回 `false` 时取消监听
pub type SignalHandler = Box<dyn FnMut(i32) -> bool + Send>;

/// Reactor 定时器 ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReactorTimerId(pub(crate) u64);

/// 提交给 Reactor 的变更
pub(crate) enum EventChange {
    Add(Token, Box<dyn IoEvent>),
    Refresh(Token),
    Remove(Token),
    AddTimer {
        id: ReactorTimerId,
        delay: bool,
        interval: Duration,
        handler: ReactorTimerHandler,
    },
    DelTimer(ReactorTimerId),
    AddSignal(i32, SignalHandler),
}

pub(crate) struct HandleInner {
    pub(crate) id: usize,
    pub(crate) changes: ChangeList<EventChange>,
    pub(crate) wakeup: Arc<Wakeup>,
    pub(crate) running: AtomicBool,
    pub(crate) io_count: AtomicUsize,
    next_token: AtomicUsize,
    next_timer: AtomicU64,
}

/// Reactor 句柄
#[derive(Clone)]
pub struct ReactorHandle {
    pub(crate) inner: Arc<HandleInner>,
}

impl ReactorHandle {
    pub(crate) fn new(id: usize, wakeup: Arc<Wakeup>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id,
                changes: ChangeList::new(),
                wakeup,
                running: AtomicBool::new(true),
                io_count: AtomicUsize::new(0),
                next_token: AtomicUsize::new(1),
                next_timer: AtomicU64::new(1),
            }),
        }
    }

    fn submit(&self, change: EventChange) {
        self.inner.changes.push(change);
        self.inner.wakeup.wake();
    }

    /// Reactor 编号，0 为主 Reactor
    pub fn id(&self) -> usize {
        self.inner.id
    }

    /// 预先分配一个 token
    pub fn reserve_token(&self) -> Token {
        Token(self.inner.next_token.fetch_add(1, Ordering::Relaxed))
    }

    /// 注册事件，返回分配的 token
    pub fn add_event(&self, event: Box<dyn IoEvent>) -> Token {
        let token = self.reserve_token();
        self.add_event_at(token, event);
        token
    }

    /// 用预先分配的 token 注册事件
    pub fn add_event_at(&self, token: Token, event: Box<dyn IoEvent>) {
        self.submit(EventChange::Add(token, event));
    }

    /// 让 Reactor 重新读取事件的关注掩码
    pub fn modify_event(&self, token: Token) {
        self.submit(EventChange::Refresh(token));
    }

    /// 注销并销毁事件
    pub fn del_event(&self, token: Token) {
        self.submit(EventChange::Remove(token));
    }

    /// 添加定时器
    pub fn add_timer(&self, delay: bool, interval: Duration, handler: ReactorTimerHandler) -> ReactorTimerId {
        let id = ReactorTimerId(self.inner.next_timer.fetch_add(1, Ordering::Relaxed));
        self.submit(EventChange::AddTimer {
            id,
            delay,
            interval,
            handler,
        });
        id
    }

    /// 删除定时器
    pub fn del_timer(&self, id: ReactorTimerId) {
        self.submit(EventChange::DelTimer(id));
    }

    /// 监听信号，回调在 Reactor 线程上执行
    pub fn add_signal(&self, signo: i32, handler: SignalHandler) {
        self.submit(EventChange::AddSignal(signo, handler));
    }

    /// 请求 Reactor 退出循环
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::Release);
        self.inner.wakeup.wake();
    }

    /// 是否仍在运行
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// 当前管理的 I/O 事件数
    pub fn load(&self) -> usize {
        self.inner.io_count.load(Ordering::Relaxed)
    }

    /// 是否为同一个 Reactor
    pub fn same_reactor(&self, other: &ReactorHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for ReactorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReactorHandle")
            .field("id", &self.inner.id)
            .field("running", &self.is_running())
            .field("load", &self.load())
            .field("pending_changes", &self.inner.changes.pending())
            .finish()
    }
}
