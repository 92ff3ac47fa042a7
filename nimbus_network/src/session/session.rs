//! 会话
//!
//! 每个连接一个会话。会话由服务它的 I/O 事件独占持有，
//! 自己只记录所在 Reactor 和 token，以便从任意线程请求修改关注事件或关闭。

use crate::event::EventMask;
use crate::reactor::ReactorHandle;
use crate::session::id::SessionId;
use mio::Token;
use nimbus_core::Octets;
use parking_lot::RwLock;
use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    /// 尚未挂到 Reactor 上
    None = 0,
    /// 空闲
    Active = 1,
    /// 正在发送
    Sending = 2,
    /// 正在接收
    Recving = 3,
    /// 正在关闭
    Closing = 4,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SessionState::Active,
            2 => SessionState::Sending,
            3 => SessionState::Recving,
            4 => SessionState::Closing,
            _ => SessionState::None,
        }
    }
}

/// 发送缓冲区
#[derive(Debug, Default)]
pub(crate) struct WriteBuffer {
    pub(crate) data: Octets,
    /// 已经写入 socket 的字节数
    pub(crate) offset: usize,
}

impl WriteBuffer {
    /// 待发送字节
    pub(crate) fn pending(&self) -> &[u8] {
        &self.data[self.offset..]
    }

    /// 丢弃已发送的前缀
    pub(crate) fn compact(&mut self) {
        if self.offset == self.data.len() {
            self.data.clear();
        } else if self.offset > 0 {
            self.data.erase(0, self.offset);
        }
        self.offset = 0;
    }
}

/// 会话
pub struct Session {
    sid: SessionId,
    peer: SocketAddr,
    state: AtomicU8,
    binding: OnceLock<(ReactorHandle, Token)>,
    mask: AtomicU32,
    write: RwLock<WriteBuffer>,
    write_limit: usize,
    created_at: Instant,
    /// 最近活跃时间，相对 `created_at` 的毫秒数
    last_active: AtomicU64,
    ext: Box<dyn Any + Send + Sync>,
}

impl Session {
    pub(crate) fn new(
        sid: SessionId,
        peer: SocketAddr,
        write_limit: usize,
        ext: Box<dyn Any + Send + Sync>,
    ) -> Self {
        Self {
            sid,
            peer,
            state: AtomicU8::new(SessionState::None as u8),
            binding: OnceLock::new(),
            mask: AtomicU32::new(EventMask::RECV.bits()),
            write: RwLock::new(WriteBuffer::default()),
            write_limit,
            created_at: Instant::now(),
            last_active: AtomicU64::new(0),
            ext,
        }
    }

    /// 会话 ID
    pub fn sid(&self) -> SessionId {
        self.sid
    }

    /// 对端地址
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// 当前状态
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        // 关闭中的会话不再回到其他状态
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != SessionState::Closing as u8).then_some(state as u8)
            });
    }

    /// 是否正在关闭
    pub fn is_closing(&self) -> bool {
        self.state() == SessionState::Closing
    }

    /// 关联的扩展数据
    pub fn ext<T: Any>(&self) -> Option<&T> {
        self.ext.downcast_ref::<T>()
    }

    /// 会话存活时长
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// 距离最近一次活跃的时长
    pub fn idle_time(&self) -> Duration {
        let last = Duration::from_millis(self.last_active.load(Ordering::Relaxed));
        self.created_at.elapsed().saturating_sub(last)
    }

    /// 更新最近活跃时间
    pub fn touch(&self) {
        let now = self.created_at.elapsed().as_millis() as u64;
        self.last_active.fetch_max(now, Ordering::Relaxed);
    }

    pub(crate) fn bind(&self, reactor: ReactorHandle, token: Token) {
        if self.binding.set((reactor, token)).is_err() {
            warn!(sid = %self.sid, "会话重复绑定 Reactor");
        }
    }

    /// 所在 Reactor 与 token
    pub fn binding(&self) -> Option<(&ReactorHandle, Token)> {
        self.binding.get().map(|(handle, token)| (handle, *token))
    }

    /// 当前关注的事件
    pub fn mask(&self) -> EventMask {
        EventMask::from_bits_truncate(self.mask.load(Ordering::Acquire))
    }

    fn update_mask(&self, set: EventMask, clear: EventMask) {
        let old = self
            .mask
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                Some((EventMask::from_bits_truncate(bits) - clear | set).bits())
            })
            .unwrap_or_default();
        let new = (EventMask::from_bits_truncate(old) - clear) | set;
        if new.bits() != old {
            if let Some((reactor, token)) = self.binding() {
                reactor.modify_event(token);
            }
        }
    }

    /// 恢复关注可读
    pub fn permit_recv(&self) {
        self.update_mask(EventMask::RECV, EventMask::empty());
    }

    /// 暂停关注可读
    pub fn forbid_recv(&self) {
        self.update_mask(EventMask::empty(), EventMask::RECV);
    }

    /// 关注可写
    pub fn permit_send(&self) {
        self.update_mask(EventMask::SEND, EventMask::empty());
    }

    /// 取消关注可写
    pub fn forbid_send(&self) {
        self.update_mask(EventMask::empty(), EventMask::SEND);
    }

    /// 追加待发送数据
    ///
    /// 写缓冲区剩余空间不足时丢弃整条消息并返回 `false`。
    pub fn send_octets(&self, data: &[u8]) -> bool {
        if self.is_closing() {
            return false;
        }
        let mut write = self.write.write();
        let free = self.write_limit.saturating_sub(write.data.len());
        if free < data.len() {
            warn!(sid = %self.sid, len = data.len(), free, "写缓冲区已满，丢弃消息");
            return false;
        }
        write.data.append(data);
        // 持锁修改掩码，避免与 I/O 线程的 forbid_send 交错
        self.permit_send();
        true
    }

    /// 待发送字节数
    pub fn pending_send(&self) -> usize {
        self.write.read().pending().len()
    }

    pub(crate) fn write_buffer(&self) -> &RwLock<WriteBuffer> {
        &self.write
    }

    /// 请求关闭会话，I/O 事件在所在 Reactor 上销毁
    pub fn close(&self) {
        let previous = self.state.swap(SessionState::Closing as u8, Ordering::AcqRel);
        if previous == SessionState::Closing as u8 {
            return;
        }
        debug!(sid = %self.sid, peer = %self.peer, "关闭会话");
        if let Some((reactor, token)) = self.binding() {
            reactor.del_event(token);
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("sid", &self.sid)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .field("mask", &self.mask())
            .field("pending_send", &self.pending_send())
            .finish()
    }
}
