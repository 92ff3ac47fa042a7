//! 事件定义
//!
//! Reactor 管理的 I/O 事件都实现 [`IoEvent`]，注册后由 Reactor 独占。

use crate::reactor::ReactorHandle;
use bitflags::bitflags;
use mio::event::Source;
use mio::{Interest, Token};

bitflags! {
    /// 事件能力掩码
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EventMask: u32 {
        /// 可接受新连接
        const ACCEPT = 0x01;
        /// 可读
        const RECV = 0x02;
        /// 可写
        const SEND = 0x04;
        /// 对端关闭或出错
        const HUP = 0x08;
        /// 定时器
        const TIMER = 0x10;
        /// 异步 I/O 信号
        const SIGIO = 0x20;
        /// 信号
        const SIGNAL = 0x40;
        /// 唤醒
        const WAKEUP = 0x80;
    }
}

impl EventMask {
    /// 换算为 mio 的读写兴趣，没有任何 I/O 兴趣时返回 `None`
    pub fn interest(self) -> Option<Interest> {
        let readable = self.intersects(EventMask::ACCEPT | EventMask::RECV | EventMask::SIGNAL);
        let writable = self.contains(EventMask::SEND);
        match (readable, writable) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

/// 事件注册状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventStatus {
    /// 未注册
    #[default]
    None,
    /// 已注册
    Add,
    /// 已注销
    Del,
}

/// 事件回调上下文
pub struct EventContext<'a> {
    /// 事件的 token
    pub token: Token,
    /// 所属 Reactor
    pub handle: &'a ReactorHandle,
}

/// I/O 事件
pub trait IoEvent: Send {
    /// 当前关注的事件
    ///
    /// Reactor 在注册和收到刷新请求时读取该值。
    fn events(&self) -> EventMask;

    /// 底层的可注册句柄
    fn source(&mut self) -> Option<&mut dyn Source>;

    /// 处理就绪事件，返回 `false` 时 Reactor 注销并销毁该事件
    fn handle_event(&mut self, cx: &mut EventContext<'_>, active: EventMask) -> bool;

    /// 从 Reactor 移除后调用
    fn on_removed(&mut self, _cx: &mut EventContext<'_>) {}

    /// 事件名称，用于日志
    fn name(&self) -> &'static str {
        "io_event"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_interest() {
        assert_eq!(EventMask::RECV.interest(), Some(Interest::READABLE));
        assert_eq!(EventMask::ACCEPT.interest(), Some(Interest::READABLE));
        assert_eq!(EventMask::SEND.interest(), Some(Interest::WRITABLE));
        assert_eq!(
            (EventMask::RECV | EventMask::SEND).interest(),
            Some(Interest::READABLE | Interest::WRITABLE)
        );
        assert_eq!(EventMask::TIMER.interest(), None);
        assert_eq!(EventMask::empty().interest(), None);
    }

    #[test]
    fn test_mask_bits() {
        assert_eq!(EventMask::ACCEPT.bits(), 0x01);
        assert_eq!(EventMask::WAKEUP.bits(), 0x80);
        let mask = EventMask::RECV | EventMask::HUP;
        assert!(mask.contains(EventMask::HUP));
        assert!(!mask.contains(EventMask::SEND));
    }
}
