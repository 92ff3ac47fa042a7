//! 会话处理器
//!
//! 每个会话管理器绑定一个处理器，`identity()` 同时决定读取哪一段 `[managers.*]` 配置。

use crate::protocol::{Protocol, ProtocolContext};
use crate::session::id::SessionId;
use crate::session::manager::SessionManager;
use crate::session::session::Session;
use std::any::Any;
use tracing::warn;

/// 会话处理器
pub trait SessionHandler: Send + Sync + 'static {
    /// 名称，用于查找配置和日志
    fn identity(&self) -> &str;

    /// 为新会话创建扩展数据
    fn create_session(&self, _sid: SessionId) -> Box<dyn Any + Send + Sync> {
        Box::new(())
    }

    /// 处理协议的默认线程组
    fn thread_group_idx(&self) -> usize {
        0
    }

    /// 处理解码出的协议
    ///
    /// 默认投递到线程池，在工作线程上调用 [`Protocol::run`]。
    fn handle_protocol(&self, cx: ProtocolContext, protocol: Box<dyn Protocol>) {
        let group = protocol
            .thread_group_idx()
            .unwrap_or_else(|| self.thread_group_idx());
        let name = protocol.name();
        let sid = cx.sid;
        let runtime = cx.runtime.clone();
        if !runtime.threadpool().execute(group, move || protocol.run(cx)) {
            warn!(sid = %sid, protocol = name, group, "投递协议失败，丢弃");
        }
    }

    /// 会话建立后调用
    fn on_add_session(&self, _manager: &SessionManager, _session: &Session) {}

    /// 会话销毁前调用
    fn on_del_session(&self, _manager: &SessionManager, _session: &Session) {}
}
