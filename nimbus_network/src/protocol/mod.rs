//! 协议模块
//!
//! 协议原型、注册表、线上帧格式以及给异步客户端用的编解码器。
//!
//! 线上帧格式：
//!
//! ```text
//! +-------------------+----------------------+-----------+
//! | compact(type id)  | compact(payload len) |  payload  |
//! +-------------------+----------------------+-----------+
//! ```

pub mod codec;
pub mod frame;
pub mod registry;

// 重新导出主要类型
pub use codec::ProtocolCodec;
pub use frame::{FrameError, RawFrame};
pub use registry::{DecodeError, ProtocolRegistry, RegistryError, encode_protocol};

use crate::runtime::Runtime;
use crate::session::{SessionId, SessionManager};
use nimbus_core::Marshal;
use std::any::Any;
use std::sync::Arc;

/// 默认的单帧最大负载
pub const DEFAULT_MAX_SIZE: u64 = 65536;

/// 协议
///
/// 每种协议在 [`ProtocolRegistry`] 里注册一个原型，解码时通过 [`Protocol::dup`] 复制出新实例。
pub trait Protocol: Marshal + Any + Send + Sync {
    /// 协议类型 ID
    fn protocol_id(&self) -> u32;

    /// 协议名称
    fn name(&self) -> &'static str;

    /// 负载长度上限
    fn max_size(&self) -> u64 {
        DEFAULT_MAX_SIZE
    }

    /// 优先级
    fn priority(&self) -> u8 {
        0
    }

    /// 执行 [`Protocol::run`] 的线程组，`None` 时使用会话处理器的线程组
    fn thread_group_idx(&self) -> Option<usize> {
        None
    }

    /// 预估的负载长度，用于预留长度字段
    fn size_hint(&self) -> usize {
        0
    }

    /// 复制一个新实例
    fn dup(&self) -> Box<dyn Protocol>;

    /// 处理收到的协议
    fn run(self: Box<Self>, cx: ProtocolContext);
}

impl dyn Protocol {
    /// 尝试转换为具体类型
    pub fn downcast_ref<T: Protocol>(&self) -> Option<&T> {
        (self as &dyn Any).downcast_ref::<T>()
    }

    /// 是否为指定类型
    pub fn is<T: Protocol>(&self) -> bool {
        (self as &dyn Any).is::<T>()
    }

    /// 转换为 `Box<dyn Any>`
    pub fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// 协议执行上下文
#[derive(Clone)]
pub struct ProtocolContext {
    /// 运行时
    pub runtime: Runtime,
    /// 收到协议的会话管理器
    pub manager: Arc<SessionManager>,
    /// 收到协议的会话
    pub sid: SessionId,
}

impl ProtocolContext {
    /// 在同一个会话上回复
    pub fn reply(&self, protocol: &dyn Protocol) -> bool {
        self.manager.send_protocol(self.sid, protocol)
    }
}
