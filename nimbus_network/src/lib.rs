//! Nimbus 网络层
//!
//! 基于 Reactor 的事件循环、会话管理、协议注册与编解码、RPC 以及运行时上下文。

pub mod demultiplexer;
pub mod event;
pub mod protocol;
pub mod reactor;
pub mod rpc;
pub mod runtime;
pub mod session;
pub mod timer;

// 导出主要类型到 crate root
pub use crate::demultiplexer::{Demultiplexer, Epoller, Wakeup};
pub use crate::event::{EventContext, EventMask, EventStatus, IoEvent};
pub use crate::protocol::{
    DecodeError, Protocol, ProtocolCodec, ProtocolContext, ProtocolRegistry, RawFrame,
    RegistryError,
};
pub use crate::reactor::{LoadBalance, Reactor, ReactorGroup, ReactorHandle, ReactorTimerId};
pub use crate::rpc::{
    Forwarding, Origin, Rpc, RpcCallbacks, RpcHandler, RpcTracker, ServerReply, TraceId,
};
pub use crate::runtime::{Runtime, RuntimeBuilder};
pub use crate::session::{Session, SessionHandler, SessionId, SessionManager, SessionState};
pub use crate::timer::{TimerHandle, TimerService};
// 重新导出 nimbus_core 的错误类型
pub use nimbus_core::{NimbusError, Result};

// 预导出
pub mod prelude {
    pub use crate::protocol::{Protocol, ProtocolContext};
    pub use crate::reactor::{Reactor, ReactorHandle};
    pub use crate::rpc::{RpcCallbacks, RpcHandler, ServerReply};
    pub use crate::runtime::{Runtime, RuntimeBuilder};
    pub use crate::session::{Session, SessionHandler, SessionId, SessionManager};
    pub use nimbus_core::{Marshal, MarshalError, NimbusError, OctetsStream, Result};
}
