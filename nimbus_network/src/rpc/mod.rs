//! RPC
//!
//! RPC 是一种特殊的协议：请求与响应共用一个协议 ID，通过 trace id 关联。
//!
//! 线上负载格式：
//!
//! ```text
//! compact(trace_id) bool(!is_server) argument [result]
//! ```
//!
//! 角色标志在发出时取反，所以接收方读到的就是自己的角色；
//! 只有服务端发出的响应才带 result。

pub mod tracker;

pub use tracker::{RpcCallbacks, RpcTracker};

use crate::protocol::{DEFAULT_MAX_SIZE, Protocol, ProtocolContext};
use crate::session::{SessionId, SessionManager};
use nimbus_core::{Marshal, MarshalError, OctetsStream};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, warn};

/// RPC 追踪 ID
pub type TraceId = u64;

/// 默认超时时间
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// RPC 处理器
///
/// 一种 RPC 对应一个处理器类型，服务端与客户端共用。
pub trait RpcHandler: Send + Sync + 'static {
    /// 请求参数
    type Argument: Marshal + Default + Clone + fmt::Debug + Send + Sync + 'static;
    /// 响应结果
    type Result: Marshal + Default + Clone + fmt::Debug + Send + Sync + 'static;

    /// 协议 ID
    const PROTOCOL_ID: u32;
    /// 名称
    const NAME: &'static str;

    /// 超时时间
    fn timeout(&self) -> Duration {
        DEFAULT_RPC_TIMEOUT
    }

    /// 负载长度上限
    fn max_size(&self) -> u64 {
        DEFAULT_MAX_SIZE
    }

    /// 执行的线程组
    fn thread_group_idx(&self) -> Option<usize> {
        None
    }

    /// 服务端处理请求，填写 `result`
    fn server(
        &self,
        cx: &ProtocolContext,
        argument: &Self::Argument,
        result: &mut Self::Result,
    ) -> ServerReply;

    /// 客户端收到响应，调用时没有指定回调才会走到这里
    fn client(&self, _cx: &ProtocolContext, argument: &Self::Argument, result: &Self::Result) {
        debug!(rpc = Self::NAME, ?argument, ?result, "收到 RPC 响应");
    }

    /// 调用超时，调用时没有指定回调才会走到这里
    fn on_timeout(&self, argument: &Self::Argument) {
        warn!(rpc = Self::NAME, ?argument, "RPC 超时");
    }
}

/// 服务端的处理结果
#[derive(Debug)]
pub enum ServerReply {
    /// 立即回复调用方
    Reply,
    /// 转发给另一个会话，拿到结果后再原路返回
    Forward {
        /// 目标会话所在的管理器
        manager: Arc<SessionManager>,
        /// 目标会话
        sid: SessionId,
    },
}

/// 转发链上的上一跳
#[derive(Debug, Clone)]
pub struct Origin {
    /// 上一跳使用的 trace id
    pub trace_id: TraceId,
    /// 上一跳的会话
    pub sid: SessionId,
    /// 上一跳会话所在的管理器
    pub manager: Weak<SessionManager>,
}

/// 转发状态
#[derive(Debug, Clone, Default)]
pub enum Forwarding {
    /// 直接调用
    #[default]
    Direct,
    /// 正在向下一跳转发请求
    ForwardingRequest {
        /// 上一跳
        origin: Origin,
    },
    /// 正在把结果送回上一跳
    ForwardingResponse {
        /// 上一跳
        origin: Origin,
    },
}

/// RPC 协议实例
pub struct Rpc<H: RpcHandler> {
    handler: Arc<H>,
    pub(crate) trace_id: TraceId,
    pub(crate) is_server: bool,
    pub(crate) forwarding: Forwarding,
    pub(crate) argument: H::Argument,
    pub(crate) result: H::Result,
}

impl<H: RpcHandler> Rpc<H> {
    /// 创建原型
    pub fn new(handler: Arc<H>) -> Self {
        Self {
            handler,
            trace_id: 0,
            is_server: false,
            forwarding: Forwarding::Direct,
            argument: H::Argument::default(),
            result: H::Result::default(),
        }
    }

    /// 以客户端身份携带参数
    pub(crate) fn request(handler: Arc<H>, argument: H::Argument) -> Self {
        Self {
            argument,
            ..Self::new(handler)
        }
    }

    /// 处理器
    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    /// 追踪 ID
    pub fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    /// 当前是否为服务端角色
    pub fn is_server(&self) -> bool {
        self.is_server
    }

    /// 转发状态
    pub fn forwarding(&self) -> &Forwarding {
        &self.forwarding
    }

    /// 参数
    pub fn argument(&self) -> &H::Argument {
        &self.argument
    }

    /// 结果
    pub fn result(&self) -> &H::Result {
        &self.result
    }

    fn serve(mut self, cx: ProtocolContext) {
        let handler = Arc::clone(&self.handler);
        match handler.server(&cx, &self.argument, &mut self.result) {
            ServerReply::Reply => {
                if !cx.reply(&self) {
                    debug!(rpc = H::NAME, trace_id = self.trace_id, sid = %cx.sid, "RPC 响应发送失败");
                }
            }
            ServerReply::Forward { manager, sid } => {
                let origin = Origin {
                    trace_id: self.trace_id,
                    sid: cx.sid,
                    manager: Arc::downgrade(&cx.manager),
                };
                if let Err(e) = cx.runtime.rpc().forward(self, origin, &manager, sid) {
                    warn!(rpc = H::NAME, target = %sid, error = %e, "RPC 转发失败");
                }
            }
        }
    }
}

impl<H: RpcHandler> Marshal for Rpc<H> {
    fn pack(&self, os: &mut OctetsStream) {
        os.pack(&self.trace_id)
            .pack(&!self.is_server)
            .pack(&self.argument);
        if self.is_server {
            os.pack(&self.result);
        }
    }

    fn unpack(&mut self, os: &mut OctetsStream) -> Result<(), MarshalError> {
        self.trace_id.unpack(os)?;
        self.is_server.unpack(os)?;
        self.argument.unpack(os)?;
        if !self.is_server {
            self.result.unpack(os)?;
        }
        Ok(())
    }
}

impl<H: RpcHandler> Protocol for Rpc<H> {
    fn protocol_id(&self) -> u32 {
        H::PROTOCOL_ID
    }

    fn name(&self) -> &'static str {
        H::NAME
    }

    fn max_size(&self) -> u64 {
        self.handler.max_size()
    }

    fn thread_group_idx(&self) -> Option<usize> {
        self.handler.thread_group_idx()
    }

    fn dup(&self) -> Box<dyn Protocol> {
        Box::new(Rpc::new(Arc::clone(&self.handler)))
    }

    fn run(self: Box<Self>, cx: ProtocolContext) {
        if self.is_server {
            self.serve(cx);
        } else {
            let tracker = Arc::clone(cx.runtime.rpc());
            tracker.complete(*self, &cx);
        }
    }
}

impl<H: RpcHandler> fmt::Debug for Rpc<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rpc")
            .field("name", &H::NAME)
            .field("trace_id", &self.trace_id)
            .field("is_server", &self.is_server)
            .field("forwarding", &self.forwarding)
            .field("argument", &self.argument)
            .field("result", &self.result)
            .finish()
    }
}
