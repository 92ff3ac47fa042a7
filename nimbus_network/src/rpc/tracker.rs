//! RPC 调用追踪
//!
//! 发出的每个调用按 trace id 记录一条待完成项，收到响应或超时时移除，二者只会发生一个。

use crate::protocol::ProtocolContext;
use crate::rpc::{Forwarding, Origin, Rpc, RpcHandler, TraceId};
use crate::session::{SessionId, SessionManager};
use crate::timer::{TimerHandle, TimerService};
use nimbus_core::{NimbusError, Result};
use parking_lot::Mutex;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

type ResultCallback<H> =
    Box<dyn FnOnce(&<H as RpcHandler>::Argument, &<H as RpcHandler>::Result) + Send>;
type TimeoutCallback<H> = Box<dyn FnOnce(&<H as RpcHandler>::Argument) + Send>;

/// 单次调用的回调
///
/// 未设置的回调退回到 [`RpcHandler::client`] 和 [`RpcHandler::on_timeout`]。
pub struct RpcCallbacks<H: RpcHandler> {
    on_result: Option<ResultCallback<H>>,
    on_timeout: Option<TimeoutCallback<H>>,
}

impl<H: RpcHandler> RpcCallbacks<H> {
    /// 不带回调，结果和超时交给 [`RpcHandler`] 的默认实现
    pub fn new() -> Self {
        Self {
            on_result: None,
            on_timeout: None,
        }
    }

    /// 收到结果
    pub fn on_result<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&H::Argument, &H::Result) + Send + 'static,
    {
        self.on_result = Some(Box::new(f));
        self
    }

    /// 超时
    pub fn on_timeout<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&H::Argument) + Send + 'static,
    {
        self.on_timeout = Some(Box::new(f));
        self
    }
}

impl<H: RpcHandler> Default for RpcCallbacks<H> {
    fn default() -> Self {
        Self::new()
    }
}

enum PendingState<H: RpcHandler> {
    Direct(RpcCallbacks<H>),
    Forwarding(Origin),
}

struct PendingRpc<H: RpcHandler> {
    handler: Arc<H>,
    argument: H::Argument,
    state: PendingState<H>,
}

struct PendingEntry {
    /// `PendingRpc<H>`
    call: Box<dyn Any + Send>,
    expire: fn(Box<dyn Any + Send>, TraceId),
    timer: Option<TimerHandle>,
}

fn expire_pending<H: RpcHandler>(call: Box<dyn Any + Send>, trace_id: TraceId) {
    let Ok(pending) = call.downcast::<PendingRpc<H>>() else {
        return;
    };
    let PendingRpc {
        handler,
        argument,
        state,
    } = *pending;
    match state {
        PendingState::Direct(callbacks) => match callbacks.on_timeout {
            Some(f) => f(&argument),
            None => handler.on_timeout(&argument),
        },
        PendingState::Forwarding(origin) => {
            // 上一跳有自己的超时
            warn!(rpc = H::NAME, trace_id, origin_trace = origin.trace_id, origin_sid = %origin.sid, "转发的 RPC 超时");
        }
    }
}

/// RPC 追踪器
pub struct RpcTracker {
    timers: TimerService,
    handlers: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    pending: Mutex<HashMap<TraceId, PendingEntry>>,
    next_trace: AtomicU64,
    weak_self: Weak<RpcTracker>,
}

impl RpcTracker {
    pub(crate) fn new(
        timers: TimerService,
        handlers: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            timers,
            handlers,
            pending: Mutex::new(HashMap::new()),
            next_trace: AtomicU64::new(1),
            weak_self: weak_self.clone(),
        })
    }

    /// 已注册的处理器
    pub fn handler<H: RpcHandler>(&self) -> Option<Arc<H>> {
        self.handlers
            .get(&TypeId::of::<H>())
            .cloned()
            .and_then(|handler| handler.downcast::<H>().ok())
    }

    /// 未完成的调用数
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// 调用是否仍未完成
    pub fn is_pending(&self, trace_id: TraceId) -> bool {
        self.pending.lock().contains_key(&trace_id)
    }

    /// 发起调用
    ///
    /// 返回本次调用的 trace id。发送失败时不会触发任何回调。
    pub fn call<H: RpcHandler>(
        &self,
        manager: &SessionManager,
        sid: SessionId,
        argument: H::Argument,
        callbacks: RpcCallbacks<H>,
    ) -> Result<TraceId> {
        let handler = self
            .handler::<H>()
            .ok_or_else(|| NimbusError::rpc(format!("RPC {} 未注册", H::NAME)))?;
        let rpc = Rpc::request(Arc::clone(&handler), argument.clone());
        let pending = PendingRpc {
            handler,
            argument,
            state: PendingState::Direct(callbacks),
        };
        self.dispatch(manager, sid, rpc, pending)
    }

    /// 发起调用并等待结果
    ///
    /// 超时返回 [`NimbusError::Timeout`]。
    pub fn call_async<H: RpcHandler>(
        &self,
        manager: &SessionManager,
        sid: SessionId,
        argument: H::Argument,
    ) -> Result<impl Future<Output = Result<H::Result>> + Send + 'static> {
        let (tx, rx) = oneshot::channel::<Result<H::Result>>();
        let on_result = Arc::new(Mutex::new(Some(tx)));
        let on_timeout = Arc::clone(&on_result);
        let callbacks = RpcCallbacks::<H>::new()
            .on_result(move |_, result: &H::Result| {
                if let Some(tx) = on_result.lock().take() {
                    let _ = tx.send(Ok(result.clone()));
                }
            })
            .on_timeout(move |_| {
                if let Some(tx) = on_timeout.lock().take() {
                    let _ = tx.send(Err(NimbusError::timeout()));
                }
            });
        self.call::<H>(manager, sid, argument, callbacks)?;
        Ok(async move {
            rx.await
                .map_err(|_| NimbusError::rpc(format!("RPC {} 已取消", H::NAME)))?
        })
    }

    /// 把服务端收到的请求转发给下一跳
    pub(crate) fn forward<H: RpcHandler>(
        &self,
        mut rpc: Rpc<H>,
        origin: Origin,
        manager: &SessionManager,
        sid: SessionId,
    ) -> Result<TraceId> {
        debug!(rpc = H::NAME, origin_trace = origin.trace_id, origin_sid = %origin.sid, target = %sid, "转发 RPC");
        rpc.forwarding = Forwarding::ForwardingRequest {
            origin: origin.clone(),
        };
        rpc.result = H::Result::default();
        let pending = PendingRpc {
            handler: Arc::clone(rpc.handler()),
            argument: rpc.argument.clone(),
            state: PendingState::Forwarding(origin),
        };
        self.dispatch(manager, sid, rpc, pending)
    }

    fn dispatch<H: RpcHandler>(
        &self,
        manager: &SessionManager,
        sid: SessionId,
        mut rpc: Rpc<H>,
        pending: PendingRpc<H>,
    ) -> Result<TraceId> {
        let trace_id = self.next_trace.fetch_add(1, Ordering::Relaxed);
        rpc.trace_id = trace_id;
        rpc.is_server = false;
        let timeout = rpc.handler().timeout();

        self.pending.lock().insert(
            trace_id,
            PendingEntry {
                call: Box::new(pending),
                expire: expire_pending::<H>,
                timer: None,
            },
        );

        let tracker = self.weak_self.clone();
        let armed = self.timers.add_oneshot(timeout, move || {
            if let Some(tracker) = tracker.upgrade() {
                tracker.expire(trace_id);
            }
        });
        match armed {
            Ok(timer) => {
                // 已经超时的条目不在表里，定时器也已经触发过了
                if let Some(entry) = self.pending.lock().get_mut(&trace_id) {
                    entry.timer = Some(timer);
                }
            }
            Err(e) => {
                self.pending.lock().remove(&trace_id);
                return Err(e.into());
            }
        }

        if !manager.send_protocol(sid, &rpc) {
            self.take(trace_id);
            return Err(NimbusError::rpc(format!("RPC {} 发送失败", H::NAME))
                .with_context(("sid", sid.value())));
        }
        trace!(rpc = H::NAME, trace_id, sid = %sid, "RPC 已发出");
        Ok(trace_id)
    }

    /// 处理客户端角色收到的响应
    pub(crate) fn complete<H: RpcHandler>(&self, rpc: Rpc<H>, cx: &ProtocolContext) {
        let trace_id = rpc.trace_id;
        let Some(entry) = self.take(trace_id) else {
            debug!(rpc = H::NAME, trace_id, sid = %cx.sid, "没有对应的调用，丢弃响应");
            return;
        };
        let pending = match entry.call.downcast::<PendingRpc<H>>() {
            Ok(pending) => *pending,
            Err(_) => {
                warn!(rpc = H::NAME, trace_id, "响应与调用的类型不一致，丢弃");
                return;
            }
        };
        let PendingRpc {
            handler,
            argument,
            state,
        } = pending;
        match state {
            PendingState::Direct(callbacks) => match callbacks.on_result {
                Some(f) => f(&argument, &rpc.result),
                None => handler.client(cx, &argument, &rpc.result),
            },
            PendingState::Forwarding(origin) => {
                let mut response = rpc;
                response.trace_id = origin.trace_id;
                response.is_server = true;
                response.argument = argument;
                let (sid, manager) = (origin.sid, origin.manager.upgrade());
                response.forwarding = Forwarding::ForwardingResponse { origin };
                match manager {
                    Some(manager) => {
                        if !manager.send_protocol(sid, &response) {
                            debug!(rpc = H::NAME, sid = %sid, "上一跳会话已关闭，丢弃转发的响应");
                        }
                    }
                    None => debug!(rpc = H::NAME, sid = %sid, "上一跳管理器已销毁，丢弃转发的响应"),
                }
            }
        }
    }

    fn expire(&self, trace_id: TraceId) {
        let Some(entry) = self.pending.lock().remove(&trace_id) else {
            return;
        };
        (entry.expire)(entry.call, trace_id);
    }

    fn take(&self, trace_id: TraceId) -> Option<PendingEntry> {
        let entry = self.pending.lock().remove(&trace_id)?;
        if let Some(timer) = entry.timer {
            self.timers.del_timer(timer);
        }
        Some(entry)
    }

    /// 丢弃所有未完成的调用，不触发回调
    pub fn clear(&self) {
        let entries: Vec<PendingEntry> = self.pending.lock().drain().map(|(_, e)| e).collect();
        for entry in &entries {
            if let Some(timer) = entry.timer {
                self.timers.del_timer(timer);
            }
        }
        if !entries.is_empty() {
            debug!(count = entries.len(), "丢弃未完成的 RPC");
        }
    }
}

impl fmt::Debug for RpcTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcTracker")
            .field("handlers", &self.handlers.len())
            .field("pending", &self.pending_count())
            .field("next_trace", &self.next_trace.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ProtocolContext;
    use crate::rpc::ServerReply;
    use nimbus_config::TimerConfig;
    use nimbus_core::{Marshal, MarshalError, OctetsStream, TimeWheel};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Debug, Clone, Default)]
    struct Ping(u32);

    impl Marshal for Ping {
        fn pack(&self, os: &mut OctetsStream) {
            os.pack(&self.0);
        }

        fn unpack(&mut self, os: &mut OctetsStream) -> std::result::Result<(), MarshalError> {
            self.0.unpack(os)
        }
    }

    struct Echo {
        timeouts: AtomicUsize,
    }

    impl RpcHandler for Echo {
        type Argument = Ping;
        type Result = Ping;
        const PROTOCOL_ID: u32 = 200;
        const NAME: &'static str = "echo";

        fn timeout(&self) -> Duration {
            Duration::from_millis(1)
        }

        fn server(&self, _cx: &ProtocolContext, argument: &Ping, result: &mut Ping) -> ServerReply {
            *result = argument.clone();
            ServerReply::Reply
        }

        fn on_timeout(&self, _argument: &Ping) {
            self.timeouts.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn tracker() -> (Arc<TimeWheel>, Arc<RpcTracker>, Arc<Echo>) {
        let wheel = Arc::new(TimeWheel::new(&TimerConfig::default()).unwrap());
        let echo = Arc::new(Echo {
            timeouts: AtomicUsize::new(0),
        });
        let mut handlers: HashMap<TypeId, Arc<dyn Any + Send + Sync>> = HashMap::new();
        handlers.insert(TypeId::of::<Echo>(), echo.clone());
        let tracker = RpcTracker::new(TimerService::Wheel(Arc::clone(&wheel)), handlers);
        (wheel, tracker, echo)
    }

    fn park(tracker: &RpcTracker, handler: Arc<Echo>, callbacks: RpcCallbacks<Echo>) -> TraceId {
        let trace_id = tracker.next_trace.fetch_add(1, Ordering::Relaxed);
        let pending = PendingRpc {
            handler,
            argument: Ping(trace_id as u32),
            state: PendingState::Direct(callbacks),
        };
        tracker.pending.lock().insert(
            trace_id,
            PendingEntry {
                call: Box::new(pending),
                expire: expire_pending::<Echo>,
                timer: None,
            },
        );
        trace_id
    }

    #[test]
    fn test_handler_lookup() {
        let (_wheel, tracker, echo) = tracker();
        let found = tracker.handler::<Echo>().unwrap();
        assert!(Arc::ptr_eq(&found, &echo));
    }

    #[test]
    fn test_expire_falls_back_to_handler() {
        let (_wheel, tracker, echo) = tracker();
        let trace_id = park(&tracker, Arc::clone(&echo), RpcCallbacks::new());
        assert!(tracker.is_pending(trace_id));
        tracker.expire(trace_id);
        tracker.expire(trace_id);
        assert!(!tracker.is_pending(trace_id));
        assert_eq!(echo.timeouts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_expire_uses_callback() {
        let (_wheel, tracker, echo) = tracker();
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        let trace_id = park(
            &tracker,
            Arc::clone(&echo),
            RpcCallbacks::new().on_timeout(move |argument: &Ping| {
                *sink.lock() = Some(argument.0);
            }),
        );
        tracker.expire(trace_id);
        assert_eq!(*seen.lock(), Some(trace_id as u32));
        assert_eq!(echo.timeouts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_clear_drops_silently() {
        let (_wheel, tracker, echo) = tracker();
        park(&tracker, Arc::clone(&echo), RpcCallbacks::new());
        park(&tracker, Arc::clone(&echo), RpcCallbacks::new());
        assert_eq!(tracker.pending_count(), 2);
        tracker.clear();
        assert_eq!(tracker.pending_count(), 0);
        assert_eq!(echo.timeouts.load(Ordering::SeqCst), 0);
    }
}
