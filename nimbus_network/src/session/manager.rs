//! 会话管理器
//!
//! 负责监听或主动连接、创建会话、连接上限、保活检测、断线重连以及协议发送。

use crate::protocol::{Protocol, ProtocolContext, encode_protocol};
use crate::reactor::ReactorHandle;
use crate::runtime::Runtime;
use crate::session::handler::SessionHandler;
use crate::session::id::SessionId;
use crate::session::io::{ActiveIo, PassiveIo, StreamIo, configure_stream};
use crate::session::metrics::SessionMetrics;
use crate::session::session::{Session, SessionState};
use crate::timer::TimerHandle;
use mio::Token;
use mio::net::{TcpListener, TcpStream};
use nimbus_config::SessionManagerConfig;
use nimbus_core::{NimbusError, OctetsStream, Repeat, Result};
use parking_lot::{Mutex, RwLock};
use socket2::{Domain, Socket, Type};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// 监听队列长度
const LISTEN_BACKLOG: i32 = 128;

/// 保活检查的最小间隔
const MIN_KEEPALIVE_CHECK: Duration = Duration::from_millis(100);

thread_local! {
    /// 每个线程一份的编码缓冲区
    static SCRATCH: RefCell<OctetsStream> = RefCell::new(OctetsStream::new());
}

/// 会话管理器
pub struct SessionManager {
    identity: String,
    config: SessionManagerConfig,
    runtime: Runtime,
    handler: Arc<dyn SessionHandler>,
    sessions: RwLock<HashMap<SessionId, Weak<Session>>>,
    forbidden: HashSet<u32>,
    metrics: SessionMetrics,
    local_addr: Mutex<Option<SocketAddr>>,
    listener: Mutex<Option<(ReactorHandle, Token)>>,
    timers: Mutex<Vec<TimerHandle>>,
    reconnect_pending: AtomicBool,
    shutdown: AtomicBool,
    weak_self: Weak<SessionManager>,
}

impl SessionManager {
    /// 按 `handler.identity()` 读取 `[managers.*]` 配置并创建管理器
    pub fn new<H: SessionHandler>(runtime: &Runtime, handler: H) -> Result<Arc<Self>> {
        let config = runtime.config().manager(handler.identity())?.clone();
        Self::with_config(runtime, config, handler)
    }

    /// 使用指定配置创建管理器
    pub fn with_config<H: SessionHandler>(
        runtime: &Runtime,
        config: SessionManagerConfig,
        handler: H,
    ) -> Result<Arc<Self>> {
        let identity = handler.identity().to_string();
        config.validate(&identity)?;
        let forbidden = config.forbidden_protocols.iter().copied().collect();
        let manager = Arc::new_cyclic(|weak_self| Self {
            identity,
            config,
            runtime: runtime.clone(),
            handler: Arc::new(handler),
            sessions: RwLock::new(HashMap::new()),
            forbidden,
            metrics: SessionMetrics::new(),
            local_addr: Mutex::new(None),
            listener: Mutex::new(None),
            timers: Mutex::new(Vec::new()),
            reconnect_pending: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            weak_self: weak_self.clone(),
        });
        manager.start_keepalive()?;
        debug!(manager = %manager.identity, "会话管理器已创建");
        Ok(manager)
    }

    /// 名称
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// 配置
    pub fn config(&self) -> &SessionManagerConfig {
        &self.config
    }

    /// 运行时
    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// 会话处理器
    pub fn handler(&self) -> &Arc<dyn SessionHandler> {
        &self.handler
    }

    /// 指标
    pub fn metrics(&self) -> &SessionMetrics {
        &self.metrics
    }

    /// 监听地址，`listen` 之前为 `None`
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub(crate) fn forbidden(&self) -> &HashSet<u32> {
        &self.forbidden
    }

    fn resolve(&self) -> Result<SocketAddr> {
        let addr = self.config.bind_addr();
        addr.to_socket_addrs()
            .map_err(|e| NimbusError::from(e).with_context(("address", addr.clone())))?
            .next()
            .ok_or_else(|| NimbusError::config(format!("无法解析地址: {}", addr)))
    }

    /// 开始监听，返回实际监听地址
    pub fn listen(&self) -> Result<SocketAddr> {
        let addr = self.resolve()?;
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket
            .bind(&addr.into())
            .map_err(|e| NimbusError::network(format!("绑定地址 {} 失败: {}", addr, e)))?;
        socket.listen(LISTEN_BACKLOG)?;
        let listener = TcpListener::from_std(socket.into());
        let local = listener.local_addr()?;

        let main = self.runtime.main_reactor();
        let token = main.add_event(Box::new(PassiveIo::new(listener, self.weak_self.clone())));
        *self.listener.lock() = Some((main.clone(), token));
        *self.local_addr.lock() = Some(local);
        info!(manager = %self.identity, addr = %local, "开始监听");
        Ok(local)
    }

    /// 发起连接，连接建立后会话挂在主 Reactor 上
    pub fn connect(&self) -> Result<()> {
        let result = self.resolve().and_then(|addr| {
            let stream = TcpStream::connect(addr)?;
            Ok((stream, addr))
        });
        match result {
            Ok((stream, addr)) => {
                debug!(manager = %self.identity, addr = %addr, "发起连接");
                self.runtime
                    .main_reactor()
                    .add_event(Box::new(ActiveIo::new(stream, addr, self.weak_self.clone())));
                Ok(())
            }
            Err(e) => {
                warn!(manager = %self.identity, error = %e, "发起连接失败");
                self.schedule_reconnect();
                Err(e)
            }
        }
    }

    /// 监听事件接受的新连接
    pub(crate) fn accept(&self, stream: TcpStream, peer: SocketAddr) {
        if self.shutdown.load(Ordering::Acquire) {
            return;
        }
        if self.session_count() >= self.config.max_connections {
            self.metrics.record_rejected();
            warn!(
                manager = %self.identity,
                peer = %peer,
                max = self.config.max_connections,
                "连接数已达上限，拒绝连接"
            );
            return;
        }
        let reactor = self.runtime.reactors().select().clone();
        self.spawn_stream(stream, peer, &reactor);
    }

    /// 为已建立的连接创建会话，并注册到 `reactor`
    pub(crate) fn spawn_stream(&self, stream: TcpStream, peer: SocketAddr, reactor: &ReactorHandle) {
        let Some(manager) = self.weak_self.upgrade() else {
            return;
        };
        configure_stream(&stream);
        let sid = self.runtime.next_session_id();
        let session = Arc::new(Session::new(
            sid,
            peer,
            self.config.write_buffer_size,
            self.handler.create_session(sid),
        ));
        let token = reactor.reserve_token();
        session.bind(reactor.clone(), token);
        self.sessions.write().insert(sid, Arc::downgrade(&session));
        self.metrics.inc_sessions();

        reactor.add_event_at(
            token,
            Box::new(StreamIo::new(stream, Arc::clone(&session), Arc::clone(&manager))),
        );
        session.set_state(SessionState::Active);
        session.touch();
        info!(manager = %self.identity, sid = %sid, peer = %peer, reactor = reactor.id(), "会话建立");
        self.handler.on_add_session(self, &session);
    }

    /// 会话的 I/O 事件销毁时调用
    pub(crate) fn on_session_closed(&self, session: &Session) {
        if self.sessions.write().remove(&session.sid()).is_none() {
            return;
        }
        self.metrics.dec_sessions();
        info!(manager = %self.identity, sid = %session.sid(), peer = %session.peer_addr(), "会话关闭");
        self.handler.on_del_session(self, session);
        self.schedule_reconnect();
    }

    pub(crate) fn on_connect_failed(&self, peer: SocketAddr) {
        warn!(manager = %self.identity, peer = %peer, "连接失败");
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&self) {
        let Some(interval) = self.config.reconnect_interval() else {
            return;
        };
        if self.shutdown.load(Ordering::Acquire) || self.reconnect_pending.swap(true, Ordering::AcqRel) {
            return;
        }
        let weak = self.weak_self.clone();
        let scheduled = self.runtime.timers().add_oneshot(interval, move || {
            if let Some(manager) = weak.upgrade() {
                manager.reconnect_pending.store(false, Ordering::Release);
                if !manager.shutdown.load(Ordering::Acquire) {
                    info!(manager = %manager.identity, "尝试重连");
                    // 失败时 connect 会再次安排重连
                    if let Err(e) = manager.connect() {
                        debug!(manager = %manager.identity, error = %e, "重连失败，等待下一次");
                    }
                }
            }
        });
        match scheduled {
            // 触发时会检查 shutdown，不需要保存句柄
            Ok(_) => {}
            Err(e) => {
                self.reconnect_pending.store(false, Ordering::Release);
                warn!(manager = %self.identity, error = %e, "安排重连失败");
            }
        }
    }

    fn start_keepalive(&self) -> Result<()> {
        let Some(timeout) = self.config.keepalive_timeout() else {
            return Ok(());
        };
        let interval = (timeout / 2).max(MIN_KEEPALIVE_CHECK);
        let weak = self.weak_self.clone();
        let timer = self
            .runtime
            .timers()
            .add_timer(true, interval, Repeat::Forever, move || match weak.upgrade() {
                Some(manager) => {
                    manager.check_keepalive(timeout);
                    true
                }
                None => false,
            })?;
        self.timers.lock().push(timer);
        Ok(())
    }

    /// 关闭空闲超过 `timeout` 的会话，返回关闭的数量
    pub fn check_keepalive(&self, timeout: Duration) -> usize {
        let idle: Vec<Arc<Session>> = self
            .sessions()
            .into_iter()
            .filter(|s| s.idle_time() > timeout)
            .collect();
        for session in &idle {
            info!(
                manager = %self.identity,
                sid = %session.sid(),
                idle_ms = session.idle_time().as_millis() as u64,
                "会话空闲超时"
            );
            session.close();
        }
        idle.len()
    }

    /// 在工作线程上处理解码出的协议
    pub(crate) fn handle_protocol(self: &Arc<Self>, sid: SessionId, protocol: Box<dyn Protocol>) {
        let cx = ProtocolContext {
            runtime: self.runtime.clone(),
            manager: Arc::clone(self),
            sid,
        };
        self.handler.handle_protocol(cx, protocol);
    }

    /// 查找会话
    pub fn find_session(&self, sid: SessionId) -> Option<Arc<Session>> {
        self.sessions.read().get(&sid).and_then(Weak::upgrade)
    }

    /// 所有存活的会话
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// 当前会话数
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// 发送协议
    pub fn send_protocol(&self, sid: SessionId, protocol: &dyn Protocol) -> bool {
        let Some(session) = self.find_session(sid) else {
            debug!(manager = %self.identity, sid = %sid, protocol = protocol.name(), "会话不存在，丢弃协议");
            return false;
        };
        SCRATCH.with(|scratch| {
            let mut os = scratch.borrow_mut();
            os.clear();
            encode_protocol(protocol, &mut os);
            let sent = self.push_octets(&session, os.data());
            os.clear();
            sent
        })
    }

    /// 发送已编码好的数据
    pub fn send_octets(&self, sid: SessionId, data: &[u8]) -> bool {
        match self.find_session(sid) {
            Some(session) => self.push_octets(&session, data),
            None => false,
        }
    }

    fn push_octets(&self, session: &Session, data: &[u8]) -> bool {
        if session.send_octets(data) {
            self.metrics.record_frame_sent();
            true
        } else {
            self.metrics.record_frame_dropped();
            false
        }
    }

    /// 关闭会话
    pub fn close_session(&self, sid: SessionId) -> bool {
        match self.find_session(sid) {
            Some(session) => {
                session.close();
                true
            }
            None => false,
        }
    }

    /// 停止监听和定时器，关闭所有会话
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        for timer in self.timers.lock().drain(..) {
            self.runtime.timers().del_timer(timer);
        }
        if let Some((reactor, token)) = self.listener.lock().take() {
            reactor.del_event(token);
        }
        for session in self.sessions() {
            session.close();
        }
        info!(manager = %self.identity, "会话管理器已关闭");
    }
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("identity", &self.identity)
            .field("local_addr", &self.local_addr())
            .field("sessions", &self.session_count())
            .finish()
    }
}
