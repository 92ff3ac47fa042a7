//! 运行时上下文
//!
//! 持有配置、线程池、定时器服务、Reactor 组、协议注册表和 RPC 追踪器。
//! 克隆开销很小，所有组件都显式接收它。

use crate::protocol::{Protocol, ProtocolRegistry};
use crate::reactor::{Reactor, ReactorGroup, ReactorHandle};
use crate::rpc::{Rpc, RpcHandler, RpcTracker};
use crate::session::{SessionId, SessionIdGenerator};
use crate::timer::TimerService;
use nimbus_config::NimbusConfig;
use nimbus_core::{NimbusError, Result, ThreadPool, TimeWheel};
use parking_lot::Mutex;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{error, info};

struct RuntimeInner {
    config: NimbusConfig,
    threadpool: ThreadPool,
    timers: TimerService,
    reactors: ReactorGroup,
    registry: ProtocolRegistry,
    rpc: Arc<RpcTracker>,
    session_ids: SessionIdGenerator,
    wheel_thread: Mutex<Option<JoinHandle<()>>>,
    shutdown: AtomicBool,
}

impl Drop for RuntimeInner {
    fn drop(&mut self) {
        // 最后一个引用可能在时间轮线程上释放，这里不 join
        if let TimerService::Wheel(wheel) = &self.timers {
            wheel.stop();
        }
    }
}

/// 运行时
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    /// 配置
    pub fn config(&self) -> &NimbusConfig {
        &self.inner.config
    }

    /// 线程池
    pub fn threadpool(&self) -> &ThreadPool {
        &self.inner.threadpool
    }

    /// 定时器服务
    pub fn timers(&self) -> &TimerService {
        &self.inner.timers
    }

    /// 时间轮，仅在启用独立定时器线程时存在
    pub fn wheel(&self) -> Option<&Arc<TimeWheel>> {
        match &self.inner.timers {
            TimerService::Wheel(wheel) => Some(wheel),
            TimerService::Reactor(_) => None,
        }
    }

    /// Reactor 组
    pub fn reactors(&self) -> &ReactorGroup {
        &self.inner.reactors
    }

    /// 主 Reactor
    pub fn main_reactor(&self) -> &ReactorHandle {
        self.inner.reactors.main()
    }

    /// 协议注册表
    pub fn registry(&self) -> &ProtocolRegistry {
        &self.inner.registry
    }

    /// RPC 追踪器
    pub fn rpc(&self) -> &Arc<RpcTracker> {
        &self.inner.rpc
    }

    /// 分配会话 ID
    pub fn next_session_id(&self) -> SessionId {
        self.inner.session_ids.next()
    }

    /// 是否已经关闭
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// 关闭运行时
    ///
    /// 依次丢弃未完成的 RPC、停止子 Reactor、主 Reactor、时间轮和线程池。
    /// 会等待线程池中的任务完成，不要在工作线程上调用。
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("关闭运行时");
        self.inner.rpc.clear();
        self.inner.reactors.stop();
        self.main_reactor().stop();
        if let TimerService::Wheel(wheel) = &self.inner.timers {
            wheel.stop();
        }
        if let Some(thread) = self.inner.wheel_thread.lock().take() {
            if thread.thread().id() != thread::current().id() && thread.join().is_err() {
                error!("时间轮线程 panic");
            }
        }
        self.inner.threadpool.stop();
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("timers", &self.inner.timers)
            .field("reactors", &self.inner.reactors)
            .field("registry", &self.inner.registry)
            .field("rpc", &self.inner.rpc)
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

/// 运行时构建器
///
/// # 示例
///
/// ```rust,no_run
/// use nimbus_config::NimbusConfig;
/// use nimbus_network::runtime::RuntimeBuilder;
///
/// # fn main() -> nimbus_core::Result<()> {
/// let (runtime, mut reactor) = RuntimeBuilder::new(NimbusConfig::default()).build()?;
/// reactor.run()?;
/// runtime.shutdown();
/// # Ok(())
/// # }
/// ```
pub struct RuntimeBuilder {
    config: NimbusConfig,
    registry: ProtocolRegistry,
    rpc_handlers: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    manual_timer: bool,
}

impl RuntimeBuilder {
    /// 使用给定配置，尚未注册任何协议
    pub fn new(config: NimbusConfig) -> Self {
        Self {
            config,
            registry: ProtocolRegistry::new(),
            rpc_handlers: HashMap::new(),
            manual_timer: false,
        }
    }

    /// 注册协议原型
    pub fn register(mut self, protocol: Box<dyn Protocol>) -> Result<Self> {
        self.registry.register(protocol)?;
        Ok(self)
    }

    /// 注册 RPC，同一个处理器类型只能注册一次
    pub fn register_rpc<H: RpcHandler>(mut self, handler: H) -> Result<Self> {
        if self.rpc_handlers.contains_key(&TypeId::of::<H>()) {
            return Err(NimbusError::validation(format!("RPC {} 重复注册", H::NAME)));
        }
        let handler = Arc::new(handler);
        self.registry
            .register(Box::new(Rpc::new(Arc::clone(&handler))))?;
        self.rpc_handlers.insert(TypeId::of::<H>(), handler);
        Ok(self)
    }

    /// 不启动时间轮线程，由调用方手动 `tick`
    pub fn manual_timer(mut self, manual: bool) -> Self {
        self.manual_timer = manual;
        self
    }

    /// 构建运行时，返回运行时和需要在当前线程驱动的主 Reactor
    pub fn build(self) -> Result<(Runtime, Reactor)> {
        let RuntimeBuilder {
            config,
            registry,
            rpc_handlers,
            manual_timer,
        } = self;
        config.validate()?;

        let reactor = Reactor::new(&config.reactor, 0)?;
        let main = reactor.handle();
        let threadpool = ThreadPool::new(&config.threadpool)?;

        let (timers, wheel_thread) = if config.reactor.use_timer_thread {
            let wheel = Arc::new(TimeWheel::new(&config.timer)?);
            let thread = if manual_timer {
                None
            } else {
                Some(wheel.spawn()?)
            };
            (TimerService::Wheel(wheel), thread)
        } else {
            (TimerService::Reactor(main.clone()), None)
        };

        let reactors = ReactorGroup::start(&config.reactor, main)?;
        let rpc = RpcTracker::new(timers.clone(), rpc_handlers);
        info!(
            protocols = registry.len(),
            sub_reactors = reactors.subs().len(),
            timer_thread = config.reactor.use_timer_thread,
            "运行时已创建"
        );

        let runtime = Runtime {
            inner: Arc::new(RuntimeInner {
                config,
                threadpool,
                timers,
                reactors,
                registry,
                rpc,
                session_ids: SessionIdGenerator::new(),
                wheel_thread: Mutex::new(wheel_thread),
                shutdown: AtomicBool::new(false),
            }),
        };
        Ok((runtime, reactor))
    }
}

impl fmt::Debug for RuntimeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeBuilder")
            .field("registry", &self.registry)
            .field("rpc_handlers", &self.rpc_handlers.len())
            .field("manual_timer", &self.manual_timer)
            .finish()
    }
}
