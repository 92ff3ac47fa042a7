//! 应用构建器
//!
//! 把配置、协议注册、会话管理器和主 Reactor 串起来，适合常见的单进程服务。
//!
//! # 示例
//!
//! ```rust,no_run,ignore
//! use nimbus::App;
//!
//! fn main() -> nimbus::Result<()> {
//!     App::from_file("nimbus.toml")?
//!         .register_rpc(MyRpc)?
//!         .listen(MyHandler)
//!         .run()
//! }
//! ```

use crate::error::{Error, Result};
use nimbus_config::NimbusConfig;
use nimbus_network::{
    Protocol, Reactor, RpcHandler, Runtime, RuntimeBuilder, SessionHandler, SessionManager,
};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

type ManagerFactory = Box<dyn FnOnce(&Runtime) -> nimbus_core::Result<Arc<SessionManager>>>;

enum Role {
    Listen,
    Connect,
}

/// 应用构建器
pub struct App {
    builder: RuntimeBuilder,
    managers: Vec<(Role, ManagerFactory)>,
    stop_signals: Vec<i32>,
}

impl App {
    /// 使用给定配置
    pub fn new(config: NimbusConfig) -> Self {
        Self {
            builder: RuntimeBuilder::new(config),
            managers: Vec::new(),
            stop_signals: vec![libc::SIGINT, libc::SIGTERM],
        }
    }

    /// 从 TOML 文件加载配置，并应用环境变量覆盖
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::new(NimbusConfig::from_file_with_env(path)?))
    }

    /// 注册协议原型
    pub fn register(mut self, protocol: Box<dyn Protocol>) -> Result<Self> {
        self.builder = self.builder.register(protocol)?;
        Ok(self)
    }

    /// 注册 RPC
    pub fn register_rpc<H: RpcHandler>(mut self, handler: H) -> Result<Self> {
        self.builder = self.builder.register_rpc(handler)?;
        Ok(self)
    }

    /// 添加一个监听的会话管理器，配置取自 `[managers.<identity>]`
    pub fn listen<H: SessionHandler>(mut self, handler: H) -> Self {
        self.managers.push((
            Role::Listen,
            Box::new(move |runtime: &Runtime| SessionManager::new(runtime, handler)),
        ));
        self
    }

    /// 添加一个主动连接的会话管理器，配置取自 `[managers.<identity>]`
    pub fn connect<H: SessionHandler>(mut self, handler: H) -> Self {
        self.managers.push((
            Role::Connect,
            Box::new(move |runtime: &Runtime| SessionManager::new(runtime, handler)),
        ));
        self
    }

    /// 收到这些信号时停止主 Reactor，传空列表表示不处理信号
    pub fn stop_signals(mut self, signals: &[i32]) -> Self {
        self.stop_signals = signals.to_vec();
        self
    }

    /// 创建运行时和会话管理器，开始监听和连接
    pub fn build(self) -> Result<Server> {
        let App {
            builder,
            managers,
            stop_signals,
        } = self;
        let (runtime, reactor) = builder.build()?;

        let mut started = Vec::with_capacity(managers.len());
        for (role, factory) in managers {
            let manager = match factory(&runtime) {
                Ok(manager) => manager,
                Err(e) => {
                    shutdown_all(&runtime, &started);
                    return Err(e.into());
                }
            };
            let result = match role {
                Role::Listen => manager.listen().map(|addr| {
                    info!(manager = manager.identity(), addr = %addr, "监听已就绪");
                }),
                Role::Connect => manager.connect().or_else(|e| {
                    // 配置了重连时 connect 已经安排了下一次尝试
                    if manager.config().reconnect_interval().is_some() {
                        warn!(manager = manager.identity(), error = %e, "首次连接失败，等待重连");
                        Ok(())
                    } else {
                        Err(e)
                    }
                }),
            };
            started.push(manager);
            if let Err(e) = result {
                shutdown_all(&runtime, &started);
                return Err(e.into());
            }
        }

        let main = reactor.handle();
        for signo in stop_signals {
            let handle = main.clone();
            main.add_signal(
                signo,
                Box::new(move |signo| {
                    info!(signal = signo, "收到停止信号");
                    handle.stop();
                    false
                }),
            );
        }

        Ok(Server {
            runtime,
            reactor,
            managers: started,
        })
    }

    /// 构建并在当前线程运行，直到主 Reactor 停止
    pub fn run(self) -> Result<()> {
        self.build()?.run()
    }
}

impl fmt::Debug for App {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("App")
            .field("builder", &self.builder)
            .field("managers", &self.managers.len())
            .field("stop_signals", &self.stop_signals)
            .finish()
    }
}

fn shutdown_all(runtime: &Runtime, managers: &[Arc<SessionManager>]) {
    for manager in managers {
        manager.shutdown();
    }
    runtime.shutdown();
}

/// 已经启动的服务
pub struct Server {
    runtime: Runtime,
    reactor: Reactor,
    managers: Vec<Arc<SessionManager>>,
}

impl Server {
    /// 运行时
    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// 所有会话管理器
    pub fn managers(&self) -> &[Arc<SessionManager>] {
        &self.managers
    }

    /// 按名称查找会话管理器
    pub fn manager(&self, identity: &str) -> Option<&Arc<SessionManager>> {
        self.managers.iter().find(|m| m.identity() == identity)
    }

    /// 驱动主 Reactor，返回后关闭所有会话管理器和运行时
    pub fn run(mut self) -> Result<()> {
        info!(managers = self.managers.len(), "服务启动");
        let result = self.reactor.run().map_err(Error::from);
        shutdown_all(&self.runtime, &self.managers);
        info!("服务已停止");
        result
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("runtime", &self.runtime)
            .field(
                "managers",
                &self.managers.iter().map(|m| m.identity()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_config::{ReactorConfig, SessionManagerConfig};
    use std::collections::BTreeMap;
    use std::thread;
    use std::time::Duration;

    struct Gateway;

    impl SessionHandler for Gateway {
        fn identity(&self) -> &str {
            "gateway"
        }
    }

    fn config() -> NimbusConfig {
        let mut managers = BTreeMap::new();
        managers.insert(
            "gateway".to_string(),
            SessionManagerConfig {
                port: 0,
                ..Default::default()
            },
        );
        NimbusConfig {
            reactor: ReactorConfig {
                timeout: 10,
                ..Default::default()
            },
            managers,
            ..Default::default()
        }
    }

    #[test]
    fn test_build_and_stop() {
        let server = App::new(config())
            .stop_signals(&[])
            .listen(Gateway)
            .build()
            .unwrap();
        let manager = server.manager("gateway").unwrap();
        assert!(manager.local_addr().is_some());
        assert!(server.manager("missing").is_none());

        let main = server.runtime().main_reactor().clone();
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            main.stop();
        });
        server.run().unwrap();
        stopper.join().unwrap();
    }

    #[test]
    fn test_missing_manager_config() {
        struct Unknown;
        impl SessionHandler for Unknown {
            fn identity(&self) -> &str {
                "unknown"
            }
        }
        let result = App::new(config()).stop_signals(&[]).listen(Unknown).build();
        assert!(result.is_err());
    }
}
