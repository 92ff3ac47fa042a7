//! Reactor 组
//!
//! 主 Reactor 加若干子 Reactor，子 Reactor 各自运行在独立线程上。

use crate::reactor::balancer::{LoadBalance, balancer_for};
use crate::reactor::handle::ReactorHandle;
use crate::reactor::reactor::Reactor;
use nimbus_config::ReactorConfig;
use nimbus_core::Result;
use parking_lot::Mutex;
use std::thread::{self, JoinHandle};
use tracing::{error, info};

/// Reactor 组
#[derive(Debug)]
pub struct ReactorGroup {
    main: ReactorHandle,
    subs: Vec<ReactorHandle>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    balancer: Box<dyn LoadBalance>,
}

impl ReactorGroup {
    /// 按配置启动子 Reactor
    pub fn start(config: &ReactorConfig, main: ReactorHandle) -> Result<Self> {
        let mut subs = Vec::with_capacity(config.sub_reactor_count);
        let mut threads = Vec::with_capacity(config.sub_reactor_count);
        for id in 1..=config.sub_reactor_count {
            let mut reactor = Reactor::new(config, id)?;
            subs.push(reactor.handle());
            let thread = thread::Builder::new()
                .name(format!("nimbus-reactor-{}", id))
                .spawn(move || {
                    if let Err(e) = reactor.run() {
                        error!(reactor = id, error = %e, "子 Reactor 异常退出");
                    }
                })?;
            threads.push(thread);
        }
        let balancer = balancer_for(config.load_balance);
        if !subs.is_empty() {
            info!(count = subs.len(), balancer = balancer.name(), "子 Reactor 已启动");
        }
        Ok(Self {
            main,
            subs,
            threads: Mutex::new(threads),
            balancer,
        })
    }

    /// 主 Reactor
    pub fn main(&self) -> &ReactorHandle {
        &self.main
    }

    /// 子 Reactor 列表
    pub fn subs(&self) -> &[ReactorHandle] {
        &self.subs
    }

    /// 为新连接选择 Reactor，没有子 Reactor 时返回主 Reactor
    pub fn select(&self) -> &ReactorHandle {
        if self.subs.is_empty() {
            return &self.main;
        }
        let loads: Vec<usize> = self.subs.iter().map(ReactorHandle::load).collect();
        &self.subs[self.balancer.next_reactor(&loads) % self.subs.len()]
    }

    /// 停止并等待所有子 Reactor，主 Reactor 由持有者自行停止
    pub fn stop(&self) {
        for sub in &self.subs {
            sub.stop();
        }
        for thread in self.threads.lock().drain(..) {
            if thread.join().is_err() {
                error!("子 Reactor 线程 panic");
            }
        }
    }
}

impl Drop for ReactorGroup {
    fn drop(&mut self) {
        self.stop();
    }
}
