//! Reactor 均衡器
//!
//! 负责将新连接分配给不同的子 Reactor。

use nimbus_config::LoadBalanceKind;
use rand::Rng;
use std::fmt::Debug;
use std::sync::atomic::{AtomicUsize, Ordering};

/// 负载均衡策略
pub trait LoadBalance: Send + Sync + Debug {
    /// 根据各 Reactor 当前负载选出下标
    fn next_reactor(&self, loads: &[usize]) -> usize;

    /// 策略名称
    fn name(&self) -> &'static str;
}

/// 轮询
#[derive(Debug, Default)]
pub struct RoundRobin {
    current: AtomicUsize,
}

impl LoadBalance for RoundRobin {
    fn next_reactor(&self, loads: &[usize]) -> usize {
        assert!(!loads.is_empty(), "Reactor count must be greater than 0");
        let idx = self.current.fetch_add(1, Ordering::Relaxed);
        idx % loads.len()
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}

/// 随机
#[derive(Debug, Default)]
pub struct RandomPick;

impl LoadBalance for RandomPick {
    fn next_reactor(&self, loads: &[usize]) -> usize {
        assert!(!loads.is_empty(), "Reactor count must be greater than 0");
        rand::thread_rng().gen_range(0..loads.len())
    }

    fn name(&self) -> &'static str {
        "random"
    }
}

/// 最少连接，负载相同时取下标最小的
#[derive(Debug, Default)]
pub struct LeastConnections;

impl LoadBalance for LeastConnections {
    fn next_reactor(&self, loads: &[usize]) -> usize {
        assert!(!loads.is_empty(), "Reactor count must be greater than 0");
        loads
            .iter()
            .enumerate()
            .min_by_key(|&(idx, load)| (*load, idx))
            .map(|(idx, _)| idx)
            .unwrap_or(0)
    }

    fn name(&self) -> &'static str {
        "least_connections"
    }
}

/// 按配置创建均衡器
pub fn balancer_for(kind: LoadBalanceKind) -> Box<dyn LoadBalance> {
    match kind {
        LoadBalanceKind::RoundRobin => Box::new(RoundRobin::default()),
        LoadBalanceKind::Random => Box::new(RandomPick),
        LoadBalanceKind::LeastConnections => Box::new(LeastConnections),
    }
}
