//! Reactor 模式实现
//!
//! 基于 mio 的单线程事件循环，可选多个子 Reactor 分担连接。

pub mod balancer;
pub mod group;
pub mod handle;
pub mod reactor;
mod signal;

// 重新导出主要类型
pub use balancer::{LeastConnections, LoadBalance, RandomPick, RoundRobin, balancer_for};
pub use group::ReactorGroup;
pub use handle::{ReactorHandle, ReactorTimerHandler, ReactorTimerId, SignalHandler};
pub use reactor::Reactor;
