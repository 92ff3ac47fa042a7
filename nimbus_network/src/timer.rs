//! 定时器服务
//!
//! 启用独立时间轮线程时定时器交给 [`TimeWheel`]，否则作为 Reactor 定时事件执行。
//! RPC 超时和会话保活只依赖这里的接口。

use crate::reactor::{ReactorHandle, ReactorTimerId};
use nimbus_core::{PoolError, Repeat, TimeWheel, TimerId};
use std::sync::Arc;
use std::time::Duration;

/// 定时器句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerHandle {
    /// 时间轮定时器
    Wheel(TimerId),
    /// Reactor 定时器
    Reactor(ReactorTimerId),
}

/// 定时器服务
#[derive(Debug, Clone)]
pub enum TimerService {
    /// 独立线程驱动的时间轮
    Wheel(Arc<TimeWheel>),
    /// 主 Reactor
    Reactor(ReactorHandle),
}

impl TimerService {
    /// 添加定时器
    pub fn add_timer<F>(
        &self,
        delay: bool,
        interval: Duration,
        repeat: Repeat,
        mut handler: F,
    ) -> Result<TimerHandle, PoolError>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        match self {
            TimerService::Wheel(wheel) => wheel
                .add_timer(delay, interval, repeat, handler)
                .map(TimerHandle::Wheel),
            TimerService::Reactor(handle) => {
                let mut repeat = repeat;
                let id = handle.add_timer(
                    delay,
                    interval,
                    Box::new(move || handler() && repeat.next()),
                );
                Ok(TimerHandle::Reactor(id))
            }
        }
    }

    /// 一次性定时器
    pub fn add_oneshot<F>(&self, delay: Duration, handler: F) -> Result<TimerHandle, PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut handler = Some(handler);
        self.add_timer(true, delay, Repeat::Times(1), move || {
            if let Some(f) = handler.take() {
                f();
            }
            false
        })
    }

    /// 删除定时器
    pub fn del_timer(&self, timer: TimerHandle) -> bool {
        match (self, timer) {
            (TimerService::Wheel(wheel), TimerHandle::Wheel(id)) => wheel.del_timer(id),
            (TimerService::Reactor(handle), TimerHandle::Reactor(id)) => {
                handle.del_timer(id);
                true
            }
            _ => false,
        }
    }

    /// 是否由时间轮驱动
    pub fn is_wheel(&self) -> bool {
        matches!(self, TimerService::Wheel(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::Reactor;
    use nimbus_config::{ReactorConfig, TimerConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    #[test]
    fn test_wheel_oneshot() {
        let wheel = Arc::new(TimeWheel::new(&TimerConfig::default()).unwrap());
        let service = TimerService::Wheel(Arc::clone(&wheel));
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        service
            .add_oneshot(Duration::from_millis(1), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        for _ in 0..5 {
            wheel.tick();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(service.is_wheel());
    }

    #[test]
    fn test_reactor_repeat_times() {
        let config = ReactorConfig {
            timeout: 5,
            use_timer_thread: false,
            ..Default::default()
        };
        let mut reactor = Reactor::new(&config, 0).unwrap();
        let service = TimerService::Reactor(reactor.handle());
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        service
            .add_timer(true, Duration::from_millis(1), Repeat::Times(3), move || {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            })
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while fired.load(Ordering::SeqCst) < 3 {
            assert!(Instant::now() < deadline);
            reactor.run_once().unwrap();
        }
        let settle = Instant::now() + Duration::from_millis(20);
        while Instant::now() < settle {
            reactor.run_once().unwrap();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        assert_eq!(reactor.timer_count(), 0);
    }

    #[test]
    fn test_mismatched_handle() {
        let wheel = Arc::new(TimeWheel::new(&TimerConfig::default()).unwrap());
        let reactor = Reactor::new(&ReactorConfig::default(), 0).unwrap();
        let wheel_service = TimerService::Wheel(wheel);
        let reactor_service = TimerService::Reactor(reactor.handle());
        let handle = reactor_service
            .add_timer(true, Duration::from_secs(1), Repeat::Forever, || true)
            .unwrap();
        assert!(!wheel_service.del_timer(handle));
        assert!(reactor_service.del_timer(handle));
    }
}
