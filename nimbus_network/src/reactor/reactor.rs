//! Reactor 事件循环
//!
//! 每个 Reactor 独占一个线程和一个多路复用器。其他线程通过 [`ReactorHandle`]
//! 写入变更队列，Reactor 在每轮循环开始时统一应用。

use crate::demultiplexer::{Demultiplexer, Epoller, SIGNAL_TOKEN, WAKER_TOKEN};
use crate::event::{EventContext, EventMask, IoEvent};
use crate::reactor::handle::{
    EventChange, ReactorHandle, ReactorTimerHandler, ReactorTimerId, SignalHandler,
};
use crate::reactor::signal::SignalPipe;
use mio::Token;
use mio::unix::SourceFd;
use nimbus_config::ReactorConfig;
use nimbus_core::{NimbusError, Result};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// 定时器最小间隔
const MIN_TIMER_INTERVAL: Duration = Duration::from_millis(1);

struct ReactorTimer {
    interval: Duration,
    handler: ReactorTimerHandler,
}

/// Reactor
pub struct Reactor {
    handle: ReactorHandle,
    demux: Box<dyn Demultiplexer>,
    io_events: HashMap<Token, Box<dyn IoEvent>>,
    /// 按 (到期时间, ID) 排序
    timers: BTreeMap<(Instant, ReactorTimerId), ReactorTimer>,
    timer_deadlines: HashMap<ReactorTimerId, Instant>,
    /// 已取消但尚未到期的定时器
    cancelled: HashSet<ReactorTimerId>,
    signals: HashMap<i32, SignalHandler>,
    signal_pipe: Option<SignalPipe>,
    idle_timeout: Duration,
    use_timer_thread: bool,
    ready: Vec<(Token, EventMask)>,
}

impl Reactor {
    /// 创建 Reactor
    pub fn new(config: &ReactorConfig, id: usize) -> Result<Self> {
        let demux: Box<dyn Demultiplexer> = match config.demultiplexer.as_str() {
            "epoller" => Box::new(Epoller::new()?),
            other => {
                return Err(NimbusError::config(format!("不支持的多路复用器: {}", other)));
            }
        };
        let handle = ReactorHandle::new(id, demux.wakeup());
        Ok(Self {
            handle,
            demux,
            io_events: HashMap::new(),
            timers: BTreeMap::new(),
            timer_deadlines: HashMap::new(),
            cancelled: HashSet::new(),
            signals: HashMap::new(),
            signal_pipe: None,
            idle_timeout: config.timeout(),
            use_timer_thread: config.use_timer_thread,
            ready: Vec::new(),
        })
    }

    /// 获取句柄
    pub fn handle(&self) -> ReactorHandle {
        self.handle.clone()
    }

    /// 当前管理的 I/O 事件数
    pub fn event_count(&self) -> usize {
        self.io_events.len()
    }

    /// 当前的定时器数
    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }

    /// 运行事件循环，直到 [`ReactorHandle::stop`] 被调用
    pub fn run(&mut self) -> Result<()> {
        info!(reactor = self.handle.id(), "Reactor 启动");
        let result = loop {
            if !self.handle.is_running() {
                break Ok(());
            }
            if let Err(e) = self.run_once() {
                error!(reactor = self.handle.id(), error = %e, "Reactor 循环出错");
                break Err(e);
            }
        };
        self.shutdown();
        info!(reactor = self.handle.id(), "Reactor 已停止");
        result
    }

    /// 执行一轮循环
    pub fn run_once(&mut self) -> Result<()> {
        self.handle.inner.wakeup.reset();
        self.load_event();

        let timeout = self.poll_timeout(Instant::now());
        let mut ready = std::mem::take(&mut self.ready);
        ready.clear();
        self.demux.dispatch(Some(timeout), &mut ready)?;
        for (token, mask) in ready.drain(..) {
            self.deliver(token, mask);
        }
        self.ready = ready;

        self.run_timers(Instant::now());
        Ok(())
    }

    fn poll_timeout(&self, now: Instant) -> Duration {
        if !self.handle.is_running() || self.handle.inner.wakeup.is_pending() {
            return Duration::ZERO;
        }
        match self.timers.first_key_value() {
            Some(((at, _), _)) if !self.use_timer_thread => {
                self.idle_timeout.min(at.saturating_duration_since(now))
            }
            _ => self.idle_timeout,
        }
    }

    fn load_event(&mut self) {
        let handle = self.handle.clone();
        let applied = handle.inner.changes.drain(|change| self.apply(change));
        if applied > 0 {
            trace!(reactor = handle.id(), applied, "已应用变更");
        }
    }

    fn apply(&mut self, change: EventChange) {
        match change {
            EventChange::Add(token, event) => self.insert_event(token, event),
            EventChange::Refresh(token) => self.refresh_event(token),
            EventChange::Remove(token) => self.remove_event(token),
            EventChange::AddTimer {
                id,
                delay,
                interval,
                handler,
            } => {
                let interval = interval.max(MIN_TIMER_INTERVAL);
                let now = Instant::now();
                let at = if delay { now + interval } else { now };
                self.timers.insert((at, id), ReactorTimer { interval, handler });
                self.timer_deadlines.insert(id, at);
            }
            EventChange::DelTimer(id) => {
                if self.timer_deadlines.contains_key(&id) {
                    self.cancelled.insert(id);
                }
            }
            EventChange::AddSignal(signo, handler) => self.insert_signal(signo, handler),
        }
    }

    fn insert_event(&mut self, token: Token, mut event: Box<dyn IoEvent>) {
        let mask = event.events();
        let result = match event.source() {
            Some(source) => self.demux.add_event(token, source, mask),
            None => Ok(()),
        };
        if let Err(e) = result {
            warn!(token = token.0, name = event.name(), error = %e, "注册事件失败，丢弃");
            self.notify_removed(token, event);
            return;
        }
        debug!(reactor = self.handle.id(), token = token.0, name = event.name(), "注册事件");
        if let Some(old) = self.io_events.insert(token, event) {
            warn!(token = token.0, name = old.name(), "token 重复，旧事件被替换");
        }
        self.update_load();
    }

    fn refresh_event(&mut self, token: Token) {
        let Some(event) = self.io_events.get_mut(&token) else {
            return;
        };
        let mask = event.events();
        let result = match event.source() {
            Some(source) => self.demux.add_event(token, source, mask),
            None => Ok(()),
        };
        if let Err(e) = result {
            warn!(token = token.0, error = %e, "修改事件失败，移除");
            self.remove_event(token);
        }
    }

    fn remove_event(&mut self, token: Token) {
        let Some(mut event) = self.io_events.remove(&token) else {
            return;
        };
        let result = match event.source() {
            Some(source) => self.demux.del_event(token, source),
            None => Ok(()),
        };
        if let Err(e) = result {
            debug!(token = token.0, error = %e, "注销事件失败");
        }
        debug!(reactor = self.handle.id(), token = token.0, name = event.name(), "移除事件");
        self.notify_removed(token, event);
        self.update_load();
    }

    fn notify_removed(&self, token: Token, mut event: Box<dyn IoEvent>) {
        let mut cx = EventContext {
            token,
            handle: &self.handle,
        };
        event.on_removed(&mut cx);
    }

    fn update_load(&self) {
        self.handle
            .inner
            .io_count
            .store(self.io_events.len(), Ordering::Relaxed);
    }

    fn insert_signal(&mut self, signo: i32, handler: SignalHandler) {
        if self.signal_pipe.is_none() {
            let pipe = match SignalPipe::new() {
                Ok(pipe) => pipe,
                Err(e) => {
                    error!(error = %e, "创建信号管道失败");
                    return;
                }
            };
            let fd = pipe.read_fd();
            if let Err(e) = self
                .demux
                .add_event(SIGNAL_TOKEN, &mut SourceFd(&fd), EventMask::SIGNAL)
            {
                error!(error = %e, "注册信号管道失败");
                return;
            }
            self.signal_pipe = Some(pipe);
        }
        if let Some(pipe) = self.signal_pipe.as_mut() {
            match pipe.install(signo) {
                Ok(()) => {
                    self.signals.insert(signo, handler);
                }
                Err(e) => warn!(signo, error = %e, "安装信号处理函数失败"),
            }
        }
    }

    fn handle_signals(&mut self) {
        let Some(pipe) = self.signal_pipe.as_ref() else {
            return;
        };
        for signo in pipe.drain() {
            debug!(signo, "收到信号");
            let keep = match self.signals.get_mut(&signo) {
                Some(handler) => handler(signo),
                None => continue,
            };
            if !keep {
                self.signals.remove(&signo);
                if let Some(pipe) = self.signal_pipe.as_mut() {
                    pipe.uninstall(signo);
                }
            }
        }
    }

    fn deliver(&mut self, token: Token, mask: EventMask) {
        match token {
            WAKER_TOKEN => {}
            SIGNAL_TOKEN => self.handle_signals(),
            _ => {
                let handle = &self.handle;
                let keep = match self.io_events.get_mut(&token) {
                    Some(event) => {
                        let mut cx = EventContext { token, handle };
                        event.handle_event(&mut cx, mask)
                    }
                    None => return,
                };
                if !keep {
                    self.remove_event(token);
                }
            }
        }
    }

    fn run_timers(&mut self, now: Instant) {
        while let Some(entry) = self.timers.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let ((at, id), mut timer) = entry.remove_entry();
            if self.cancelled.remove(&id) {
                self.timer_deadlines.remove(&id);
                continue;
            }
            if (timer.handler)() {
                let mut next = at + timer.interval;
                if next <= now {
                    next = now + timer.interval;
                }
                self.timers.insert((next, id), timer);
                self.timer_deadlines.insert(id, next);
            } else {
                self.timer_deadlines.remove(&id);
            }
        }
    }

    fn shutdown(&mut self) {
        self.handle.inner.running.store(false, Ordering::Release);
        self.load_event();
        let tokens: Vec<Token> = self.io_events.keys().copied().collect();
        for token in tokens {
            self.remove_event(token);
        }
        self.timers.clear();
        self.timer_deadlines.clear();
        self.cancelled.clear();
        self.signals.clear();
        if let Some(pipe) = self.signal_pipe.take() {
            let fd = pipe.read_fd();
            let _ = self.demux.del_event(SIGNAL_TOKEN, &mut SourceFd(&fd));
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        if !self.io_events.is_empty() {
            self.shutdown();
        }
    }
}
