//! 多路复用器
//!
//! [`Epoller`] 基于 `mio::Poll`（Linux 上即 epoll），把就绪事件翻译成 [`EventMask`]。

use crate::event::{EventMask, EventStatus};
use mio::event::Source;
use mio::{Events, Poll, Token, Waker};
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::trace;

/// 唤醒事件的 token
pub const WAKER_TOKEN: Token = Token(usize::MAX);

/// 信号管道的 token
pub const SIGNAL_TOKEN: Token = Token(usize::MAX - 1);

/// 单次 dispatch 最多处理的事件数
const MAX_EVENTS: usize = 1024;

/// 多路复用器
pub trait Demultiplexer: Send {
    /// 注册或修改关注的事件，掩码中没有 I/O 兴趣时暂时注销
    fn add_event(&mut self, token: Token, source: &mut dyn Source, mask: EventMask) -> io::Result<()>;

    /// 注销事件
    fn del_event(&mut self, token: Token, source: &mut dyn Source) -> io::Result<()>;

    /// 等待就绪事件，最多阻塞 `timeout`
    fn dispatch(&mut self, timeout: Option<Duration>, ready: &mut Vec<(Token, EventMask)>) -> io::Result<()>;

    /// 唤醒器
    fn wakeup(&self) -> Arc<Wakeup>;
}

/// 跨线程唤醒
///
/// 两次 [`Wakeup::reset`] 之间无论调用多少次 [`Wakeup::wake`]，只会真正唤醒一次。
#[derive(Debug)]
pub struct Wakeup {
    waker: Waker,
    pending: AtomicBool,
}

impl Wakeup {
    /// 唤醒阻塞中的 dispatch
    pub fn wake(&self) {
        if !self.pending.swap(true, Ordering::AcqRel) {
            if let Err(e) = self.waker.wake() {
                tracing::error!(error = %e, "唤醒 Reactor 失败");
            }
        }
    }

    /// 清除唤醒标记
    pub fn reset(&self) {
        self.pending.store(false, Ordering::Release);
    }

    /// 是否有未处理的唤醒
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }
}

#[derive(Debug, Default)]
struct Registration {
    status: EventStatus,
    listener: bool,
}

/// 基于 mio 的多路复用器
pub struct Epoller {
    poll: Poll,
    events: Events,
    registrations: HashMap<Token, Registration>,
    wakeup: Arc<Wakeup>,
}

impl Epoller {
    /// 创建多路复用器
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        Ok(Self {
            poll,
            events: Events::with_capacity(MAX_EVENTS),
            registrations: HashMap::new(),
            wakeup: Arc::new(Wakeup {
                waker,
                pending: AtomicBool::new(false),
            }),
        })
    }

    /// 当前已注册的事件数
    pub fn registered(&self) -> usize {
        self.registrations
            .values()
            .filter(|r| r.status == EventStatus::Add)
            .count()
    }

    fn translate(&self, event: &mio::event::Event) -> EventMask {
        let listener = self
            .registrations
            .get(&event.token())
            .is_some_and(|r| r.listener);
        let mut mask = EventMask::empty();
        if event.is_readable() {
            mask |= if listener {
                EventMask::ACCEPT
            } else {
                EventMask::RECV
            };
        }
        if event.is_writable() {
            mask |= EventMask::SEND;
        }
        if event.is_read_closed() || event.is_write_closed() || event.is_error() {
            mask |= EventMask::HUP;
            if !listener {
                mask |= EventMask::RECV;
            }
        }
        mask
    }
}

impl Demultiplexer for Epoller {
    fn add_event(&mut self, token: Token, source: &mut dyn Source, mask: EventMask) -> io::Result<()> {
        let registry = self.poll.registry();
        let entry = self.registrations.entry(token).or_default();
        entry.listener = mask.contains(EventMask::ACCEPT);
        match (entry.status, mask.interest()) {
            (EventStatus::Add, Some(interest)) => {
                registry.reregister(source, token, interest)?;
            }
            (_, Some(interest)) => {
                registry.register(source, token, interest)?;
                entry.status = EventStatus::Add;
            }
            (EventStatus::Add, None) => {
                registry.deregister(source)?;
                entry.status = EventStatus::Del;
            }
            (_, None) => {}
        }
        trace!(token = token.0, mask = ?mask, "更新事件");
        Ok(())
    }

    fn del_event(&mut self, token: Token, source: &mut dyn Source) -> io::Result<()> {
        match self.registrations.remove(&token) {
            Some(Registration {
                status: EventStatus::Add,
                ..
            }) => self.poll.registry().deregister(source),
            _ => Ok(()),
        }
    }

    fn dispatch(&mut self, timeout: Option<Duration>, ready: &mut Vec<(Token, EventMask)>) -> io::Result<()> {
        loop {
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        for event in self.events.iter() {
            let token = event.token();
            let mask = if token == WAKER_TOKEN {
                EventMask::WAKEUP
            } else if token == SIGNAL_TOKEN {
                EventMask::SIGNAL
            } else {
                self.translate(event)
            };
            if !mask.is_empty() {
                ready.push((token, mask));
            }
        }
        Ok(())
    }

    fn wakeup(&self) -> Arc<Wakeup> {
        Arc::clone(&self.wakeup)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_wakeup_interrupts_dispatch() {
        let mut epoller = Epoller::new().unwrap();
        let wakeup = epoller.wakeup();
        let remote = Arc::clone(&wakeup);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.wake();
            remote.wake();
        });

        let start = Instant::now();
        let mut ready = Vec::new();
        epoller
            .dispatch(Some(Duration::from_secs(5)), &mut ready)
            .unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(ready, vec![(WAKER_TOKEN, EventMask::WAKEUP)]);
        assert!(wakeup.is_pending());
        wakeup.reset();
        assert!(!wakeup.is_pending());
        handle.join().unwrap();
    }

    fn wait_for(epoller: &mut Epoller, token: Token) -> EventMask {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut ready = Vec::new();
        while Instant::now() < deadline {
            ready.clear();
            epoller
                .dispatch(Some(Duration::from_millis(100)), &mut ready)
                .unwrap();
            if let Some((_, mask)) = ready.iter().find(|(t, _)| *t == token) {
                return *mask;
            }
        }
        panic!("no readiness for {:?}", token);
    }

    #[test]
    fn test_accept_and_recv_translation() {
        let mut epoller = Epoller::new().unwrap();
        let mut listener = mio::net::TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        epoller
            .add_event(Token(1), &mut listener, EventMask::ACCEPT)
            .unwrap();

        let mut client = std::net::TcpStream::connect(addr).unwrap();
        assert_eq!(wait_for(&mut epoller, Token(1)), EventMask::ACCEPT);

        let (mut stream, _) = listener.accept().unwrap();
        epoller
            .add_event(Token(2), &mut stream, EventMask::RECV)
            .unwrap();
        client.write_all(b"ping").unwrap();
        assert!(wait_for(&mut epoller, Token(2)).contains(EventMask::RECV));

        // 空掩码暂时注销，之后可以重新注册
        epoller
            .add_event(Token(2), &mut stream, EventMask::empty())
            .unwrap();
        assert_eq!(epoller.registered(), 1);
        epoller
            .add_event(Token(2), &mut stream, EventMask::RECV)
            .unwrap();
        assert_eq!(epoller.registered(), 2);
        epoller.del_event(Token(2), &mut stream).unwrap();
        assert_eq!(epoller.registered(), 1);
    }
}
