//! 会话 I/O 事件
//!
//! - [`PassiveIo`]：监听 socket，接受新连接
//! - [`ActiveIo`]：进行中的主动连接
//! - [`StreamIo`]：已建立的连接，负责收发和解码

use crate::event::{EventContext, EventMask, IoEvent};
use crate::session::manager::SessionManager;
use crate::session::session::{Session, SessionState};
use mio::event::Source;
use mio::net::{TcpListener, TcpStream};
use nimbus_core::{Octets, OctetsStream};
use socket2::SockRef;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tracing::{debug, info, trace, warn};

/// 设置已建立连接的 socket 选项
pub(crate) fn configure_stream(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "设置 TCP_NODELAY 失败");
    }
    if let Err(e) = SockRef::from(stream).set_keepalive(true) {
        debug!(error = %e, "设置 SO_KEEPALIVE 失败");
    }
}

/// 监听事件
pub struct PassiveIo {
    listener: TcpListener,
    manager: Weak<SessionManager>,
}

impl PassiveIo {
    pub(crate) fn new(listener: TcpListener, manager: Weak<SessionManager>) -> Self {
        Self { listener, manager }
    }
}

impl IoEvent for PassiveIo {
    fn events(&self) -> EventMask {
        EventMask::ACCEPT
    }

    fn source(&mut self) -> Option<&mut dyn Source> {
        Some(&mut self.listener)
    }

    fn handle_event(&mut self, _cx: &mut EventContext<'_>, _active: EventMask) -> bool {
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => manager.accept(stream, peer),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // 文件描述符耗尽等错误，等下一次就绪再试
                    warn!(manager = manager.identity(), error = %e, "accept 失败");
                    break;
                }
            }
        }
        true
    }

    fn on_removed(&mut self, _cx: &mut EventContext<'_>) {
        if let Some(manager) = self.manager.upgrade() {
            info!(manager = manager.identity(), "停止监听");
        }
    }

    fn name(&self) -> &'static str {
        "passive_io"
    }
}

/// 主动连接事件
pub struct ActiveIo {
    stream: Option<TcpStream>,
    peer: SocketAddr,
    manager: Weak<SessionManager>,
    established: bool,
}

impl ActiveIo {
    pub(crate) fn new(stream: TcpStream, peer: SocketAddr, manager: Weak<SessionManager>) -> Self {
        Self {
            stream: Some(stream),
            peer,
            manager,
            established: false,
        }
    }
}

impl IoEvent for ActiveIo {
    fn events(&self) -> EventMask {
        EventMask::SEND
    }

    fn source(&mut self) -> Option<&mut dyn Source> {
        self.stream.as_mut().map(|s| s as &mut dyn Source)
    }

    fn handle_event(&mut self, _cx: &mut EventContext<'_>, active: EventMask) -> bool {
        let Some(stream) = self.stream.as_ref() else {
            return false;
        };
        match stream.take_error() {
            Ok(None) => {}
            Ok(Some(e)) | Err(e) => {
                debug!(peer = %self.peer, error = %e, "连接失败");
                return false;
            }
        }
        match stream.peer_addr() {
            Ok(_) => {
                self.established = true;
                false
            }
            Err(e) if e.kind() == io::ErrorKind::NotConnected && !active.contains(EventMask::HUP) => {
                true
            }
            Err(e) => {
                debug!(peer = %self.peer, error = %e, "连接失败");
                false
            }
        }
    }

    fn on_removed(&mut self, cx: &mut EventContext<'_>) {
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        match self.stream.take() {
            Some(stream) if self.established => {
                info!(manager = manager.identity(), peer = %self.peer, "连接已建立");
                manager.spawn_stream(stream, self.peer, cx.handle);
            }
            _ => manager.on_connect_failed(self.peer),
        }
    }

    fn name(&self) -> &'static str {
        "active_io"
    }
}

/// 已建立连接的收发事件
pub struct StreamIo {
    stream: TcpStream,
    session: Arc<Session>,
    manager: Arc<SessionManager>,
    read_buf: Octets,
    read_limit: usize,
    decode: OctetsStream,
}

impl StreamIo {
    pub(crate) fn new(stream: TcpStream, session: Arc<Session>, manager: Arc<SessionManager>) -> Self {
        let read_limit = manager.config().read_buffer_size;
        Self {
            stream,
            session,
            manager,
            read_buf: Octets::with_capacity(read_limit),
            read_limit,
            decode: OctetsStream::new(),
        }
    }

    /// 读取数据并解码，返回 `false` 表示会话应当关闭
    fn on_recv(&mut self) -> bool {
        self.session.set_state(SessionState::Recving);
        let mut closed = false;
        let mut saturated = false;
        loop {
            let room = self.read_limit - self.read_buf.len();
            if room == 0 {
                saturated = true;
                break;
            }
            match self.stream.read(&mut self.read_buf.spare_mut()[..room]) {
                Ok(0) => {
                    closed = true;
                    break;
                }
                Ok(n) => {
                    self.read_buf.advance_len(n);
                    self.manager.metrics().record_bytes_received(n as u64);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(sid = %self.session.sid(), error = %e, "读取失败");
                    closed = true;
                    break;
                }
            }
        }

        if saturated {
            self.session.forbid_recv();
        }
        if !self.read_buf.is_empty() {
            self.session.touch();
            self.decode.append(&self.read_buf);
            self.read_buf.clear();
            if !self.decode_all() {
                return false;
            }
        }
        if saturated {
            // 重新注册会再次报告尚未读完的数据
            self.session.permit_recv();
        }
        self.session.set_state(SessionState::Active);
        !closed
    }

    fn decode_all(&mut self) -> bool {
        let runtime = self.manager.runtime();
        loop {
            match runtime
                .registry()
                .decode(&mut self.decode, self.manager.forbidden())
            {
                Ok(Some(protocol)) => {
                    trace!(sid = %self.session.sid(), protocol = protocol.name(), "收到协议");
                    self.manager.metrics().record_frame_received();
                    self.manager.handle_protocol(self.session.sid(), protocol);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(sid = %self.session.sid(), peer = %self.session.peer_addr(), error = %e, "解码失败，关闭会话");
                    self.manager.metrics().record_decode_error();
                    return false;
                }
            }
        }
        if self.decode.remaining() == 0 {
            self.decode.clear();
        }
        true
    }

    /// 发送缓冲区中的数据，返回 `false` 表示会话应当关闭
    fn on_send(&mut self) -> bool {
        self.session.set_state(SessionState::Sending);
        let mut write = self.session.write_buffer().write();
        let mut sent = 0usize;
        let mut ok = true;
        while !write.pending().is_empty() {
            match self.stream.write(write.pending()) {
                Ok(0) => {
                    ok = false;
                    break;
                }
                Ok(n) => {
                    write.offset += n;
                    sent += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(sid = %self.session.sid(), error = %e, "发送失败");
                    ok = false;
                    break;
                }
            }
        }
        if sent > 0 {
            self.manager.metrics().record_bytes_sent(sent as u64);
            self.session.touch();
        }
        if write.pending().is_empty() {
            write.compact();
            self.session.forbid_send();
        } else if write.offset > write.data.len() / 2 {
            write.compact();
        }
        drop(write);
        self.session.set_state(SessionState::Active);
        ok
    }
}

impl IoEvent for StreamIo {
    fn events(&self) -> EventMask {
        self.session.mask()
    }

    fn source(&mut self) -> Option<&mut dyn Source> {
        Some(&mut self.stream)
    }

    fn handle_event(&mut self, _cx: &mut EventContext<'_>, active: EventMask) -> bool {
        if self.session.is_closing() {
            return false;
        }
        if active.contains(EventMask::SEND) && !self.on_send() {
            return false;
        }
        if active.intersects(EventMask::RECV | EventMask::HUP) && !self.on_recv() {
            return false;
        }
        true
    }

    fn on_removed(&mut self, _cx: &mut EventContext<'_>) {
        self.session.set_state(SessionState::Closing);
        self.manager.on_session_closed(&self.session);
    }

    fn name(&self) -> &'static str {
        "stream_io"
    }
}
