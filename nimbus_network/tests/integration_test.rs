//! Nimbus 网络层集成测试
//!
//! 在同一进程里启动多个运行时，通过本机 TCP 互相通信。

use nimbus_config::{NimbusConfig, SessionManagerConfig, ThreadPoolConfig};
use nimbus_core::{Marshal, MarshalError, OctetsStream};
use nimbus_network::protocol::encode_protocol;
use nimbus_network::{
    Protocol, ProtocolContext, RpcCallbacks, RpcHandler, Runtime, RuntimeBuilder, ServerReply,
    Session, SessionHandler, SessionId, SessionManager,
};
use parking_lot::Mutex;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, mpsc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// 测试用的协议与处理器
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
struct Score {
    value: f64,
}

impl Marshal for Score {
    fn pack(&self, os: &mut OctetsStream) {
        os.pack(&self.value);
    }

    fn unpack(&mut self, os: &mut OctetsStream) -> Result<(), MarshalError> {
        self.value.unpack(os)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Verdict {
    code: i32,
}

impl Marshal for Verdict {
    fn pack(&self, os: &mut OctetsStream) {
        os.pack(&self.code);
    }

    fn unpack(&mut self, os: &mut OctetsStream) -> Result<(), MarshalError> {
        self.code.unpack(os)
    }
}

const JUDGE_ID: u32 = 1001;

/// 分数在 [0, 1] 内返回 0，否则返回 -1
#[derive(Default)]
struct Judge {
    served: Arc<AtomicUsize>,
    delay: Duration,
    timeout: Option<Duration>,
}

impl RpcHandler for Judge {
    type Argument = Score;
    type Result = Verdict;
    const PROTOCOL_ID: u32 = JUDGE_ID;
    const NAME: &'static str = "judge";

    fn timeout(&self) -> Duration {
        self.timeout.unwrap_or(nimbus_network::rpc::DEFAULT_RPC_TIMEOUT)
    }

    fn server(&self, _cx: &ProtocolContext, argument: &Score, result: &mut Verdict) -> ServerReply {
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        self.served.fetch_add(1, Ordering::SeqCst);
        result.code = if (0.0..=1.0).contains(&argument.value) { 0 } else { -1 };
        ServerReply::Reply
    }
}

/// 把请求原样转发给后端
struct Relay {
    backend: Arc<OnceLock<(Arc<SessionManager>, SessionId)>>,
}

impl RpcHandler for Relay {
    type Argument = Score;
    type Result = Verdict;
    const PROTOCOL_ID: u32 = JUDGE_ID;
    const NAME: &'static str = "judge_relay";

    fn server(&self, _cx: &ProtocolContext, _argument: &Score, result: &mut Verdict) -> ServerReply {
        match self.backend.get() {
            Some((manager, sid)) => ServerReply::Forward {
                manager: Arc::clone(manager),
                sid: *sid,
            },
            None => {
                result.code = 99;
                ServerReply::Reply
            }
        }
    }
}

const NOTE_ID: u32 = 5;

#[derive(Debug, Default)]
struct Note {
    text: String,
    inbox: Option<Arc<Mutex<Vec<String>>>>,
}

impl Marshal for Note {
    fn pack(&self, os: &mut OctetsStream) {
        os.pack(&self.text);
    }

    fn unpack(&mut self, os: &mut OctetsStream) -> Result<(), MarshalError> {
        self.text.unpack(os)
    }
}

impl Protocol for Note {
    fn protocol_id(&self) -> u32 {
        NOTE_ID
    }

    fn name(&self) -> &'static str {
        "note"
    }

    fn dup(&self) -> Box<dyn Protocol> {
        Box::new(Note {
            text: String::new(),
            inbox: self.inbox.clone(),
        })
    }

    fn run(self: Box<Self>, _cx: ProtocolContext) {
        if let Some(inbox) = &self.inbox {
            inbox.lock().push(self.text.clone());
        }
    }
}

#[derive(Default)]
struct PeerState {
    added: Mutex<Vec<SessionId>>,
    removed: AtomicUsize,
}

struct Peer {
    identity: &'static str,
    state: Arc<PeerState>,
}

impl SessionHandler for Peer {
    fn identity(&self) -> &str {
        self.identity
    }

    fn on_add_session(&self, _manager: &SessionManager, session: &Session) {
        self.state.added.lock().push(session.sid());
    }

    fn on_del_session(&self, _manager: &SessionManager, _session: &Session) {
        self.state.removed.fetch_add(1, Ordering::SeqCst);
    }
}

fn peer(identity: &'static str) -> (Peer, Arc<PeerState>) {
    let state = Arc::new(PeerState::default());
    (
        Peer {
            identity,
            state: Arc::clone(&state),
        },
        state,
    )
}

// ---------------------------------------------------------------------------
// 辅助函数
// ---------------------------------------------------------------------------

/// 一个运行时加上驱动主 Reactor 的线程
struct Node {
    runtime: Runtime,
    thread: Option<JoinHandle<()>>,
}

impl Node {
    fn start(builder: RuntimeBuilder) -> Self {
        let (runtime, mut reactor) = builder.build().unwrap();
        let thread = thread::spawn(move || reactor.run().unwrap());
        Self {
            runtime,
            thread: Some(thread),
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.runtime.shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn config() -> NimbusConfig {
    NimbusConfig {
        threadpool: ThreadPoolConfig {
            groups: vec![(1024, 2)],
            steal: false,
        },
        ..Default::default()
    }
}

fn manager_config(port: u16) -> SessionManagerConfig {
    SessionManagerConfig {
        port,
        keepalive_timeout: 0,
        ..Default::default()
    }
}

fn wait_until(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    f()
}

fn first_session(state: &PeerState) -> SessionId {
    assert!(
        wait_until(Duration::from_secs(5), || !state.added.lock().is_empty()),
        "会话没有建立"
    );
    state.added.lock()[0]
}

/// 启动一个监听的服务端管理器
fn listen(node: &Node, identity: &'static str, config: SessionManagerConfig) -> (Arc<SessionManager>, u16, Arc<PeerState>) {
    let (handler, state) = peer(identity);
    let manager = SessionManager::with_config(&node.runtime, config, handler).unwrap();
    let port = manager.listen().unwrap().port();
    (manager, port, state)
}

/// 连接到 `port`，返回管理器和建立好的会话
fn connect(node: &Node, identity: &'static str, port: u16) -> (Arc<SessionManager>, SessionId, Arc<PeerState>) {
    let (handler, state) = peer(identity);
    let manager = SessionManager::with_config(&node.runtime, manager_config(port), handler).unwrap();
    manager.connect().unwrap();
    let sid = first_session(&state);
    (manager, sid, state)
}

// ---------------------------------------------------------------------------
// RPC
// ---------------------------------------------------------------------------

mod rpc_tests {
    use super::*;

    #[test]
    fn test_rpc_roundtrip() {
        let served = Arc::new(AtomicUsize::new(0));
        let server = Node::start(
            RuntimeBuilder::new(config())
                .register_rpc(Judge {
                    served: Arc::clone(&served),
                    ..Default::default()
                })
                .unwrap(),
        );
        let client = Node::start(RuntimeBuilder::new(config()).register_rpc(Judge::default()).unwrap());

        let (_server_mgr, port, _) = listen(&server, "server", manager_config(0));
        let (client_mgr, sid, _) = connect(&client, "client", port);

        let (tx, rx) = mpsc::channel();
        client
            .runtime
            .rpc()
            .call::<Judge>(
                &client_mgr,
                sid,
                Score { value: 0.5 },
                RpcCallbacks::new().on_result(move |argument: &Score, result: &Verdict| {
                    let _ = tx.send((argument.clone(), result.clone()));
                }),
            )
            .unwrap();

        let (argument, result) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(argument, Score { value: 0.5 });
        assert_eq!(result, Verdict { code: 0 });
        assert_eq!(served.load(Ordering::SeqCst), 1);
        assert_eq!(client.runtime.rpc().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_rpc_call_async() {
        let server = Node::start(RuntimeBuilder::new(config()).register_rpc(Judge::default()).unwrap());
        let client = Node::start(RuntimeBuilder::new(config()).register_rpc(Judge::default()).unwrap());
        let (_server_mgr, port, _) = listen(&server, "server", manager_config(0));
        let (client_mgr, sid, _) = connect(&client, "client", port);

        let call = client
            .runtime
            .rpc()
            .call_async::<Judge>(&client_mgr, sid, Score { value: 3.0 })
            .unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), call)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Verdict { code: -1 });
    }

    #[test]
    fn test_rpc_timeout_fires_once() {
        let server = Node::start(
            RuntimeBuilder::new(config())
                .register_rpc(Judge {
                    delay: Duration::from_millis(300),
                    ..Default::default()
                })
                .unwrap(),
        );
        let client = Node::start(
            RuntimeBuilder::new(config())
                .register_rpc(Judge {
                    timeout: Some(Duration::from_millis(50)),
                    ..Default::default()
                })
                .unwrap(),
        );
        let (_server_mgr, port, _) = listen(&server, "server", manager_config(0));
        let (client_mgr, sid, _) = connect(&client, "client", port);

        let results = Arc::new(AtomicUsize::new(0));
        let timeouts = Arc::new(AtomicUsize::new(0));
        let (on_result, on_timeout) = (Arc::clone(&results), Arc::clone(&timeouts));
        let trace_id = client
            .runtime
            .rpc()
            .call::<Judge>(
                &client_mgr,
                sid,
                Score { value: 0.1 },
                RpcCallbacks::new()
                    .on_result(move |_: &Score, _: &Verdict| {
                        on_result.fetch_add(1, Ordering::SeqCst);
                    })
                    .on_timeout(move |argument: &Score| {
                        assert_eq!(argument.value, 0.1);
                        on_timeout.fetch_add(1, Ordering::SeqCst);
                    }),
            )
            .unwrap();

        assert!(wait_until(Duration::from_secs(5), || timeouts.load(Ordering::SeqCst) == 1));
        assert!(!client.runtime.rpc().is_pending(trace_id));
        // 等服务端的迟到响应到达并被丢弃
        thread::sleep(Duration::from_millis(500));
        assert_eq!(timeouts.load(Ordering::SeqCst), 1);
        assert_eq!(results.load(Ordering::SeqCst), 0);
        assert!(client_mgr.find_session(sid).is_some());
    }

    #[test]
    fn test_rpc_forwarded_through_proxy() {
        let served = Arc::new(AtomicUsize::new(0));
        let backend = Node::start(
            RuntimeBuilder::new(config())
                .register_rpc(Judge {
                    served: Arc::clone(&served),
                    ..Default::default()
                })
                .unwrap(),
        );
        let target = Arc::new(OnceLock::new());
        let proxy = Node::start(
            RuntimeBuilder::new(config())
                .register_rpc(Relay {
                    backend: Arc::clone(&target),
                })
                .unwrap(),
        );
        let client = Node::start(RuntimeBuilder::new(config()).register_rpc(Judge::default()).unwrap());

        let (_backend_mgr, backend_port, _) = listen(&backend, "backend", manager_config(0));
        let (upstream, upstream_sid, _) = connect(&proxy, "upstream", backend_port);
        assert!(target.set((upstream, upstream_sid)).is_ok());
        let (_front, front_port, _) = listen(&proxy, "front", manager_config(0));
        let (client_mgr, sid, _) = connect(&client, "client", front_port);

        let (tx, rx) = mpsc::channel();
        client
            .runtime
            .rpc()
            .call::<Judge>(
                &client_mgr,
                sid,
                Score { value: 0.5 },
                RpcCallbacks::new().on_result(move |_: &Score, result: &Verdict| {
                    let _ = tx.send(result.code);
                }),
            )
            .unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 0);
        assert_eq!(served.load(Ordering::SeqCst), 1);
        assert!(wait_until(Duration::from_secs(1), || proxy.runtime.rpc().pending_count() == 0));
    }

    #[test]
    fn test_rpc_unknown_session() {
        let client = Node::start(RuntimeBuilder::new(config()).register_rpc(Judge::default()).unwrap());
        let (handler, _) = peer("client");
        let manager = SessionManager::with_config(&client.runtime, manager_config(1), handler).unwrap();
        let result = client.runtime.rpc().call::<Judge>(
            &manager,
            SessionId::new(404),
            Score { value: 0.5 },
            RpcCallbacks::new(),
        );
        assert!(result.is_err());
        assert_eq!(client.runtime.rpc().pending_count(), 0);
    }
}

// ---------------------------------------------------------------------------
// 会话
// ---------------------------------------------------------------------------

mod session_tests {
    use super::*;

    fn note_server(config: SessionManagerConfig) -> (Node, Arc<SessionManager>, u16, Arc<Mutex<Vec<String>>>) {
        let inbox = Arc::new(Mutex::new(Vec::new()));
        let node = Node::start(
            RuntimeBuilder::new(super::config())
                .register(Box::new(Note {
                    text: String::new(),
                    inbox: Some(Arc::clone(&inbox)),
                }))
                .unwrap(),
        );
        let (manager, port, _) = listen(&node, "server", config);
        (node, manager, port, inbox)
    }

    fn note_bytes(text: &str) -> Vec<u8> {
        let mut os = OctetsStream::new();
        encode_protocol(
            &Note {
                text: text.to_string(),
                inbox: None,
            },
            &mut os,
        );
        os.data().to_vec()
    }

    #[test]
    fn test_partial_delivery() {
        let (_node, manager, port, inbox) = note_server(manager_config(0));
        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream.set_nodelay(true).unwrap();

        let mut bytes = note_bytes("hello nimbus");
        bytes.extend(note_bytes("second"));
        for byte in &bytes {
            stream.write_all(std::slice::from_ref(byte)).unwrap();
            thread::sleep(Duration::from_millis(2));
        }

        assert!(wait_until(Duration::from_secs(5), || inbox.lock().len() == 2));
        assert_eq!(*inbox.lock(), vec!["hello nimbus".to_string(), "second".to_string()]);
        assert_eq!(manager.metrics().frames_received(), 2);
        assert_eq!(manager.metrics().decode_errors(), 0);
    }

    #[test]
    fn test_forbidden_protocol_closes_session() {
        let config = SessionManagerConfig {
            forbidden_protocols: vec![NOTE_ID],
            ..manager_config(0)
        };
        let (_node, manager, port, inbox) = note_server(config);
        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream.write_all(&note_bytes("blocked")).unwrap();

        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut buf = [0u8; 16];
        assert!(matches!(stream.read(&mut buf), Ok(0) | Err(_)));
        assert!(wait_until(Duration::from_secs(5), || manager.session_count() == 0));
        assert_eq!(manager.metrics().decode_errors(), 1);
        assert!(inbox.lock().is_empty());
    }

    #[test]
    fn test_max_connections() {
        let config = SessionManagerConfig {
            max_connections: 1,
            ..manager_config(0)
        };
        let (_node, manager, port, _) = note_server(config);
        let _first = TcpStream::connect(("127.0.0.1", port)).unwrap();
        assert!(wait_until(Duration::from_secs(5), || manager.session_count() == 1));

        let mut second = TcpStream::connect(("127.0.0.1", port)).unwrap();
        second.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut buf = [0u8; 4];
        assert!(matches!(second.read(&mut buf), Ok(0) | Err(_)));
        assert_eq!(manager.session_count(), 1);
        assert_eq!(manager.metrics().rejected_sessions(), 1);
    }

    #[test]
    fn test_keepalive_closes_idle_session() {
        let server = Node::start(RuntimeBuilder::new(config()));
        let server_config = SessionManagerConfig {
            keepalive_timeout: 200,
            ..manager_config(0)
        };
        let (server_mgr, port, server_state) = listen(&server, "server", server_config);

        let client = Node::start(RuntimeBuilder::new(config()));
        let (client_mgr, sid, client_state) = connect(&client, "client", port);
        assert!(wait_until(Duration::from_secs(5), || server_mgr.session_count() == 1));

        assert!(wait_until(Duration::from_secs(5), || {
            server_state.removed.load(Ordering::SeqCst) == 1
        }));
        assert!(wait_until(Duration::from_secs(5), || {
            client_state.removed.load(Ordering::SeqCst) == 1
        }));
        assert!(client_mgr.find_session(sid).is_none());
        assert_eq!(server_mgr.session_count(), 0);
    }

    #[test]
    fn test_reconnect_after_refused() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();

        let client = Node::start(RuntimeBuilder::new(config()));
        let (handler, client_state) = peer("client");
        let client_config = SessionManagerConfig {
            reconnect_interval: 50,
            ..manager_config(port)
        };
        let client_mgr = SessionManager::with_config(&client.runtime, client_config, handler).unwrap();
        let _ = client_mgr.connect();
        thread::sleep(Duration::from_millis(150));
        assert!(client_state.added.lock().is_empty());

        let server = Node::start(RuntimeBuilder::new(config()));
        let (server_mgr, _, _) = listen(&server, "server", manager_config(port));
        first_session(&client_state);
        assert!(wait_until(Duration::from_secs(5), || server_mgr.session_count() == 1));
    }

    #[test]
    fn test_shutdown_closes_sessions() {
        let server = Node::start(RuntimeBuilder::new(config()));
        let (server_mgr, port, server_state) = listen(&server, "server", manager_config(0));
        let client = Node::start(RuntimeBuilder::new(config()));
        let (_client_mgr, _sid, client_state) = connect(&client, "client", port);
        assert!(wait_until(Duration::from_secs(5), || server_mgr.session_count() == 1));

        server_mgr.shutdown();
        assert!(wait_until(Duration::from_secs(5), || {
            server_state.removed.load(Ordering::SeqCst) == 1
                && client_state.removed.load(Ordering::SeqCst) == 1
        }));
        assert_eq!(server_mgr.session_count(), 0);
    }
}
