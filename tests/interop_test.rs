//! 异步客户端与 Reactor 服务端的互通测试
//!
//! 服务端由 `App` 在后台线程驱动，客户端走 tokio + `ProtocolCodec`。

#![cfg(all(feature = "server", feature = "client"))]

use nimbus::nimbus_config::{NimbusConfig, ReactorConfig, SessionManagerConfig, ThreadPoolConfig};
use nimbus::nimbus_core::{Marshal, MarshalError, OctetsStream};
use nimbus::nimbus_network::{
    Protocol, ProtocolContext, ReactorHandle, RpcHandler, ServerReply, SessionHandler,
};
use nimbus::{App, Client, Server};
use std::collections::BTreeMap;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

const ECHO_ID: u32 = 5;

/// 收到后把文本记下，再回一条大写的
#[derive(Debug, Default)]
struct Echo {
    text: String,
    seen: Option<mpsc::Sender<String>>,
}

impl Marshal for Echo {
    fn pack(&self, os: &mut OctetsStream) {
        os.pack(&self.text);
    }

    fn unpack(&mut self, os: &mut OctetsStream) -> Result<(), MarshalError> {
        self.text.unpack(os)
    }
}

impl Protocol for Echo {
    fn protocol_id(&self) -> u32 {
        ECHO_ID
    }

    fn name(&self) -> &'static str {
        "echo"
    }

    fn dup(&self) -> Box<dyn Protocol> {
        Box::new(Echo {
            text: String::new(),
            seen: self.seen.clone(),
        })
    }

    fn run(self: Box<Self>, cx: ProtocolContext) {
        if let Some(seen) = &self.seen {
            let _ = seen.send(self.text.clone());
        }
        cx.reply(&Echo {
            text: self.text.to_uppercase(),
            seen: None,
        });
    }
}

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

struct Judge;

impl RpcHandler for Judge {
    type Argument = Score;
    type Result = Verdict;
    const PROTOCOL_ID: u32 = 1001;
    const NAME: &'static str = "judge";

    fn server(&self, _cx: &ProtocolContext, argument: &Score, result: &mut Verdict) -> ServerReply {
        result.code = if (0.0..=1.0).contains(&argument.value) { 0 } else { -1 };
        ServerReply::Reply
    }
}

struct Gateway;

impl SessionHandler for Gateway {
    fn identity(&self) -> &str {
        "gateway"
    }
}

/// 后台线程上运行的服务
struct Background {
    addr: String,
    main: ReactorHandle,
    thread: Option<JoinHandle<nimbus::Result<()>>>,
}

impl Background {
    fn start(server: Server) -> Self {
        let addr = server
            .manager("gateway")
            .and_then(|m| m.local_addr())
            .unwrap()
            .to_string();
        let main = server.runtime().main_reactor().clone();
        let thread = thread::spawn(move || server.run());
        Self {
            addr,
            main,
            thread: Some(thread),
        }
    }
}

impl Drop for Background {
    fn drop(&mut self) {
        self.main.stop();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn config() -> NimbusConfig {
    let mut managers = BTreeMap::new();
    managers.insert(
        "gateway".to_string(),
        SessionManagerConfig {
            port: 0,
            keepalive_timeout: 0,
            ..Default::default()
        },
    );
    NimbusConfig {
        reactor: ReactorConfig {
            timeout: 10,
            ..Default::default()
        },
        threadpool: ThreadPoolConfig {
            groups: vec![(1024, 2)],
            steal: false,
        },
        managers,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_client_send_reaches_protocol_handler() {
    let (seen_tx, seen_rx) = mpsc::channel();
    let server = App::new(config())
        .stop_signals(&[])
        .register(Box::new(Echo {
            text: String::new(),
            seen: Some(seen_tx),
        }))
        .unwrap()
        .listen(Gateway)
        .build()
        .unwrap();
    let background = Background::start(server);

    let mut client = Client::connect(background.addr.clone()).await.unwrap();
    client.send(ECHO_ID, &String::from("ping")).await.unwrap();

    // 回复经由 StreamClient 收到，说明服务端已经解码并执行了协议
    let mut stream = client.into_inner();
    let (id, reply) = stream.recv_message::<String>().await.unwrap();
    assert_eq!(id, ECHO_ID);
    assert_eq!(reply, "PING");
    assert_eq!(seen_rx.try_recv().unwrap(), "ping");

    stream.close().await.unwrap();
}

#[tokio::test]
async fn test_client_rpc_against_reactor_server() {
    let server = App::new(config())
        .stop_signals(&[])
        .register_rpc(Judge)
        .unwrap()
        .listen(Gateway)
        .build()
        .unwrap();
    let background = Background::start(server);

    let mut client = Client::connect(background.addr.clone()).await.unwrap();
    let verdict = client.call::<Judge>(&Score { value: 0.5 }).await.unwrap();
    assert_eq!(verdict, Verdict { code: 0 });
    let verdict = client.call::<Judge>(&Score { value: 3.0 }).await.unwrap();
    assert_eq!(verdict, Verdict { code: -1 });
    client.close().await.unwrap();
}
