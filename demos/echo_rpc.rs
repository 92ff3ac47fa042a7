//! RPC 示例
//!
//! 在后台线程启动一个带 `judge` RPC 的服务，再用异步客户端调用它。
//!
//! ```bash
//! cargo run --example echo_rpc
//! ```

use nimbus::nimbus_config::{NimbusConfig, SessionManagerConfig};
use nimbus::nimbus_core::{Marshal, MarshalError, OctetsStream};
use nimbus::nimbus_network::{ProtocolContext, RpcHandler, ServerReply, SessionHandler};
use nimbus::{App, Client};
use std::collections::BTreeMap;
use std::thread;
use tracing::info;

#[derive(Debug, Clone, Default)]
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

#[derive(Debug, Clone, Default)]
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

/// 分数在 [0, 1] 内返回 0，否则返回 -1
struct Judge;

impl RpcHandler for Judge {
    type Argument = Score;
    type Result = Verdict;
    const PROTOCOL_ID: u32 = 1001;
    const NAME: &'static str = "judge";

    fn server(&self, cx: &ProtocolContext, argument: &Score, result: &mut Verdict) -> ServerReply {
        result.code = if (0.0..=1.0).contains(&argument.value) { 0 } else { -1 };
        info!(sid = %cx.sid, value = argument.value, code = result.code, "judge");
        ServerReply::Reply
    }
}

struct Gateway;

impl SessionHandler for Gateway {
    fn identity(&self) -> &str {
        "gateway"
    }
}

#[tokio::main]
async fn main() -> nimbus::Result<()> {
    nimbus::init_tracing("info")?;

    let mut managers = BTreeMap::new();
    managers.insert(
        "gateway".to_string(),
        SessionManagerConfig {
            port: 0,
            ..Default::default()
        },
    );
    let config = NimbusConfig {
        managers,
        ..Default::default()
    };

    let server = App::new(config).register_rpc(Judge)?.listen(Gateway).build()?;
    let addr = server
        .manager("gateway")
        .and_then(|m| m.local_addr())
        .ok_or_else(|| nimbus::Error::Custom("gateway 没有监听地址".to_string()))?;
    let main = server.runtime().main_reactor().clone();
    let reactor = thread::spawn(move || server.run());

    let mut client = Client::connect(addr.to_string()).await?;
    for value in [0.5, 3.0] {
        let verdict = client.call::<Judge>(&Score { value }).await?;
        info!(value, code = verdict.code, "收到结果");
    }
    client.close().await?;

    main.stop();
    reactor
        .join()
        .map_err(|_| nimbus::Error::Custom("reactor 线程异常退出".to_string()))?
}
